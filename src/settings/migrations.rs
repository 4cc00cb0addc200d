// src/settings/migrations.rs

//! Settings-layer schema migrations
//!
//! Same linear mechanism as the state layer, operating on the YAML-parsed
//! value. Only v1 exists today; the machinery is what future versions hook
//! into.

use crate::error::{Error, Result};
use serde_json::{json, Value};
use tracing::info;

/// Version the `Settings` struct expects
pub const SETTINGS_VERSION: i64 = 1;

const LAYER: &str = "settings file";

pub fn version_of(raw: &Value) -> i64 {
    raw.get("schemaVersion").and_then(Value::as_i64).unwrap_or(0)
}

/// Bring a raw settings value up to `SETTINGS_VERSION`
pub fn migrate(raw: &mut Value) -> Result<()> {
    let mut current = version_of(raw);

    if current > SETTINGS_VERSION {
        return Err(Error::VersionMismatch {
            layer: LAYER,
            found: current,
            supported: SETTINGS_VERSION,
        });
    }

    while current < SETTINGS_VERSION {
        let next = current + 1;
        info!("Migrating settings file to version {}", next);
        match next {
            1 => migrate_v1(raw)?,
            _ => {
                return Err(Error::MigrationFailure {
                    layer: "settings",
                    version: next,
                    message: "no migration registered".to_string(),
                })
            }
        }
        raw["schemaVersion"] = json!(next);
        current = next;
    }

    Ok(())
}

/// v1: stamp the version onto pre-versioned files
fn migrate_v1(raw: &mut Value) -> Result<()> {
    if !raw.is_object() {
        return Err(Error::MigrationFailure {
            layer: "settings",
            version: 1,
            message: "settings payload is not a mapping".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unversioned_file_gets_stamped() {
        let mut raw = json!({ "strict": true });
        migrate(&mut raw).unwrap();
        assert_eq!(version_of(&raw), SETTINGS_VERSION);
        assert_eq!(raw["strict"], json!(true));
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut raw = json!({ "schemaVersion": SETTINGS_VERSION });
        let before = raw.clone();
        migrate(&mut raw).unwrap();
        assert_eq!(raw, before);
    }

    #[test]
    fn test_newer_file_is_refused() {
        let mut raw = json!({ "schemaVersion": SETTINGS_VERSION + 5 });
        assert!(matches!(
            migrate(&mut raw),
            Err(Error::VersionMismatch { .. })
        ));
    }
}
