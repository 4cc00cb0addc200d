// src/state/migrations.rs

//! State-layer schema migrations
//!
//! Pure transforms over the decrypted JSON value, applied in order before
//! the payload is deserialized into `State`. Mirrors the mechanism the
//! tracking-table layer uses: a version constant, a linear list, and a
//! refusal to touch files newer than this binary.

use crate::error::{Error, Result};
use serde_json::{json, Value};
use tracing::info;

/// Version the `State` struct expects
pub const STATE_VERSION: i64 = 2;

const LAYER: &str = "state file";

/// Read the schemaVersion field from a raw state value
pub fn version_of(raw: &Value) -> i64 {
    raw.get("schemaVersion").and_then(Value::as_i64).unwrap_or(1)
}

/// Bring a raw state value up to `STATE_VERSION`.
///
/// Idempotent once current. Newer-than-binary files are refused.
pub fn migrate(raw: &mut Value) -> Result<()> {
    let mut current = version_of(raw);

    if current > STATE_VERSION {
        return Err(Error::VersionMismatch {
            layer: LAYER,
            found: current,
            supported: STATE_VERSION,
        });
    }

    while current < STATE_VERSION {
        let next = current + 1;
        info!("Migrating state file to version {}", next);
        match next {
            2 => migrate_v2(raw)?,
            _ => {
                return Err(Error::MigrationFailure {
                    layer: "state",
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

/// v2: introduce app-level secrets and the collaborator roster.
///
/// v1 state predates shared use; it had only configs, per-config secrets,
/// and the active config marker.
fn migrate_v2(raw: &mut Value) -> Result<()> {
    let obj = raw.as_object_mut().ok_or_else(|| Error::MigrationFailure {
        layer: "state",
        version: 2,
        message: "state payload is not a JSON object".to_string(),
    })?;

    obj.entry("globalSecrets").or_insert_with(|| json!({}));
    obj.entry("knownUsers").or_insert_with(|| json!({}));
    obj.entry("identity").or_insert(Value::Null);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrates_v1_to_current() {
        let mut raw = json!({
            "schemaVersion": 1,
            "activeConfig": "dev",
            "configs": {},
            "secrets": {}
        });

        migrate(&mut raw).unwrap();

        assert_eq!(version_of(&raw), STATE_VERSION);
        assert!(raw["globalSecrets"].is_object());
        assert!(raw["knownUsers"].is_object());
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut raw = json!({ "schemaVersion": 1, "configs": {}, "secrets": {} });
        migrate(&mut raw).unwrap();
        let after_first = raw.clone();
        migrate(&mut raw).unwrap();
        assert_eq!(raw, after_first);
    }

    #[test]
    fn test_newer_file_is_refused() {
        let mut raw = json!({ "schemaVersion": STATE_VERSION + 1 });
        let err = migrate(&mut raw).unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
        // The payload must be left untouched
        assert_eq!(version_of(&raw), STATE_VERSION + 1);
    }

    #[test]
    fn test_missing_version_treated_as_v1() {
        let mut raw = json!({ "configs": {} });
        migrate(&mut raw).unwrap();
        assert_eq!(version_of(&raw), STATE_VERSION);
    }
}
