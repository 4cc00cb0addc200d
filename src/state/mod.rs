// src/state/mod.rs

//! Encrypted project state store
//!
//! Owns the single in-memory `State` object and the `.noorm/state.enc`
//! file behind it. Every mutation goes through this API and triggers
//! immediate re-encryption and an atomic rewrite (temp file + rename), so
//! the on-disk blob is never a partial write.

pub mod migrations;
pub mod model;

use crate::crypto::{self, EncryptedPayload};
use crate::error::{Error, Result};
use crate::identity::CryptoIdentity;
use chrono::Utc;
use model::{Config, KnownUser, State};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const STATE_FILE: &str = "state.enc";

/// The encrypted state store
pub struct StateStore {
    path: PathBuf,
    key: [u8; 32],
    state: State,
}

impl StateStore {
    /// Open the store under `noorm_dir`, decrypting with `key`.
    ///
    /// A missing file yields an empty state at the current version with no
    /// error; a present-but-undecryptable file is fatal.
    pub fn open(noorm_dir: &Path, key: [u8; 32]) -> Result<Self> {
        let path = noorm_dir.join(STATE_FILE);

        if !path.exists() {
            debug!("No state file at {}, starting empty", path.display());
            return Ok(Self {
                path,
                key,
                state: State::empty(migrations::STATE_VERSION),
            });
        }

        let blob = fs::read_to_string(&path)?;
        let (state, migrated) = decode_state(&blob, &key)?;

        let store = Self { path, key, state };
        if migrated {
            store.persist()?;
        }
        Ok(store)
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Encrypt and atomically rewrite the state file
    pub fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let plaintext =
            serde_json::to_vec(&self.state).map_err(|e| Error::InvalidArtifact {
                what: "state file",
                message: e.to_string(),
            })?;
        let payload = crypto::encrypt(&plaintext, &self.key)?;
        let blob = serde_json::to_string(&payload).map_err(|e| Error::InvalidArtifact {
            what: "state file",
            message: e.to_string(),
        })?;

        let tmp = self.path.with_extension("enc.tmp");
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, &self.path)?;
        debug!("State persisted to {}", self.path.display());
        Ok(())
    }

    /// The encrypted blob as it would land on disk
    pub fn export_encrypted(&self) -> Result<String> {
        let plaintext =
            serde_json::to_vec(&self.state).map_err(|e| Error::InvalidArtifact {
                what: "state file",
                message: e.to_string(),
            })?;
        let payload = crypto::encrypt(&plaintext, &self.key)?;
        serde_json::to_string(&payload).map_err(|e| Error::InvalidArtifact {
            what: "state file",
            message: e.to_string(),
        })
    }

    /// Replace the in-memory state with an imported blob and persist.
    ///
    /// On any decode or decrypt failure the current state is untouched.
    pub fn import_encrypted(&mut self, blob: &str) -> Result<()> {
        let (imported, _) = decode_state(blob, &self.key)?;
        self.state = imported;
        self.persist()?;
        info!("State imported");
        Ok(())
    }

    // ---- config lifecycle ----

    pub fn config(&self, name: &str) -> Result<&Config> {
        self.state
            .configs
            .get(name)
            .ok_or_else(|| Error::UnknownConfig(name.to_string()))
    }

    pub fn set_active_config(&mut self, name: &str) -> Result<()> {
        if !self.state.configs.contains_key(name) {
            return Err(Error::UnknownConfig(name.to_string()));
        }
        self.state.active_config = Some(name.to_string());
        self.persist()
    }

    pub fn upsert_config(&mut self, name: &str, config: Config) -> Result<()> {
        self.state.configs.insert(name.to_string(), config);
        self.persist()
    }

    /// Remove a config together with its secret subtree
    pub fn remove_config(&mut self, name: &str) -> Result<()> {
        if self.state.configs.remove(name).is_none() {
            return Err(Error::UnknownConfig(name.to_string()));
        }
        self.state.secrets.remove(name);
        if self.state.active_config.as_deref() == Some(name) {
            self.state.active_config = None;
        }
        self.persist()
    }

    // ---- secrets ----

    /// Set a config-scoped secret. The config must exist.
    pub fn set_secret(&mut self, config: &str, key: &str, value: &str) -> Result<()> {
        if !self.state.configs.contains_key(config) {
            return Err(Error::UnknownConfig(config.to_string()));
        }
        self.state
            .secrets
            .entry(config.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        self.persist()
    }

    pub fn unset_secret(&mut self, config: &str, key: &str) -> Result<()> {
        if let Some(map) = self.state.secrets.get_mut(config) {
            map.remove(key);
            if map.is_empty() {
                self.state.secrets.remove(config);
            }
        }
        self.persist()
    }

    pub fn set_global_secret(&mut self, key: &str, value: &str) -> Result<()> {
        self.state
            .global_secrets
            .insert(key.to_string(), value.to_string());
        self.persist()
    }

    pub fn unset_global_secret(&mut self, key: &str) -> Result<()> {
        self.state.global_secrets.remove(key);
        self.persist()
    }

    /// Secrets visible to a render for one config
    pub fn secrets_for(&self, config: &str) -> std::collections::BTreeMap<String, String> {
        self.state.secrets.get(config).cloned().unwrap_or_default()
    }

    // ---- identity / roster ----

    pub fn set_identity(&mut self, identity: CryptoIdentity) -> Result<()> {
        self.state.identity = Some(identity);
        self.persist()
    }

    /// Merge a collaborator into the roster, keeping the earliest
    /// first-seen timestamp.
    pub fn record_known_user(
        &mut self,
        hash: &str,
        name: &str,
        email: &str,
        machine: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.state
            .known_users
            .entry(hash.to_string())
            .and_modify(|user| {
                user.name = name.to_string();
                user.email = email.to_string();
                user.machine = machine.to_string();
                user.last_seen = now.clone();
            })
            .or_insert_with(|| KnownUser {
                name: name.to_string(),
                email: email.to_string(),
                machine: machine.to_string(),
                first_seen: now.clone(),
                last_seen: now,
            });
        self.persist()
    }
}

/// Decrypt and migrate a raw blob into a `State`. The flag reports whether
/// a migration ran, so the caller can persist the upgraded form.
fn decode_state(blob: &str, key: &[u8; 32]) -> Result<(State, bool)> {
    let payload: EncryptedPayload =
        serde_json::from_str(blob).map_err(|e| Error::InvalidArtifact {
            what: "state file",
            message: e.to_string(),
        })?;
    let plaintext = crypto::decrypt(&payload, key)?;

    let mut raw: serde_json::Value =
        serde_json::from_slice(&plaintext).map_err(|e| Error::InvalidArtifact {
            what: "state file",
            message: e.to_string(),
        })?;
    let before = migrations::version_of(&raw);
    migrations::migrate(&mut raw)?;
    let migrated = before != migrations::STATE_VERSION;

    let state = serde_json::from_value(raw).map_err(|e| Error::InvalidArtifact {
        what: "state file",
        message: e.to_string(),
    })?;
    Ok((state, migrated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;
    use crate::db::adapter::Dialect;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> StateStore {
        StateStore::open(dir, derive_key(b"test key")).unwrap()
    }

    #[test]
    fn test_missing_file_yields_empty_state() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        assert_eq!(store.state().schema_version, migrations::STATE_VERSION);
        assert!(store.state().configs.is_empty());
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .upsert_config("dev", Config::new(Dialect::Sqlite, "dev.db"))
            .unwrap();
        store.set_active_config("dev").unwrap();

        let reloaded = open_store(dir.path());
        assert_eq!(reloaded.state().active_config.as_deref(), Some("dev"));
        assert!(reloaded.state().configs.contains_key("dev"));
    }

    #[test]
    fn test_wrong_key_fails_load() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .upsert_config("dev", Config::new(Dialect::Sqlite, "dev.db"))
            .unwrap();

        let result = StateStore::open(dir.path(), derive_key(b"another key"));
        assert!(matches!(result, Err(Error::DecryptFailure { .. })));
    }

    #[test]
    fn test_tampered_file_fails_load() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .upsert_config("dev", Config::new(Dialect::Sqlite, "dev.db"))
            .unwrap();

        // Flip one byte inside the base64 ciphertext
        let path = dir.path().join(STATE_FILE);
        let blob = fs::read_to_string(&path).unwrap();
        let mut payload: EncryptedPayload = serde_json::from_str(&blob).unwrap();
        let mut chars: Vec<char> = payload.ciphertext.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        payload.ciphertext = chars.into_iter().collect();
        fs::write(&path, serde_json::to_string(&payload).unwrap()).unwrap();

        let result = StateStore::open(dir.path(), derive_key(b"test key"));
        assert!(result.is_err());
    }

    #[test]
    fn test_secret_requires_existing_config() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());

        let result = store.set_secret("ghost", "k", "v");
        assert!(matches!(result, Err(Error::UnknownConfig(_))));
    }

    #[test]
    fn test_remove_config_drops_secret_subtree() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .upsert_config("dev", Config::new(Dialect::Sqlite, "dev.db"))
            .unwrap();
        store.set_secret("dev", "api_key", "abc").unwrap();

        store.remove_config("dev").unwrap();
        assert!(store.secrets_for("dev").is_empty());
        assert!(store.state().configs.is_empty());
    }

    #[test]
    fn test_global_secrets_independent_of_configs() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store.set_global_secret("org_token", "xyz").unwrap();

        let reloaded = open_store(dir.path());
        assert_eq!(
            reloaded.state().global_secrets.get("org_token").map(String::as_str),
            Some("xyz")
        );
    }

    #[test]
    fn test_export_import_roundtrip() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .upsert_config("dev", Config::new(Dialect::Sqlite, "dev.db"))
            .unwrap();

        let blob = store.export_encrypted().unwrap();

        let other_dir = tempdir().unwrap();
        let mut other = open_store(other_dir.path());
        other.import_encrypted(&blob).unwrap();
        assert!(other.state().configs.contains_key("dev"));
    }

    #[test]
    fn test_import_failure_leaves_state_untouched() {
        let dir = tempdir().unwrap();
        let mut store = open_store(dir.path());
        store
            .upsert_config("dev", Config::new(Dialect::Sqlite, "dev.db"))
            .unwrap();

        let result = store.import_encrypted("{\"algorithm\":\"aes-256-gcm\",\"iv\":\"!!\",\"authTag\":\"\",\"ciphertext\":\"\"}");
        assert!(result.is_err());
        assert!(store.state().configs.contains_key("dev"));
    }
}
