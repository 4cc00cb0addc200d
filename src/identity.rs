// src/identity.rs

//! User identity and cryptographic attribution
//!
//! Every destructive database operation is attributed to a formatted
//! identity string "Name <email>". The durable form is a keypair under
//! `~/.noorm/`: an Ed25519 private key (mode 0600), its public key, and a
//! metadata file. The identity hash is the hex SHA-256 of the raw public
//! key bytes; the first 16 characters serve as the short id shown in
//! rosters and lock messages.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

const KEY_FILE: &str = "identity.key";
const PUB_FILE: &str = "identity.pub";
const META_FILE: &str = "identity.json";

/// Where an identity came from, in resolution precedence order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// The crypto identity stored in project state
    State,
    /// NOORM_NAME / NOORM_EMAIL environment variables
    Env,
    /// git config user.name / user.email
    Git,
    /// Operating system account
    System,
    /// Per-config override in project state
    Config,
}

impl IdentitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentitySource::State => "state",
            IdentitySource::Env => "env",
            IdentitySource::Git => "git",
            IdentitySource::System => "system",
            IdentitySource::Config => "config",
        }
    }
}

/// A resolved human identity
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub email: String,
    pub source: IdentitySource,
}

impl Identity {
    /// Formatted attribution string recorded in executed_by / locked_by
    pub fn formatted(&self) -> String {
        format_identity(&self.name, &self.email)
    }
}

/// Format the attribution string used across the tracking tables
pub fn format_identity(name: &str, email: &str) -> String {
    format!("{} <{}>", name, email)
}

/// Durable keypair-backed identity metadata, mirrored into state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CryptoIdentity {
    pub name: String,
    pub email: String,
    pub machine: String,
    pub identity_hash: String,
    pub public_key: String,
}

impl CryptoIdentity {
    /// First 16 hex characters of the identity hash
    pub fn short_id(&self) -> &str {
        &self.identity_hash[..self.identity_hash.len().min(16)]
    }
}

/// The loaded keypair plus its metadata
pub struct IdentityKeys {
    signing_key: SigningKey,
    pub metadata: CryptoIdentity,
}

impl IdentityKeys {
    /// Raw private key bytes, input to the state-encryption KDF
    pub fn private_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Identity directory: `NOORM_IDENTITY` parent if set, else `~/.noorm`
pub fn identity_dir() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("NOORM_IDENTITY") {
        let key_path = PathBuf::from(path);
        return Ok(key_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(key_path));
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Identity("cannot determine home directory".to_string()))?;
    Ok(home.join(".noorm"))
}

/// Hex SHA-256 of raw public key bytes
pub fn identity_hash(public_key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Load the keypair from `dir`, generating and persisting a fresh one on
/// first run. The private key file is written with mode 0600.
pub fn load_or_generate(dir: &Path, name: &str, email: &str) -> Result<IdentityKeys> {
    let key_path = dir.join(KEY_FILE);
    if key_path.exists() {
        return load(dir);
    }

    info!("Generating new identity keypair in {}", dir.display());
    fs::create_dir_all(dir)?;

    let signing_key = SigningKey::generate(&mut OsRng);
    let public = signing_key.verifying_key();

    fs::write(&key_path, BASE64.encode(signing_key.to_bytes()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&key_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&key_path, perms)?;
    }

    fs::write(dir.join(PUB_FILE), BASE64.encode(public.as_bytes()))?;

    let metadata = CryptoIdentity {
        name: name.to_string(),
        email: email.to_string(),
        machine: machine_name(),
        identity_hash: identity_hash(&public),
        public_key: BASE64.encode(public.as_bytes()),
    };
    fs::write(
        dir.join(META_FILE),
        serde_json::to_string_pretty(&metadata).map_err(|e| Error::InvalidArtifact {
            what: "identity metadata",
            message: e.to_string(),
        })?,
    )?;

    Ok(IdentityKeys {
        signing_key,
        metadata,
    })
}

/// Load an existing keypair and its metadata from `dir`
pub fn load(dir: &Path) -> Result<IdentityKeys> {
    let key_path = dir.join(KEY_FILE);
    let encoded = fs::read_to_string(&key_path)
        .map_err(|e| Error::Identity(format!("cannot read {}: {}", key_path.display(), e)))?;
    let raw = BASE64
        .decode(encoded.trim())
        .map_err(|_| Error::Identity(format!("{} is not valid base64", key_path.display())))?;
    let bytes: [u8; SECRET_KEY_LENGTH] = raw
        .try_into()
        .map_err(|_| Error::Identity(format!("{} has the wrong key length", key_path.display())))?;
    let signing_key = SigningKey::from_bytes(&bytes);

    let meta_path = dir.join(META_FILE);
    let metadata: CryptoIdentity = match fs::read_to_string(&meta_path) {
        Ok(json) => serde_json::from_str(&json).map_err(|e| Error::InvalidArtifact {
            what: "identity metadata",
            message: e.to_string(),
        })?,
        // Metadata can be regenerated from the key; only the hash is fixed.
        Err(_) => {
            debug!("Identity metadata missing, rebuilding from key");
            let public = signing_key.verifying_key();
            CryptoIdentity {
                name: String::new(),
                email: String::new(),
                machine: machine_name(),
                identity_hash: identity_hash(&public),
                public_key: BASE64.encode(public.as_bytes()),
            }
        }
    };

    Ok(IdentityKeys {
        signing_key,
        metadata,
    })
}

/// Inputs to identity resolution, highest precedence first
#[derive(Debug, Default)]
pub struct ResolveOptions {
    pub crypto_identity: Option<(String, String)>,
    pub config_override: Option<(String, String)>,
}

/// Pick the identity from the first available source: state keypair
/// metadata, environment, git config, system account, config override.
pub fn resolve_identity(opts: &ResolveOptions) -> Identity {
    if let Some((name, email)) = &opts.crypto_identity {
        if !name.is_empty() {
            return Identity {
                name: name.clone(),
                email: email.clone(),
                source: IdentitySource::State,
            };
        }
    }

    if let (Ok(name), Ok(email)) = (std::env::var("NOORM_NAME"), std::env::var("NOORM_EMAIL")) {
        if !name.is_empty() && !email.is_empty() {
            return Identity {
                name,
                email,
                source: IdentitySource::Env,
            };
        }
    }

    if let Some((name, email)) = git_identity() {
        return Identity {
            name,
            email,
            source: IdentitySource::Git,
        };
    }

    if let Some(identity) = system_identity() {
        return identity;
    }

    if let Some((name, email)) = &opts.config_override {
        return Identity {
            name: name.clone(),
            email: email.clone(),
            source: IdentitySource::Config,
        };
    }

    // Nothing resolved at all; attribution still needs a value
    Identity {
        name: "unknown".to_string(),
        email: format!("unknown@{}", machine_name()),
        source: IdentitySource::System,
    }
}

/// Read user.name / user.email from git config, if git is installed
fn git_identity() -> Option<(String, String)> {
    let name = git_config_value("user.name")?;
    let email = git_config_value("user.email")?;
    Some((name, email))
}

fn git_config_value(key: &str) -> Option<String> {
    let output = Command::new("git")
        .args(["config", "--get", key])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn system_identity() -> Option<Identity> {
    let user = whoami::username();
    if user.is_empty() {
        return None;
    }
    let name = {
        let real = whoami::realname();
        if real.is_empty() {
            user.clone()
        } else {
            real
        }
    };
    Some(Identity {
        name,
        email: format!("{}@{}", user, machine_name()),
        source: IdentitySource::System,
    })
}

fn machine_name() -> String {
    whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    // Resolution reads process-global state (env vars, git config);
    // serialize the tests that touch it
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_generate_writes_key_files() {
        let dir = tempdir().unwrap();
        let keys = load_or_generate(dir.path(), "Alice", "alice@example.com").unwrap();

        assert!(dir.path().join(KEY_FILE).exists());
        assert!(dir.path().join(PUB_FILE).exists());
        assert!(dir.path().join(META_FILE).exists());
        assert_eq!(keys.metadata.name, "Alice");
        assert_eq!(keys.metadata.identity_hash.len(), 64);
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        load_or_generate(dir.path(), "Alice", "alice@example.com").unwrap();

        let mode = fs::metadata(dir.path().join(KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_load_roundtrips_keypair() {
        let dir = tempdir().unwrap();
        let generated = load_or_generate(dir.path(), "Alice", "alice@example.com").unwrap();
        let loaded = load(dir.path()).unwrap();

        assert_eq!(
            generated.private_key_bytes(),
            loaded.private_key_bytes()
        );
        assert_eq!(generated.metadata, loaded.metadata);
    }

    #[test]
    fn test_second_generate_keeps_existing_key() {
        let dir = tempdir().unwrap();
        let first = load_or_generate(dir.path(), "Alice", "alice@example.com").unwrap();
        let second = load_or_generate(dir.path(), "Bob", "bob@example.com").unwrap();

        // The keypair is durable; a later call must not rotate it
        assert_eq!(first.private_key_bytes(), second.private_key_bytes());
        assert_eq!(second.metadata.name, "Alice");
    }

    #[test]
    fn test_identity_hash_matches_public_key() {
        let dir = tempdir().unwrap();
        let keys = load_or_generate(dir.path(), "Alice", "alice@example.com").unwrap();

        let expected = identity_hash(&keys.verifying_key());
        assert_eq!(keys.metadata.identity_hash, expected);
        assert_eq!(keys.metadata.short_id().len(), 16);
    }

    #[test]
    fn test_formatted_identity() {
        assert_eq!(
            format_identity("Alice", "alice@example.com"),
            "Alice <alice@example.com>"
        );
    }

    #[test]
    fn test_resolve_prefers_crypto_identity() {
        let _guard = ENV_LOCK.lock().unwrap();
        let opts = ResolveOptions {
            crypto_identity: Some(("Alice".into(), "alice@example.com".into())),
            config_override: Some(("Other".into(), "other@example.com".into())),
        };
        let identity = resolve_identity(&opts);
        assert_eq!(identity.source, IdentitySource::State);
        assert_eq!(identity.formatted(), "Alice <alice@example.com>");
    }

    #[test]
    fn test_resolve_falls_back_to_some_source() {
        let _guard = ENV_LOCK.lock().unwrap();
        let identity = resolve_identity(&ResolveOptions::default());
        assert!(!identity.name.is_empty());
        assert!(!identity.email.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_account_outranks_config_override() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("NOORM_NAME");
        std::env::remove_var("NOORM_EMAIL");
        // Blind git to any user.name/user.email so the git source is
        // unavailable, the way a fresh CI box looks
        std::env::set_var("GIT_CONFIG_GLOBAL", "/dev/null");
        std::env::set_var("GIT_CONFIG_SYSTEM", "/dev/null");
        std::env::set_var("GIT_CONFIG_NOSYSTEM", "1");

        let opts = ResolveOptions {
            crypto_identity: None,
            config_override: Some(("Override".into(), "override@example.com".into())),
        };
        let identity = resolve_identity(&opts);

        std::env::remove_var("GIT_CONFIG_GLOBAL");
        std::env::remove_var("GIT_CONFIG_SYSTEM");
        std::env::remove_var("GIT_CONFIG_NOSYSTEM");

        // The OS account is an available source and sits ahead of the
        // per-config override in precedence
        assert_eq!(identity.source, IdentitySource::System);
        assert_ne!(identity.formatted(), "Override <override@example.com>");
    }
}
