// src/error.rs

use thiserror::Error;

/// Core error types for noorm
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An on-disk artifact (state, settings, or tracking tables) is newer
    /// than this binary understands
    #[error("{layer} is at version {found} but this build supports up to {supported}; upgrade noorm")]
    VersionMismatch {
        layer: &'static str,
        found: i64,
        supported: i64,
    },

    /// A pending migration raised; the layer stays at its prior version
    #[error("Migration of {layer} to version {version} failed: {message}")]
    MigrationFailure {
        layer: &'static str,
        version: i64,
        message: String,
    },

    /// The lock is held by another live identity
    #[error("Lock on '{config}' is held by {holder} since {since}")]
    LockAcquire {
        config: String,
        holder: String,
        since: String,
    },

    /// Release attempted by an identity that does not hold the lock
    #[error("Lock on '{config}' is held by {holder}, not by {requester}")]
    LockOwnership {
        config: String,
        holder: String,
        requester: String,
    },

    /// The lock expired underneath an operation that assumed it was held
    #[error("Lock on '{config}' expired at {expired_at}")]
    LockExpired { config: String, expired_at: String },

    /// A change directory failed structural validation
    #[error("Invalid change '{name}': {reason}")]
    ChangeValidation { name: String, reason: String },

    /// The named change does not exist on disk
    #[error("Change not found: {0}")]
    ChangeNotFound(String),

    /// The change is already applied and force was not given
    #[error("Change '{0}' is already applied")]
    AlreadyApplied(String),

    /// Revert requested for a change that was never applied
    #[error("Change '{0}' has not been applied")]
    NotApplied(String),

    /// The change exists in history but its files are gone from disk
    #[error("Change '{0}' is orphaned: recorded in history but missing on disk")]
    Orphaned(String),

    /// A manifest line points at a file that does not exist
    #[error("Manifest {manifest} references missing file: {target}")]
    ManifestReference { manifest: String, target: String },

    /// Transient connection failure, retried by the factory
    #[error("Connection to '{config}' failed: {message}")]
    ConnectionTransient { config: String, message: String },

    /// Authentication rejected; never retried
    #[error("Authentication failed for '{config}': {message}")]
    ConnectionAuth { config: String, message: String },

    /// No driver is registered for the requested dialect
    #[error("No driver available for dialect '{dialect}'; {hint}")]
    MissingDriver { dialect: String, hint: String },

    /// Decryption failed: wrong key or a tampered payload
    #[error("Failed to decrypt {what}: wrong key or corrupted data")]
    DecryptFailure { what: &'static str },

    /// A destructive operation targeted a protected config
    #[error("Config '{config}' is protected; confirm with 'yes-{config}' or set NOORM_YES=1")]
    ProtectedAction { config: String },

    /// Template rendering failed
    #[error("Template error in {path}: {message}")]
    Template { path: String, message: String },

    /// Named config does not exist in state
    #[error("Unknown config: {0}")]
    UnknownConfig(String),

    /// State file, settings file, or identity is malformed
    #[error("Invalid {what}: {message}")]
    InvalidArtifact { what: &'static str, message: String },

    /// Stage constraints rejected a config mutation
    #[error("Stage '{stage}' rejects this change to config '{config}': {reason}")]
    StageConstraint {
        stage: String,
        config: String,
        reason: String,
    },

    /// Identity material is missing or unreadable
    #[error("Identity error: {0}")]
    Identity(String),

    /// A second lifecycle manager tried to register signal handlers
    #[error("A lifecycle manager is already active in this process")]
    LifecycleActive,
}

impl Error {
    /// Whether the connection factory should retry this error
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ConnectionTransient { .. })
    }

    /// Stable machine-readable kind tag, used by --json output and the log
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::VersionMismatch { .. } => "version_mismatch",
            Error::MigrationFailure { .. } => "migration_failure",
            Error::LockAcquire { .. } => "lock_acquire",
            Error::LockOwnership { .. } => "lock_ownership",
            Error::LockExpired { .. } => "lock_expired",
            Error::ChangeValidation { .. } => "change_validation",
            Error::ChangeNotFound(_) => "change_not_found",
            Error::AlreadyApplied(_) => "already_applied",
            Error::NotApplied(_) => "not_applied",
            Error::Orphaned(_) => "orphaned",
            Error::ManifestReference { .. } => "manifest_reference",
            Error::ConnectionTransient { .. } => "connection_transient",
            Error::ConnectionAuth { .. } => "connection_auth",
            Error::MissingDriver { .. } => "missing_driver",
            Error::DecryptFailure { .. } => "decrypt_failure",
            Error::ProtectedAction { .. } => "protected_action",
            Error::Template { .. } => "template",
            Error::UnknownConfig(_) => "unknown_config",
            Error::InvalidArtifact { .. } => "invalid_artifact",
            Error::StageConstraint { .. } => "stage_constraint",
            Error::Identity(_) => "identity",
            Error::LifecycleActive => "lifecycle_active",
        }
    }
}

/// Result type alias using noorm's Error type
pub type Result<T> = std::result::Result<T, Error>;
