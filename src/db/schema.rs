// src/db/schema.rs

//! Internal tracking tables and their migrations
//!
//! noorm keeps its own bookkeeping in tables prefixed `__noorm_` inside
//! the target database, so they are immediately distinguishable from user
//! tables. This module creates them and evolves them over time: the
//! database is one of the three version layers, tracked in
//! `__noorm_version__` under the `schema` tag.

use crate::db::adapter::{Driver, Value};
use crate::error::{Error, Result};
use tracing::{debug, info};

/// Current schema version of the tracking tables
pub const SCHEMA_VERSION: i64 = 2;

/// Layer tag written to the version table
const LAYER: &str = "schema";

pub const VERSION_TABLE: &str = "__noorm_version__";
pub const CHANGE_TABLE: &str = "__noorm_change__";
pub const EXECUTIONS_TABLE: &str = "__noorm_executions__";
pub const LOCK_TABLE: &str = "__noorm_lock__";
pub const IDENTITIES_TABLE: &str = "__noorm_identities__";

/// Initialize the version tracking table
fn init_version_table(driver: &mut dyn Driver) -> Result<()> {
    driver.execute_batch(
        "CREATE TABLE IF NOT EXISTS __noorm_version__ (
            layer TEXT NOT NULL,
            version INTEGER NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            applied_by TEXT NOT NULL,
            cli_version TEXT NOT NULL,
            UNIQUE(layer, version)
        )",
    )?;
    Ok(())
}

/// Get the current schema version recorded in the database
pub fn get_schema_version(driver: &mut dyn Driver) -> Result<i64> {
    init_version_table(driver)?;

    let rows = driver.query(
        "SELECT version FROM __noorm_version__ WHERE layer = ?1 ORDER BY version DESC LIMIT 1",
        &[Value::from(LAYER)],
    )?;
    Ok(rows.first().and_then(|row| row.i64("version")).unwrap_or(0))
}

fn set_schema_version(driver: &mut dyn Driver, version: i64, applied_by: &str) -> Result<()> {
    driver.execute(
        "INSERT INTO __noorm_version__ (layer, version, applied_by, cli_version)
         VALUES (?1, ?2, ?3, ?4)",
        &[
            Value::from(LAYER),
            Value::from(version),
            Value::from(applied_by),
            Value::from(env!("CARGO_PKG_VERSION")),
        ],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the tracking tables up to date.
///
/// Idempotent: a current database is left untouched. A database stamped
/// newer than this binary raises `VersionMismatch` and nothing runs.
pub fn migrate(driver: &mut dyn Driver, applied_by: &str) -> Result<()> {
    let current = get_schema_version(driver)?;
    debug!("Tracking tables at version {}", current);

    if current > SCHEMA_VERSION {
        return Err(Error::VersionMismatch {
            layer: "tracking tables",
            found: current,
            supported: SCHEMA_VERSION,
        });
    }
    if current == SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current + 1)..=SCHEMA_VERSION {
        info!("Applying tracking-table migration to version {}", version);
        apply_migration(driver, version).map_err(|e| Error::MigrationFailure {
            layer: "schema",
            version,
            message: e.to_string(),
        })?;
        set_schema_version(driver, version, applied_by)?;
    }

    info!("Tracking tables now at version {}", SCHEMA_VERSION);
    Ok(())
}

fn apply_migration(driver: &mut dyn Driver, version: i64) -> Result<()> {
    match version {
        1 => migrate_v1(driver),
        2 => migrate_v2(driver),
        _ => Err(Error::MigrationFailure {
            layer: "schema",
            version,
            message: "unknown migration version".to_string(),
        }),
    }
}

/// Initial schema - Version 1
///
/// Creates the operation ledger:
/// - __noorm_change__: one row per forward or revert operation
/// - __noorm_executions__: one row per file executed inside an operation
///   (change_id is NULL for builder runs)
/// - __noorm_lock__: the cooperative write lock, one row per config
fn migrate_v1(driver: &mut dyn Driver) -> Result<()> {
    debug!("Creating tracking tables version 1");

    driver.execute_batch(
        "
        -- Changes: one row per apply/revert operation
        CREATE TABLE __noorm_change__ (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            direction TEXT NOT NULL CHECK(direction IN ('apply', 'revert')),
            status TEXT NOT NULL CHECK(status IN ('running', 'success', 'failed')),
            executed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            executed_by TEXT NOT NULL,
            duration_ms INTEGER,
            error_message TEXT,
            checksum TEXT
        );

        CREATE INDEX idx_noorm_change_name ON __noorm_change__(name);
        CREATE INDEX idx_noorm_change_status ON __noorm_change__(status);

        -- Executions: one row per file inside an operation
        CREATE TABLE __noorm_executions__ (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            change_id INTEGER,
            filepath TEXT NOT NULL,
            file_type TEXT NOT NULL CHECK(file_type IN ('sql', 'manifest')),
            checksum TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('success', 'failed', 'skipped')),
            skip_reason TEXT,
            error_message TEXT,
            duration_ms INTEGER,
            executed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (change_id) REFERENCES __noorm_change__(id)
        );

        CREATE INDEX idx_noorm_executions_change ON __noorm_executions__(change_id);
        CREATE INDEX idx_noorm_executions_filepath ON __noorm_executions__(filepath);

        -- Lock: at most one writer per config
        CREATE TABLE __noorm_lock__ (
            config_name TEXT PRIMARY KEY,
            locked_by TEXT NOT NULL,
            locked_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        ",
    )?;

    Ok(())
}

/// Version 2: collaborator roster
///
/// Adds the seen-before identities table synced into local state.
fn migrate_v2(driver: &mut dyn Driver) -> Result<()> {
    debug!("Migrating tracking tables to version 2");

    driver.execute_batch(
        "
        CREATE TABLE __noorm_identities__ (
            identity_hash TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL,
            machine TEXT,
            first_seen TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            last_seen TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_noorm_identities_email ON __noorm_identities__(email);
        ",
    )?;

    Ok(())
}
