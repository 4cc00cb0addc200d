// src/db/mod.rs

//! Database layer for noorm
//!
//! This module handles everything between a named config and live SQL:
//! - Dialect metadata and the driver capability (`adapter`)
//! - Connection factory with transient-error retry
//! - Named-connection manager (one cached connection per config)
//! - Internal tracking tables and their schema migrations (`schema`)
//! - Row types and CRUD for the tracking tables (`records`)
//! - Inspection and reset primitives (`explore`)

pub mod adapter;
pub mod explore;
pub mod records;
pub mod schema;

use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::state::model::Config;
use adapter::{Dialect, Driver, SqliteDriver};
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maximum connection attempts before giving up
const MAX_ATTEMPTS: u32 = 3;

/// Base delay between attempts; doubles each retry with 10% jitter
const RETRY_BASE_MS: u64 = 1000;

/// Open a connection for a config, verify it with `SELECT 1`, and retry
/// transient failures with exponential backoff.
///
/// Authentication failures and missing drivers are never retried.
pub fn connect(name: &str, config: &Config, bus: &EventBus) -> Result<Box<dyn Driver>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let opened = open_once(name, config).and_then(|mut driver| {
            // Verify the connection actually answers before handing it out
            driver
                .query("SELECT 1", &[])
                .map_err(|e| classify(name, e))?;
            Ok(driver)
        });
        match opened {
            Ok(driver) => {
                info!("Connected to '{}' ({})", name, config.dialect);
                bus.info(
                    "connection:open",
                    format!("connected to '{}'", name),
                    Some(json!({ "config": name, "dialect": config.dialect.as_str() })),
                );
                return Ok(driver);
            }
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                let delay = retry_delay(attempt);
                warn!(
                    "Connection to '{}' failed (attempt {}/{}), retrying in {:?}: {}",
                    name, attempt, MAX_ATTEMPTS, delay, err
                );
                bus.warn(
                    "connection:retry",
                    format!("retrying '{}' after transient failure", name),
                    Some(json!({ "config": name, "attempt": attempt })),
                );
                std::thread::sleep(delay);
            }
            Err(err) => {
                bus.error(
                    "connection:failed",
                    format!("connection to '{}' failed", name),
                    Some(json!({ "config": name, "kind": err.kind() })),
                );
                return Err(err);
            }
        }
    }
}

/// Verify reachability. With `test_server_only` the dialect's system
/// database is probed instead, so the target database need not exist yet.
pub fn test_connection(
    name: &str,
    config: &Config,
    test_server_only: bool,
    bus: &EventBus,
) -> Result<()> {
    let probe = if test_server_only {
        match config.dialect.system_database() {
            Some(system) => {
                let mut probe = config.clone();
                probe.database = system.to_string();
                probe
            }
            // File databases have no server to probe separately
            None => config.clone(),
        }
    } else {
        config.clone()
    };

    let driver = connect(name, &probe, bus)?;
    driver.close()?;
    Ok(())
}

fn open_once(name: &str, config: &Config) -> Result<Box<dyn Driver>> {
    match config.dialect {
        Dialect::Sqlite => {
            let driver = SqliteDriver::open(config).map_err(|e| classify(name, e))?;
            Ok(Box::new(driver))
        }
        other => Err(Error::MissingDriver {
            dialect: other.as_str().to_string(),
            hint: format!(
                "install a {} driver or point config '{}' at a sqlite database",
                other, name
            ),
        }),
    }
}

/// Sort raw open errors into the retry taxonomy
fn classify(name: &str, err: Error) -> Error {
    let message = err.to_string();
    let lowered = message.to_ascii_lowercase();

    let transient = [
        "econnrefused",
        "etimedout",
        "too many connections",
        "connection reset",
        "database is locked",
        "database table is locked",
    ]
    .iter()
    .any(|needle| lowered.contains(needle));
    if transient {
        return Error::ConnectionTransient {
            config: name.to_string(),
            message,
        };
    }

    let auth = ["authentication", "password", "access denied"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if auth {
        return Error::ConnectionAuth {
            config: name.to_string(),
            message,
        };
    }

    err
}

fn retry_delay(attempt: u32) -> Duration {
    let base = RETRY_BASE_MS * (1 << (attempt - 1)) as u64;
    let jitter = rand::thread_rng().gen_range(0..=(base / 10));
    Duration::from_millis(base + jitter)
}

/// Cache of named connections, created on demand and closed together by
/// the releasing lifecycle phase.
pub struct ConnectionManager {
    bus: EventBus,
    connections: HashMap<String, Box<dyn Driver>>,
}

impl ConnectionManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            connections: HashMap::new(),
        }
    }

    /// Borrow the connection for `name`, opening it if needed
    pub fn get_or_open(&mut self, name: &str, config: &Config) -> Result<&mut Box<dyn Driver>> {
        if !self.connections.contains_key(name) {
            let driver = connect(name, config, &self.bus)?;
            self.connections.insert(name.to_string(), driver);
        }
        Ok(self
            .connections
            .get_mut(name)
            .expect("connection inserted above"))
    }

    /// Close one named connection, if open
    pub fn disconnect(&mut self, name: &str) -> Result<()> {
        if let Some(driver) = self.connections.remove(name) {
            driver.close()?;
            debug!("Closed connection '{}'", name);
            self.bus.info(
                "connection:closed",
                format!("closed '{}'", name),
                Some(json!({ "config": name })),
            );
        }
        Ok(())
    }

    /// Close every cached connection, surfacing but not aborting on errors
    pub fn close_all(&mut self) {
        for (name, driver) in self.connections.drain() {
            if let Err(err) = driver.close() {
                warn!("Error closing connection '{}': {}", name, err);
            }
        }
    }

    pub fn open_count(&self) -> usize {
        self.connections.len()
    }
}
