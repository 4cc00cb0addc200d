// src/lock.rs

//! Cooperative database lock
//!
//! At most one writer per config, coordinated purely through the
//! `__noorm_lock__` row so separate processes and machines contend in one
//! place. Locks expire: a holder that never released (crash, lost laptop)
//! blocks nobody once its TTL passes, and takeover of an expired row uses
//! a compare-and-swap update so two claimants cannot both win.

use crate::db::adapter::{Driver, Value};
use crate::error::{Error, Result};
use crate::events::EventBus;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

/// Default lock lifetime. Long enough for a full build; `force-release`
/// covers true hangs.
pub const DEFAULT_TTL_MINUTES: i64 = 30;

/// Attempts to take over an expired row before giving up
const TAKEOVER_ATTEMPTS: u32 = 3;

/// Observed state of one config's lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    HeldByMe {
        expires_at: String,
    },
    HeldByOther {
        holder: String,
        since: String,
        expired: bool,
    },
}

#[derive(Debug, Clone)]
struct LockRow {
    locked_by: String,
    locked_at: String,
    expires_at: String,
}

impl LockRow {
    fn expired(&self) -> bool {
        parse_time(&self.expires_at)
            .map(|t| t <= Utc::now())
            .unwrap_or(true)
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// The lock manager
pub struct LockManager {
    bus: EventBus,
    ttl: Duration,
}

impl LockManager {
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            ttl: Duration::minutes(DEFAULT_TTL_MINUTES),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn read_row(&self, driver: &mut dyn Driver, config: &str) -> Result<Option<LockRow>> {
        let rows = driver.query(
            "SELECT locked_by, locked_at, expires_at FROM __noorm_lock__ WHERE config_name = ?1",
            &[Value::from(config)],
        )?;
        Ok(rows.first().map(|r| LockRow {
            locked_by: r.text("locked_by").unwrap_or_default(),
            locked_at: r.text("locked_at").unwrap_or_default(),
            expires_at: r.text("expires_at").unwrap_or_default(),
        }))
    }

    /// Acquire the lock for `config` as `identity`.
    ///
    /// Fresh rows insert; expired rows are taken over atomically; a live
    /// row held by someone else raises `LockAcquire` carrying the holder.
    pub fn acquire(&self, driver: &mut dyn Driver, config: &str, identity: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = Utc::now();
            let expires = now + self.ttl;

            let inserted = driver.execute(
                "INSERT INTO __noorm_lock__ (config_name, locked_by, locked_at, expires_at)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE NOT EXISTS (SELECT 1 FROM __noorm_lock__ WHERE config_name = ?1)",
                &[
                    Value::from(config),
                    Value::from(identity),
                    Value::from(now.to_rfc3339()),
                    Value::from(expires.to_rfc3339()),
                ],
            )?;
            if inserted > 0 {
                info!("Acquired lock on '{}' as {}", config, identity);
                self.bus.info(
                    "lock:acquired",
                    format!("lock acquired on '{}'", config),
                    Some(json!({ "config": config, "holder": identity })),
                );
                return Ok(());
            }

            let Some(row) = self.read_row(driver, config)? else {
                // Row vanished between insert and read; retry from the top
                continue;
            };

            if row.locked_by == identity && !row.expired() {
                debug!("Lock on '{}' already held by this identity", config);
                return Ok(());
            }

            if !row.expired() {
                return Err(Error::LockAcquire {
                    config: config.to_string(),
                    holder: row.locked_by,
                    since: row.locked_at,
                });
            }

            // Expired: compare-and-swap against the exact row we observed
            let taken = driver.execute(
                "UPDATE __noorm_lock__
                 SET locked_by = ?1, locked_at = ?2, expires_at = ?3
                 WHERE config_name = ?4 AND locked_by = ?5 AND expires_at = ?6",
                &[
                    Value::from(identity),
                    Value::from(now.to_rfc3339()),
                    Value::from(expires.to_rfc3339()),
                    Value::from(config),
                    Value::from(row.locked_by.clone()),
                    Value::from(row.expires_at.clone()),
                ],
            )?;
            if taken > 0 {
                info!(
                    "Took over expired lock on '{}' from {}",
                    config, row.locked_by
                );
                self.bus.info(
                    "lock:acquired",
                    format!("expired lock on '{}' taken over", config),
                    Some(json!({ "config": config, "holder": identity, "previous": row.locked_by })),
                );
                return Ok(());
            }

            if attempt >= TAKEOVER_ATTEMPTS {
                let row = self.read_row(driver, config)?;
                return Err(match row {
                    Some(row) => Error::LockAcquire {
                        config: config.to_string(),
                        holder: row.locked_by,
                        since: row.locked_at,
                    },
                    None => Error::LockExpired {
                        config: config.to_string(),
                        expired_at: now.to_rfc3339(),
                    },
                });
            }
            warn!("Lost lock takeover race on '{}', retrying", config);
            std::thread::sleep(std::time::Duration::from_millis(100 * attempt as u64));
        }
    }

    /// Release the lock, verifying ownership. A missing row is treated as
    /// already free.
    pub fn release(&self, driver: &mut dyn Driver, config: &str, identity: &str) -> Result<()> {
        let deleted = driver.execute(
            "DELETE FROM __noorm_lock__ WHERE config_name = ?1 AND locked_by = ?2",
            &[Value::from(config), Value::from(identity)],
        )?;
        if deleted > 0 {
            info!("Released lock on '{}'", config);
            self.bus.info(
                "lock:released",
                format!("lock released on '{}'", config),
                Some(json!({ "config": config, "holder": identity })),
            );
            return Ok(());
        }

        match self.read_row(driver, config)? {
            Some(row) => Err(Error::LockOwnership {
                config: config.to_string(),
                holder: row.locked_by,
                requester: identity.to_string(),
            }),
            None => {
                debug!("Release on '{}': no lock present", config);
                Ok(())
            }
        }
    }

    /// Unconditionally delete the lock row. Emergencies only.
    pub fn force_release(&self, driver: &mut dyn Driver, config: &str) -> Result<()> {
        let deleted = driver.execute(
            "DELETE FROM __noorm_lock__ WHERE config_name = ?1",
            &[Value::from(config)],
        )?;
        if deleted > 0 {
            warn!("Force-released lock on '{}'", config);
            self.bus.warn(
                "lock:force_released",
                format!("lock force-released on '{}'", config),
                Some(json!({ "config": config })),
            );
        }
        Ok(())
    }

    /// Observe the lock without touching it
    pub fn status(
        &self,
        driver: &mut dyn Driver,
        config: &str,
        identity: &str,
    ) -> Result<LockStatus> {
        Ok(match self.read_row(driver, config)? {
            None => LockStatus::Free,
            Some(row) if row.locked_by == identity && !row.expired() => LockStatus::HeldByMe {
                expires_at: row.expires_at,
            },
            Some(row) => {
                let expired = row.expired();
                LockStatus::HeldByOther {
                    holder: row.locked_by,
                    since: row.locked_at,
                    expired,
                }
            }
        })
    }

    /// Run `f` under the lock; the release runs whether `f` succeeded or
    /// not. A panicking body leaves the row to expire by TTL.
    pub fn with_lock<T, F>(
        &self,
        driver: &mut dyn Driver,
        config: &str,
        identity: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut dyn Driver) -> Result<T>,
    {
        self.acquire(driver, config, identity)?;
        let outcome = f(driver);
        let released = self.release(driver, config, identity);
        match outcome {
            Ok(value) => {
                released?;
                Ok(value)
            }
            // The operation error outranks any release error
            Err(err) => Err(err),
        }
    }
}
