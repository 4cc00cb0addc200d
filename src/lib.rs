// src/lib.rs

//! noorm - team-oriented database schema and change management
//!
//! Replaces ad-hoc migration tooling with a structured pipeline:
//!
//! - Declarative schema builds: idempotent, checksum-tracked SQL files
//! - Imperative changes: ordered directories with forward and revert sides
//! - A cooperative database lock making multi-engineer use safe
//! - Encrypted, user-owned project state tied to a keypair identity
//! - Three linearly-versioned layers (tracking tables, state, settings)
//!
//! Everything auditable lands in `__noorm_*` tables inside the target
//! database: one row per operation, one row per executed file.

pub mod app;
pub mod changes;
pub mod crypto;
pub mod db;
mod error;
pub mod events;
pub mod hash;
pub mod identity;
pub mod lifecycle;
pub mod lock;
pub mod logging;
pub mod runner;
pub mod settings;
pub mod state;
pub mod template;

pub use error::{Error, Result};
