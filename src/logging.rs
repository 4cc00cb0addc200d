// src/logging.rs

//! Project log
//!
//! Appends one JSON object per line to `.noorm/noorm.log` for every event
//! crossing the bus, rotating by size with a bounded number of kept
//! files. Operator diagnostics go through `tracing` separately; this file
//! is the shared, append-only audit trail the project keeps.

use crate::error::Result;
use crate::events::{Event, EventBus, Level};
use crate::settings::model::LoggingSettings;
use serde_json::json;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub const LOG_FILE: &str = "noorm.log";

const DEFAULT_MAX_SIZE_KB: u64 = 1024;
const DEFAULT_MAX_FILES: u32 = 3;

/// Size-rotated JSON-lines writer
pub struct ProjectLog {
    path: PathBuf,
    max_size: u64,
    max_files: u32,
    min_level: Level,
    file: Mutex<File>,
}

fn parse_level(value: &str) -> Option<Level> {
    match value.to_ascii_lowercase().as_str() {
        "debug" | "trace" => Some(Level::Debug),
        "info" => Some(Level::Info),
        "warn" | "warning" => Some(Level::Warn),
        "error" => Some(Level::Error),
        _ => None,
    }
}

impl ProjectLog {
    /// Open (appending) the log under `noorm_dir`. `NOORM_LOG_LEVEL` and
    /// `NOORM_DEBUG` override the configured level.
    pub fn open(noorm_dir: &Path, settings: Option<&LoggingSettings>) -> Result<Self> {
        fs::create_dir_all(noorm_dir)?;
        let path = noorm_dir.join(LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let configured = settings
            .and_then(|s| s.level.as_deref())
            .and_then(parse_level)
            .unwrap_or(Level::Info);
        let min_level = if std::env::var("NOORM_DEBUG").as_deref() == Ok("1") {
            Level::Debug
        } else {
            std::env::var("NOORM_LOG_LEVEL")
                .ok()
                .as_deref()
                .and_then(parse_level)
                .unwrap_or(configured)
        };

        Ok(Self {
            path,
            max_size: settings
                .and_then(|s| s.max_size_kb)
                .unwrap_or(DEFAULT_MAX_SIZE_KB)
                * 1024,
            max_files: settings
                .and_then(|s| s.max_files)
                .unwrap_or(DEFAULT_MAX_FILES),
            min_level,
            file: Mutex::new(file),
        })
    }

    fn write_event(&self, event: &Event) {
        if event.level < self.min_level {
            return;
        }

        let record = json!({
            "time": event.time,
            "level": event.level.as_str(),
            "type": event.name,
            "message": event.message,
            "data": event.data,
        });

        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(_) => return,
        };
        if let Err(err) = writeln!(file, "{}", record) {
            warn!("Project log write failed: {}", err);
            return;
        }

        if let Ok(meta) = file.metadata() {
            if meta.len() > self.max_size {
                if let Err(err) = self.rotate(&mut file) {
                    warn!("Project log rotation failed: {}", err);
                }
            }
        }
    }

    /// Shift `noorm.log` -> `noorm.log.1` -> ... dropping the oldest
    fn rotate(&self, file: &mut File) -> Result<()> {
        file.flush()?;

        let oldest = self.path.with_extension(format!("log.{}", self.max_files));
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for i in (1..self.max_files).rev() {
            let from = self.path.with_extension(format!("log.{}", i));
            if from.exists() {
                fs::rename(&from, self.path.with_extension(format!("log.{}", i + 1)))?;
            }
        }
        fs::rename(&self.path, self.path.with_extension("log.1"))?;

        *file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Subscribe this log to a bus; the returned handle is shared with
    /// the flushing lifecycle phase.
    pub fn attach(self, bus: &EventBus) -> Arc<Self> {
        let log = Arc::new(self);
        let writer = Arc::clone(&log);
        bus.subscribe(move |event| writer.write_event(event));
        log
    }

    pub fn flush(&self) -> Result<()> {
        if let Ok(mut file) = self.file.lock() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Operator diagnostics on stderr, filtered by RUST_LOG with an info
/// default (`NOORM_DEBUG=1` raises it to debug).
pub fn init_tracing() {
    let default = if std::env::var("NOORM_DEBUG").as_deref() == Ok("1") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}
