// src/settings/mod.rs

//! Settings manager
//!
//! Loads `.noorm/settings.yml`, migrates it forward when an older file is
//! found, and exposes the rule evaluator and stage checks. Settings are
//! plaintext and shared through version control, so writes keep the YAML
//! stable and version-stamped.

pub mod migrations;
pub mod model;
pub mod rules;

use crate::error::{Error, Result};
use crate::state::model::Config;
use model::Settings;
use rules::BuildPaths;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SETTINGS_FILE: &str = "settings.yml";

/// The settings manager
pub struct SettingsManager {
    path: PathBuf,
    settings: Settings,
}

impl SettingsManager {
    /// Load settings from `noorm_dir`, creating defaults when missing.
    ///
    /// An on-disk file older than the binary is migrated and rewritten; a
    /// newer one is refused with `VersionMismatch`.
    pub fn open(noorm_dir: &Path) -> Result<Self> {
        let path = noorm_dir.join(SETTINGS_FILE);

        if !path.exists() {
            debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self {
                path,
                settings: Settings {
                    schema_version: migrations::SETTINGS_VERSION,
                    ..Default::default()
                },
            });
        }

        let yaml = fs::read_to_string(&path)?;
        let raw_yaml: serde_yaml::Value =
            serde_yaml::from_str(&yaml).map_err(|e| Error::InvalidArtifact {
                what: "settings file",
                message: e.to_string(),
            })?;
        // Migrations run on the JSON value model shared with the state layer
        let mut raw = serde_json::to_value(raw_yaml).map_err(|e| Error::InvalidArtifact {
            what: "settings file",
            message: e.to_string(),
        })?;

        let before = migrations::version_of(&raw);
        migrations::migrate(&mut raw)?;
        let migrated = before != migrations::SETTINGS_VERSION;

        let settings: Settings =
            serde_json::from_value(raw).map_err(|e| Error::InvalidArtifact {
                what: "settings file",
                message: e.to_string(),
            })?;

        let manager = Self { path, settings };
        if migrated {
            manager.save()?;
        }
        Ok(manager)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Write the settings back as version-stamped YAML
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(&self.settings).map_err(|e| Error::InvalidArtifact {
            what: "settings file",
            message: e.to_string(),
        })?;
        fs::write(&self.path, yaml)?;
        Ok(())
    }

    pub fn update<F>(&mut self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Settings),
    {
        mutate(&mut self.settings);
        self.save()
    }

    /// Final include/exclude lists for one config (spec rule evaluation)
    pub fn effective_build_paths(&self, name: &str, config: &Config) -> BuildPaths {
        rules::effective_build_paths(&self.settings, name, config)
    }

    /// Validate a config mutation against its stage template
    pub fn enforce_stage(&self, name: &str, config: &Config) -> Result<()> {
        rules::enforce_stage(&self.settings, name, config)
    }

    /// Check whether a config may be deleted (locked stages say no)
    pub fn can_delete_config(&self, name: &str, config: &Config) -> Result<()> {
        rules::can_delete_config(&self.settings, name, config)
    }
}
