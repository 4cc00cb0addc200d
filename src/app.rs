// src/app.rs

//! Application wiring
//!
//! One `App` per process owns the managers (state, settings, connections,
//! locks) and threads them through to command handlers, instead of
//! module-level singletons. Construction is explicit: resolve the
//! identity keypair, derive the state key, open both on-disk stores, and
//! hand out engines bound to a live connection.

use crate::crypto;
use crate::db::adapter::Driver;
use crate::db::records::upsert_identity;
use crate::db::{schema, ConnectionManager};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::identity::{self, CryptoIdentity, Identity, ResolveOptions};
use crate::lock::LockManager;
use crate::state::model::Config;
use crate::state::StateStore;
use crate::settings::SettingsManager;
use crate::template::{RenderContext, TemplateEngine};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const NOORM_DIR: &str = ".noorm";

/// Process-wide application context
pub struct App {
    pub project_root: PathBuf,
    pub noorm_dir: PathBuf,
    pub bus: EventBus,
    pub state: StateStore,
    pub settings: SettingsManager,
    pub connections: ConnectionManager,
    pub locks: LockManager,
    crypto_identity: CryptoIdentity,
}

impl App {
    /// Open an initialized project. Fails when `.noorm/` is missing;
    /// `init` is the only entry point that creates it.
    pub fn open(project_root: &Path, bus: EventBus) -> Result<Self> {
        let noorm_dir = project_root.join(NOORM_DIR);
        if !noorm_dir.is_dir() {
            return Err(Error::InvalidArtifact {
                what: "project",
                message: format!(
                    "{} not found; run 'noorm init' first",
                    noorm_dir.display()
                ),
            });
        }
        Self::open_inner(project_root, noorm_dir, bus)
    }

    /// Initialize a project: identity, encrypted state, settings, and a
    /// `.gitignore` keeping the state file out of version control.
    pub fn init(project_root: &Path, bus: EventBus) -> Result<Self> {
        let noorm_dir = project_root.join(NOORM_DIR);
        fs::create_dir_all(&noorm_dir)?;

        let gitignore = noorm_dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "state.enc\nnoorm.log*\n")?;
        }

        let mut app = Self::open_inner(project_root, noorm_dir, bus)?;
        app.state.persist()?;
        app.settings.save()?;
        info!("Initialized project at {}", project_root.display());
        Ok(app)
    }

    fn open_inner(project_root: &Path, noorm_dir: PathBuf, bus: EventBus) -> Result<Self> {
        let identity_dir = identity::identity_dir()?;
        let fallback = identity::resolve_identity(&ResolveOptions::default());
        let keys = identity::load_or_generate(&identity_dir, &fallback.name, &fallback.email)?;
        let key = crypto::derive_key(&keys.private_key_bytes());

        let mut state = StateStore::open(&noorm_dir, key)?;
        if state.state().identity.as_ref() != Some(&keys.metadata) {
            state.set_identity(keys.metadata.clone())?;
        }
        let settings = SettingsManager::open(&noorm_dir)?;

        debug!("App context ready for {}", project_root.display());
        Ok(Self {
            project_root: project_root.to_path_buf(),
            noorm_dir,
            connections: ConnectionManager::new(bus.clone()),
            locks: LockManager::new(bus.clone()),
            crypto_identity: keys.metadata,
            bus,
            state,
            settings,
        })
    }

    /// Resolve the config a command targets: explicit `--config` first,
    /// then the active config from state.
    pub fn target_config(&self, override_name: Option<&str>) -> Result<(String, Config)> {
        let name = match override_name {
            Some(name) => name.to_string(),
            None => self
                .state
                .state()
                .active_config
                .clone()
                .ok_or_else(|| Error::InvalidArtifact {
                    what: "config selection",
                    message: "no active config; run 'noorm config use <name>' or pass --config"
                        .to_string(),
                })?,
        };
        let config = self.state.config(&name)?.clone();
        Ok((name, config))
    }

    /// The attribution identity for a config. The per-config override
    /// sits last in the resolution order, behind every ambient source.
    pub fn identity_for(&self, config: &Config) -> Identity {
        let opts = ResolveOptions {
            crypto_identity: Some((
                self.crypto_identity.name.clone(),
                self.crypto_identity.email.clone(),
            )),
            config_override: config
                .identity
                .as_ref()
                .map(|id| (id.name.clone(), id.email.clone())),
        };
        identity::resolve_identity(&opts)
    }

    pub fn crypto_identity(&self) -> &CryptoIdentity {
        &self.crypto_identity
    }

    /// Absolute schema directory for a config
    pub fn sql_dir(&self, config: &Config) -> PathBuf {
        self.project_root.join(&config.paths.sql_dir)
    }

    /// Absolute changes directory for a config
    pub fn changes_dir(&self, config: &Config) -> PathBuf {
        self.project_root.join(&config.paths.changes_dir)
    }

    /// Template engine rooted at this project
    pub fn template_engine(&self) -> Result<TemplateEngine> {
        TemplateEngine::new(&self.project_root)
    }

    /// Render context for one config: public fields, secrets, app
    /// secrets, allowlisted environment.
    pub fn render_context(&self, name: &str, config: &Config) -> RenderContext {
        RenderContext {
            config: config.public_fields(),
            secrets: self.state.secrets_for(name),
            global_secrets: self.state.state().global_secrets.clone(),
            env: RenderContext::allowlisted_env(),
        }
    }

    /// Open (or reuse) the connection for a config and make sure the
    /// tracking tables are current, recording this identity in the
    /// shared roster.
    pub fn prepare_connection(
        &mut self,
        name: &str,
        config: &Config,
    ) -> Result<&mut Box<dyn Driver>> {
        let identity = self.identity_for(config).formatted();
        let crypto = self.crypto_identity.clone();

        let driver = self.connections.get_or_open(name, config)?;
        schema::migrate(driver.as_mut(), &identity)?;
        upsert_identity(
            driver.as_mut(),
            &crypto.identity_hash,
            &crypto.name,
            &crypto.email,
            &crypto.machine,
        )?;
        Ok(driver)
    }

    /// Verify the config's stage has every secret it declares, across
    /// config-scoped and app-level keys.
    pub fn check_stage_secrets(&self, name: &str, config: &Config) -> Result<()> {
        let mut available: Vec<String> = self.state.secrets_for(name).into_keys().collect();
        available.extend(self.state.state().global_secrets.keys().cloned());

        let missing = crate::settings::rules::missing_stage_secrets(
            self.settings.settings(),
            config,
            &available,
        );
        if missing.is_empty() {
            return Ok(());
        }
        Err(Error::StageConstraint {
            stage: config.stage.clone().unwrap_or_default(),
            config: name.to_string(),
            reason: format!("missing required secrets: {}", missing.join(", ")),
        })
    }

    /// Gate destructive operations on protected configs: `NOORM_YES=1`
    /// or an explicit `yes-<name>` confirmation phrase.
    pub fn confirm_protected(
        &self,
        name: &str,
        config: &Config,
        confirm: Option<&str>,
    ) -> Result<()> {
        if !config.protected {
            return Ok(());
        }
        if std::env::var("NOORM_YES").as_deref() == Ok("1") {
            return Ok(());
        }
        let expected = format!("yes-{}", name);
        if confirm == Some(expected.as_str()) {
            return Ok(());
        }
        Err(Error::ProtectedAction {
            config: name.to_string(),
        })
    }
}
