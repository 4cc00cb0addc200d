// src/main.rs

use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use noorm::app::App;
use noorm::changes::engine::{ChangeEngine, RewindTarget, RunOptions};
use noorm::changes::{discover, scaffold, Side};
use noorm::db::explore;
use noorm::events::EventBus;
use noorm::lifecycle::{LifecycleManager, Phase};
use noorm::lock::LockStatus;
use noorm::logging::{self, ProjectLog};
use noorm::runner::{BuildOptions, FileRunner};
use noorm::state::model::{Config, ConfigPaths};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Parser)]
#[command(name = "noorm")]
#[command(author, version, about = "Team-oriented database schema and change management", long_about = None)]
struct Cli {
    /// Machine-readable JSON output
    #[arg(long, global = true)]
    json: bool,
    /// Non-interactive execution (also via NOORM_HEADLESS=1 or CI=1)
    #[arg(short = 'H', long, global = true)]
    headless: bool,
    /// Override the active config for this command
    #[arg(long, global = true, value_name = "NAME")]
    config: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize this project: identity, encrypted state, settings
    Init,
    /// Manage named connection configs
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Manage config-scoped and app-level secrets
    Secret {
        #[command(subcommand)]
        command: SecretCommands,
    },
    /// Create, inspect, and execute changes
    Change {
        #[command(subcommand)]
        command: ChangeCommands,
    },
    /// Run schema files: the full build, one directory, or one file
    Run {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Inspect or manage the cooperative database lock
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// Inspect or reset database objects
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// Tear down user objects, then rebuild the schema
    Reset {
        /// Confirmation phrase for protected configs: yes-<name>
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Show or sync the collaborator identity
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },
    /// Print version and artifact layer information
    Version,
    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell)
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Add or update a config
    Add {
        name: String,
        /// Dialect: postgres, mysql, sqlite, mssql
        #[arg(long)]
        dialect: String,
        /// Database name, or file path for sqlite
        #[arg(long)]
        database: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        password: Option<String>,
        /// Stage to link this config to
        #[arg(long)]
        stage: Option<String>,
        #[arg(long)]
        protected: bool,
        #[arg(long)]
        is_test: bool,
        /// Schema directory (default: sql)
        #[arg(long)]
        sql_dir: Option<String>,
        /// Changes directory (default: changes)
        #[arg(long)]
        changes_dir: Option<String>,
    },
    /// Select the active config
    Use { name: String },
    /// Verify a config's connection (or just its server)
    Test {
        name: Option<String>,
        /// Probe the dialect's system database instead of the target
        #[arg(long)]
        server_only: bool,
    },
    /// List configs
    List,
    /// Show one config (secrets elided)
    Show { name: Option<String> },
    /// Remove a config and its secrets
    Remove { name: String },
}

#[derive(Subcommand)]
enum SecretCommands {
    /// Set a secret for the target config (or app-wide with --global)
    Set {
        key: String,
        value: String,
        #[arg(long)]
        global: bool,
    },
    /// Remove a secret
    Unset {
        key: String,
        #[arg(long)]
        global: bool,
    },
    /// List secret keys (values stay hidden)
    List,
}

#[derive(Subcommand)]
enum ChangeCommands {
    /// Scaffold a new change directory
    New { slug: String },
    /// Add a file to a change's forward or revert side
    AddFile {
        change: String,
        slug: String,
        #[arg(long)]
        revert: bool,
        /// Create a .sql.tmpl template
        #[arg(long)]
        template: bool,
        /// Create a .txt manifest
        #[arg(long)]
        manifest: bool,
    },
    /// Rename a change's slug (date prefix is kept)
    Rename { change: String, new_slug: String },
    /// Resequence one side of a change to the given filename order
    Reorder {
        change: String,
        /// Every filename on that side, in the desired order
        files: Vec<String>,
        #[arg(long)]
        revert: bool,
    },
    /// Delete an unapplied change from disk
    Delete { change: String },
    /// List changes with their derived status
    List,
    /// Apply one change
    Run {
        name: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Revert one change
    Revert {
        name: String,
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Apply the single next pending change
    Next {
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Apply all pending changes in order
    Ff {
        #[arg(long)]
        force: bool,
        /// Keep applying after a failure
        #[arg(long)]
        no_abort: bool,
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Revert the last N applied changes, or back to a named change
    Rewind {
        /// A count like `2`, or a change name
        target: String,
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Show the raw operation history
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Remove an orphaned change from history
    Forget { name: String },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Run the schema build with include/exclude rules applied
    Build {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Run a single SQL file
    File {
        path: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Run every SQL file under a directory
    Dir {
        path: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        confirm: Option<String>,
    },
}

#[derive(Subcommand)]
enum LockCommands {
    /// Show who holds the lock
    Status,
    /// Take the lock explicitly
    Acquire,
    /// Release the lock you hold
    Release,
    /// Delete the lock row regardless of holder
    Force,
}

#[derive(Subcommand)]
enum DbCommands {
    /// List user tables
    Tables,
    /// List user views
    Views,
    /// Delete all rows from one table
    Truncate {
        table: String,
        #[arg(long)]
        confirm: Option<String>,
    },
    /// Drop all user objects (never allowed on protected configs)
    Teardown {
        /// Also drop the __noorm_* tracking tables
        #[arg(long)]
        all: bool,
        #[arg(long)]
        confirm: Option<String>,
    },
}

#[derive(Subcommand)]
enum IdentityCommands {
    /// Show the local identity
    Show,
    /// Sync the shared roster into local state
    Sync,
}

/// Shared output mode for handlers
#[derive(Clone, Copy)]
struct Output {
    json: bool,
}

impl Output {
    fn emit(&self, human: impl AsRef<str>, payload: serde_json::Value) {
        if self.json {
            println!("{}", payload);
        } else {
            println!("{}", human.as_ref());
        }
    }
}

fn main() -> ExitCode {
    logging::init_tracing();
    let cli = Cli::parse();
    let out = Output { json: cli.json };

    let bus = EventBus::new();
    let lifecycle = match LifecycleManager::new(bus.clone()) {
        Ok(lifecycle) => lifecycle,
        Err(err) => {
            eprintln!("noorm: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = lifecycle.install_signal_handlers() {
        debug!("Signal handlers unavailable: {}", err);
    }
    let fatal = Arc::clone(&lifecycle);
    std::panic::set_hook(Box::new(move |info| {
        fatal.fail(&info.to_string());
        std::process::exit(1);
    }));
    lifecycle.start();

    let result = run(&cli, &bus, &lifecycle, out);

    let reports = lifecycle.shutdown();
    for report in &reports {
        if report.timed_out {
            eprintln!(
                "noorm: shutdown phase {} overran ({:?})",
                report.phase.as_str(),
                report.duration
            );
        }
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err, out);
            ExitCode::FAILURE
        }
    }
}

fn report_error(err: &anyhow::Error, out: Output) {
    if out.json {
        let kind = err
            .downcast_ref::<noorm::Error>()
            .map(|e| e.kind())
            .unwrap_or("error");
        println!(
            "{}",
            json!({ "error": { "kind": kind, "message": err.to_string() } })
        );
    } else {
        eprintln!("noorm: {:#}", err);
    }
}

fn headless(cli: &Cli) -> bool {
    cli.headless
        || std::env::var("NOORM_HEADLESS").as_deref() == Ok("1")
        || std::env::var("CI").as_deref() == Ok("1")
}

fn run(cli: &Cli, bus: &EventBus, lifecycle: &Arc<LifecycleManager>, out: Output) -> Result<()> {
    let cwd = std::env::current_dir()?;
    debug!(
        "Running {} (headless={})",
        std::env::args().collect::<Vec<_>>().join(" "),
        headless(cli)
    );

    // Commands that never need a project context
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(*shell, &mut cmd, "noorm", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Init => {
            let app = App::init(&cwd, bus.clone())?;
            out.emit(
                format!(
                    "Initialized {} (identity {})",
                    app.noorm_dir.display(),
                    app.crypto_identity().short_id()
                ),
                json!({
                    "initialized": app.noorm_dir.display().to_string(),
                    "identity": app.crypto_identity().identity_hash,
                }),
            );
            return Ok(());
        }
        _ => {}
    }

    let app = Arc::new(Mutex::new(App::open(&cwd, bus.clone())?));

    // Project log joins the bus once the project dir is known; its flush
    // and the connection pool are lifecycle-owned from here on.
    let log = {
        let app = app.lock().unwrap();
        ProjectLog::open(&app.noorm_dir, app.settings.settings().logging.as_ref())?.attach(bus)
    };
    let flush_log = Arc::clone(&log);
    lifecycle.register("project-log", Phase::Flushing, 0, move || {
        flush_log.flush()
    });
    let release_app = Arc::clone(&app);
    lifecycle.register("connections", Phase::Releasing, 0, move || {
        if let Ok(mut app) = release_app.lock() {
            app.connections.close_all();
        }
        Ok(())
    });

    let mut app = app.lock().unwrap();
    match &cli.command {
        Commands::Init | Commands::Completions { .. } => unreachable!("handled above"),
        Commands::Config { command } => cmd_config(&mut app, command, out),
        Commands::Secret { command } => cmd_secret(&mut app, command, cli.config.as_deref(), out),
        Commands::Change { command } => {
            cmd_change(&mut app, command, cli.config.as_deref(), out)
        }
        Commands::Run { command } => cmd_run(&mut app, command, cli.config.as_deref(), out),
        Commands::Lock { command } => cmd_lock(&mut app, command, cli.config.as_deref(), out),
        Commands::Db { command } => cmd_db(&mut app, command, cli.config.as_deref(), out),
        Commands::Reset { confirm } => {
            cmd_reset(&mut app, cli.config.as_deref(), confirm.as_deref(), out)
        }
        Commands::Identity { command } => {
            cmd_identity(&mut app, command, cli.config.as_deref(), out)
        }
        Commands::Version => cmd_version(&mut app, out),
    }
}

// ---- config ----

fn cmd_config(app: &mut App, command: &ConfigCommands, out: Output) -> Result<()> {
    match command {
        ConfigCommands::Add {
            name,
            dialect,
            database,
            host,
            port,
            username,
            password,
            stage,
            protected,
            is_test,
            sql_dir,
            changes_dir,
        } => {
            let dialect = noorm::db::adapter::Dialect::from_str(dialect)
                .map_err(|e| anyhow!(e))?;
            let mut config = Config::new(dialect, database.clone());
            config.host = host.clone();
            config.port = *port;
            config.username = username.clone();
            config.password = password.clone();
            config.stage = stage.clone();
            config.protected = *protected;
            config.is_test = *is_test;
            config.paths = ConfigPaths {
                sql_dir: sql_dir.clone().unwrap_or_else(|| "sql".to_string()),
                changes_dir: changes_dir.clone().unwrap_or_else(|| "changes".to_string()),
            };

            app.settings.enforce_stage(name, &config)?;
            app.state.upsert_config(name, config)?;
            out.emit(
                format!("Saved config '{}'", name),
                json!({ "config": name, "saved": true }),
            );
            Ok(())
        }
        ConfigCommands::Use { name } => {
            app.state.set_active_config(name)?;
            out.emit(
                format!("Active config is now '{}'", name),
                json!({ "active": name }),
            );
            Ok(())
        }
        ConfigCommands::Test { name, server_only } => {
            let (name, config) = app.target_config(name.as_deref())?;
            noorm::db::test_connection(&name, &config, *server_only, &app.bus)?;
            out.emit(
                format!("Connection '{}' OK", name),
                json!({ "config": name, "ok": true }),
            );
            Ok(())
        }
        ConfigCommands::List => {
            let state = app.state.state();
            let active = state.active_config.clone();
            if out.json {
                let list: Vec<_> = state
                    .configs
                    .iter()
                    .map(|(name, config)| {
                        json!({
                            "name": name,
                            "dialect": config.dialect.as_str(),
                            "database": config.database,
                            "stage": config.stage,
                            "protected": config.protected,
                            "active": active.as_deref() == Some(name.as_str()),
                        })
                    })
                    .collect();
                println!("{}", json!({ "configs": list }));
            } else if state.configs.is_empty() {
                println!("No configs; add one with 'noorm config add'");
            } else {
                for (name, config) in &state.configs {
                    let marker = if active.as_deref() == Some(name.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    println!(
                        "{} {}  {}://{}{}",
                        marker,
                        name,
                        config.dialect,
                        config.database,
                        if config.protected { "  [protected]" } else { "" }
                    );
                }
            }
            Ok(())
        }
        ConfigCommands::Show { name } => {
            let (name, config) = app.target_config(name.as_deref())?;
            out.emit(
                format!("{}: {}", name, config.public_fields()),
                json!({ "name": name, "config": config.public_fields() }),
            );
            Ok(())
        }
        ConfigCommands::Remove { name } => {
            let config = app.state.config(name)?.clone();
            app.settings.can_delete_config(name, &config)?;
            app.state.remove_config(name)?;
            out.emit(
                format!("Removed config '{}'", name),
                json!({ "config": name, "removed": true }),
            );
            Ok(())
        }
    }
}

// ---- secrets ----

fn cmd_secret(
    app: &mut App,
    command: &SecretCommands,
    config_override: Option<&str>,
    out: Output,
) -> Result<()> {
    match command {
        SecretCommands::Set { key, value, global } => {
            if *global {
                app.state.set_global_secret(key, value)?;
            } else {
                let (name, _) = app.target_config(config_override)?;
                app.state.set_secret(&name, key, value)?;
            }
            out.emit(format!("Secret '{}' set", key), json!({ "set": key }));
            Ok(())
        }
        SecretCommands::Unset { key, global } => {
            if *global {
                app.state.unset_global_secret(key)?;
            } else {
                let (name, _) = app.target_config(config_override)?;
                app.state.unset_secret(&name, key)?;
            }
            out.emit(format!("Secret '{}' unset", key), json!({ "unset": key }));
            Ok(())
        }
        SecretCommands::List => {
            let (name, _) = app.target_config(config_override)?;
            let config_keys: Vec<String> = app.state.secrets_for(&name).into_keys().collect();
            let global_keys: Vec<String> = app
                .state
                .state()
                .global_secrets
                .keys()
                .cloned()
                .collect();
            out.emit(
                format!(
                    "config '{}': {}\nglobal: {}",
                    name,
                    config_keys.join(", "),
                    global_keys.join(", ")
                ),
                json!({ "config": name, "keys": config_keys, "globalKeys": global_keys }),
            );
            Ok(())
        }
    }
}

// ---- changes ----

/// Build a change engine over an App and run `f` with it, holding the
/// cooperative lock when `locked` is set.
fn with_engine<T>(
    app: &mut App,
    config_override: Option<&str>,
    locked: bool,
    f: impl FnOnce(&mut ChangeEngine<'_>) -> noorm::Result<T>,
) -> Result<T> {
    let (name, config) = app.target_config(config_override)?;
    app.check_stage_secrets(&name, &config)?;
    let identity = app.identity_for(&config).formatted();
    let template = app.template_engine()?;
    let ctx = app.render_context(&name, &config);
    let project_root = app.project_root.clone();
    let changes_dir = app.changes_dir(&config);
    let sql_dir = app.sql_dir(&config);
    let bus = app.bus.clone();
    let locks = noorm::lock::LockManager::new(bus.clone());

    let driver = app.prepare_connection(&name, &config)?;

    let body = |driver: &mut dyn noorm::db::adapter::Driver| {
        let mut engine = ChangeEngine::new(
            driver,
            &template,
            &ctx,
            &bus,
            &project_root,
            &changes_dir,
            &sql_dir,
            identity.clone(),
        );
        f(&mut engine)
    };

    let result = if locked {
        locks.with_lock(driver.as_mut(), &name, &identity, |driver| body(driver))
    } else {
        body(driver.as_mut())
    };
    Ok(result?)
}

fn describe_outcome(outcome: &noorm::changes::engine::OperationOutcome) -> String {
    let (executed, skipped, failed) =
        outcome
            .files
            .iter()
            .fold((0, 0, 0), |(e, s, f), file| match file.status {
                noorm::db::records::ExecutionStatus::Success => (e + 1, s, f),
                noorm::db::records::ExecutionStatus::Skipped => (e, s + 1, f),
                noorm::db::records::ExecutionStatus::Failed => (e, s, f + 1),
            });
    format!(
        "{} {}: {} ({} executed, {} skipped, {} failed, {} ms)",
        outcome.direction.as_str(),
        outcome.name,
        outcome.status.as_str(),
        executed,
        skipped,
        failed,
        outcome.duration_ms
    )
}

fn outcome_json(outcome: &noorm::changes::engine::OperationOutcome) -> serde_json::Value {
    json!({
        "change": outcome.name,
        "direction": outcome.direction.as_str(),
        "status": outcome.status.as_str(),
        "durationMs": outcome.duration_ms,
        "files": outcome.files.iter().map(|f| json!({
            "filepath": f.filepath,
            "status": f.status.as_str(),
            "skipReason": f.skip_reason,
            "error": f.error,
            "durationMs": f.duration_ms,
        })).collect::<Vec<_>>(),
    })
}

fn cmd_change(
    app: &mut App,
    command: &ChangeCommands,
    config_override: Option<&str>,
    out: Output,
) -> Result<()> {
    match command {
        ChangeCommands::New { slug } => {
            let (_, config) = app.target_config(config_override)?;
            let changes_dir = app.changes_dir(&config);
            let change = scaffold::create(&changes_dir, slug, Utc::now().date_naive())?;
            out.emit(
                format!("Created {}", change.path.display()),
                json!({ "change": change.name, "path": change.path.display().to_string() }),
            );
            Ok(())
        }
        ChangeCommands::AddFile {
            change,
            slug,
            revert,
            template,
            manifest,
        } => {
            let (_, config) = app.target_config(config_override)?;
            let changes_dir = app.changes_dir(&config);
            with_engine(app, config_override, false, |engine| {
                engine.ensure_mutable(change)
            })?;
            let change = discover::find_change(&changes_dir, change)?;
            let side = if *revert { Side::Revert } else { Side::Change };
            let path = scaffold::add_file(&change, side, slug, *template, *manifest)?;
            out.emit(
                format!("Added {}", path.display()),
                json!({ "added": path.display().to_string() }),
            );
            Ok(())
        }
        ChangeCommands::Rename { change, new_slug } => {
            let (_, config) = app.target_config(config_override)?;
            let changes_dir = app.changes_dir(&config);
            with_engine(app, config_override, false, |engine| {
                engine.ensure_mutable(change)
            })?;
            let change = discover::find_change(&changes_dir, change)?;
            let new_name = scaffold::rename(&change, new_slug)?;
            out.emit(
                format!("Renamed to {}", new_name),
                json!({ "renamed": new_name }),
            );
            Ok(())
        }
        ChangeCommands::Reorder {
            change,
            files,
            revert,
        } => {
            let (_, config) = app.target_config(config_override)?;
            let changes_dir = app.changes_dir(&config);
            with_engine(app, config_override, false, |engine| {
                engine.ensure_mutable(change)
            })?;
            let change = discover::find_change(&changes_dir, change)?;
            let side = if *revert { Side::Revert } else { Side::Change };
            scaffold::reorder(&change, side, files)?;
            out.emit(
                format!("Reordered {}/{}", change.name, side.dir_name()),
                json!({ "reordered": change.name }),
            );
            Ok(())
        }
        ChangeCommands::Delete { change } => {
            let (_, config) = app.target_config(config_override)?;
            let changes_dir = app.changes_dir(&config);
            with_engine(app, config_override, false, |engine| {
                engine.ensure_mutable(change)
            })?;
            let change = discover::find_change(&changes_dir, change)?;
            scaffold::delete(&change)?;
            out.emit(
                format!("Deleted {}", change.name),
                json!({ "deleted": change.name }),
            );
            Ok(())
        }
        ChangeCommands::List => {
            let listings = with_engine(app, config_override, false, |engine| engine.list())?;
            if out.json {
                let list: Vec<_> = listings
                    .iter()
                    .map(|l| {
                        json!({
                            "name": l.name,
                            "status": l.state.as_str(),
                            "orphaned": l.orphaned,
                            "hasRevert": l.has_revert,
                            "executedAt": l.executed_at,
                        })
                    })
                    .collect();
                println!("{}", json!({ "changes": list }));
            } else if listings.is_empty() {
                println!("No changes");
            } else {
                for l in &listings {
                    println!(
                        "{:<9} {}{}{}",
                        l.state.as_str(),
                        l.name,
                        if l.orphaned { "  [orphaned]" } else { "" },
                        if l.has_revert { "" } else { "  [no revert]" }
                    );
                }
            }
            Ok(())
        }
        ChangeCommands::Run {
            name,
            force,
            confirm,
        } => {
            let (config_name, config) = app.target_config(config_override)?;
            app.confirm_protected(&config_name, &config, confirm.as_deref())?;
            let opts = RunOptions {
                force: *force,
                ..Default::default()
            };
            let outcome = with_engine(app, config_override, true, |engine| {
                if engine.check_needs_run(name, opts.force)?.is_none() {
                    return Err(noorm::Error::AlreadyApplied(name.clone()));
                }
                engine.run(name, opts)
            })?;
            out.emit(describe_outcome(&outcome), outcome_json(&outcome));
            if !outcome.succeeded() {
                return Err(anyhow!("change '{}' failed", name));
            }
            Ok(())
        }
        ChangeCommands::Revert { name, confirm } => {
            let (config_name, config) = app.target_config(config_override)?;
            app.confirm_protected(&config_name, &config, confirm.as_deref())?;
            let outcome = with_engine(app, config_override, true, |engine| {
                engine.revert(name, RunOptions::default())
            })?;
            out.emit(describe_outcome(&outcome), outcome_json(&outcome));
            if !outcome.succeeded() {
                return Err(anyhow!("revert of '{}' failed", name));
            }
            Ok(())
        }
        ChangeCommands::Next { confirm } => {
            let (config_name, config) = app.target_config(config_override)?;
            app.confirm_protected(&config_name, &config, confirm.as_deref())?;
            let outcome = with_engine(app, config_override, true, |engine| {
                engine.next(RunOptions::default())
            })?;
            match outcome {
                Some(outcome) => {
                    out.emit(describe_outcome(&outcome), outcome_json(&outcome));
                    if !outcome.succeeded() {
                        return Err(anyhow!("change '{}' failed", outcome.name));
                    }
                }
                None => out.emit("Nothing to do", json!({ "status": "nothing-to-do" })),
            }
            Ok(())
        }
        ChangeCommands::Ff {
            force,
            no_abort,
            confirm,
        } => {
            let (config_name, config) = app.target_config(config_override)?;
            app.confirm_protected(&config_name, &config, confirm.as_deref())?;
            let opts = RunOptions {
                force: *force,
                abort_on_error: !*no_abort,
            };
            let outcomes = with_engine(app, config_override, true, |engine| engine.ff(opts))?;
            if out.json {
                println!(
                    "{}",
                    json!({ "applied": outcomes.iter().map(outcome_json).collect::<Vec<_>>() })
                );
            } else if outcomes.is_empty() {
                println!("Nothing to do");
            } else {
                for outcome in &outcomes {
                    println!("{}", describe_outcome(outcome));
                }
            }
            if let Some(failed) = outcomes.iter().find(|o| !o.succeeded()) {
                return Err(anyhow!("change '{}' failed", failed.name));
            }
            Ok(())
        }
        ChangeCommands::Rewind { target, confirm } => {
            let (config_name, config) = app.target_config(config_override)?;
            app.confirm_protected(&config_name, &config, confirm.as_deref())?;
            let target = match target.parse::<usize>() {
                Ok(count) => RewindTarget::Count(count),
                Err(_) => RewindTarget::Name(target.clone()),
            };
            let outcomes = with_engine(app, config_override, true, |engine| {
                engine.rewind(target, RunOptions::default())
            })?;
            if out.json {
                println!(
                    "{}",
                    json!({ "reverted": outcomes.iter().map(outcome_json).collect::<Vec<_>>() })
                );
            } else {
                for outcome in &outcomes {
                    println!("{}", describe_outcome(outcome));
                }
            }
            if let Some(failed) = outcomes.iter().find(|o| !o.succeeded()) {
                return Err(anyhow!("revert of '{}' failed", failed.name));
            }
            Ok(())
        }
        ChangeCommands::History { limit } => {
            let records =
                with_engine(app, config_override, false, |engine| engine.history(*limit))?;
            if out.json {
                let list: Vec<_> = records
                    .iter()
                    .map(|r| {
                        json!({
                            "id": r.id,
                            "name": r.name,
                            "direction": r.direction.as_str(),
                            "status": r.status.as_str(),
                            "executedAt": r.executed_at,
                            "executedBy": r.executed_by,
                            "durationMs": r.duration_ms,
                            "error": r.error_message,
                        })
                    })
                    .collect();
                println!("{}", json!({ "history": list }));
            } else {
                for r in &records {
                    println!(
                        "#{:<5} {:<7} {:<8} {}  by {} at {}",
                        r.id,
                        r.direction.as_str(),
                        r.status.as_str(),
                        r.name,
                        r.executed_by,
                        r.executed_at
                    );
                }
            }
            Ok(())
        }
        ChangeCommands::Forget { name } => {
            let deleted =
                with_engine(app, config_override, false, |engine| engine.forget(name))?;
            out.emit(
                format!("Forgot '{}' ({} operations removed)", name, deleted),
                json!({ "forgotten": name, "operations": deleted }),
            );
            Ok(())
        }
    }
}

// ---- runner ----

fn cmd_run(
    app: &mut App,
    command: &RunCommands,
    config_override: Option<&str>,
    out: Output,
) -> Result<()> {
    let (name, config) = app.target_config(config_override)?;
    let (force, confirm, mode) = match command {
        RunCommands::Build { force, confirm } => (*force, confirm, "build"),
        RunCommands::File { force, confirm, .. } => (*force, confirm, "file"),
        RunCommands::Dir { force, confirm, .. } => (*force, confirm, "dir"),
    };
    app.confirm_protected(&name, &config, confirm.as_deref())?;
    app.check_stage_secrets(&name, &config)?;

    let identity = app.identity_for(&config).formatted();
    let template = app.template_engine()?;
    let ctx = app.render_context(&name, &config);
    let project_root = app.project_root.clone();
    let sql_dir = app.sql_dir(&config);
    let build_paths = app.settings.effective_build_paths(&name, &config);
    let bus = app.bus.clone();
    let locks = noorm::lock::LockManager::new(bus.clone());
    let opts = BuildOptions {
        force,
        ..Default::default()
    };

    let driver = app.prepare_connection(&name, &config)?;
    let outcome = locks.with_lock(driver.as_mut(), &name, &identity, |driver| {
        let mut runner = FileRunner::new(driver, &template, &ctx, &bus, &project_root);
        match command {
            RunCommands::Build { .. } => runner.run_build(&sql_dir, &build_paths, opts),
            RunCommands::Dir { path, .. } => runner.run_dir(path, opts),
            RunCommands::File { path, .. } => {
                runner.run_file(path, opts).map(|file| noorm::runner::BatchOutcome {
                    status: if file.status == noorm::db::records::ExecutionStatus::Failed {
                        noorm::runner::BatchStatus::Failed
                    } else {
                        noorm::runner::BatchStatus::Success
                    },
                    files: vec![file],
                })
            }
        }
    })?;

    let (executed, skipped, failed) = outcome.counts();
    out.emit(
        format!(
            "{} {}: {} executed, {} skipped, {} failed",
            mode,
            outcome.status.as_str(),
            executed,
            skipped,
            failed
        ),
        json!({
            "mode": mode,
            "status": outcome.status.as_str(),
            "executed": executed,
            "skipped": skipped,
            "failed": failed,
            "files": outcome.files.iter().map(|f| json!({
                "filepath": f.filepath,
                "status": f.status.as_str(),
                "skipReason": f.skip_reason,
                "error": f.error,
            })).collect::<Vec<_>>(),
        }),
    );

    if !outcome.succeeded() {
        return Err(anyhow!("{} finished with failures", mode));
    }
    Ok(())
}

// ---- lock ----

fn cmd_lock(
    app: &mut App,
    command: &LockCommands,
    config_override: Option<&str>,
    out: Output,
) -> Result<()> {
    let (name, config) = app.target_config(config_override)?;
    let identity = app.identity_for(&config).formatted();
    let locks = noorm::lock::LockManager::new(app.bus.clone());
    let driver = app.prepare_connection(&name, &config)?;

    match command {
        LockCommands::Status => {
            let status = locks.status(driver.as_mut(), &name, &identity)?;
            let (human, payload) = match &status {
                LockStatus::Free => ("free".to_string(), json!({ "status": "free" })),
                LockStatus::HeldByMe { expires_at } => (
                    format!("held by you until {}", expires_at),
                    json!({ "status": "held-by-me", "expiresAt": expires_at }),
                ),
                LockStatus::HeldByOther {
                    holder,
                    since,
                    expired,
                } => (
                    format!(
                        "held by {} since {}{}",
                        holder,
                        since,
                        if *expired { " (expired)" } else { "" }
                    ),
                    json!({
                        "status": "held-by-other",
                        "holder": holder,
                        "since": since,
                        "expired": expired,
                    }),
                ),
            };
            out.emit(human, payload);
            Ok(())
        }
        LockCommands::Acquire => {
            locks.acquire(driver.as_mut(), &name, &identity)?;
            out.emit(
                format!("Lock acquired on '{}'", name),
                json!({ "acquired": name }),
            );
            Ok(())
        }
        LockCommands::Release => {
            locks.release(driver.as_mut(), &name, &identity)?;
            out.emit(
                format!("Lock released on '{}'", name),
                json!({ "released": name }),
            );
            Ok(())
        }
        LockCommands::Force => {
            locks.force_release(driver.as_mut(), &name)?;
            out.emit(
                format!("Lock force-released on '{}'", name),
                json!({ "forceReleased": name }),
            );
            Ok(())
        }
    }
}

// ---- db inspect / reset ----

fn cmd_db(
    app: &mut App,
    command: &DbCommands,
    config_override: Option<&str>,
    out: Output,
) -> Result<()> {
    let (name, config) = app.target_config(config_override)?;
    let dialect = config.dialect;
    let identity = app.identity_for(&config).formatted();
    let locks = noorm::lock::LockManager::new(app.bus.clone());

    match command {
        DbCommands::Tables => {
            let driver = app.prepare_connection(&name, &config)?;
            let tables = explore::list_tables(driver.as_mut(), dialect)?;
            out.emit(tables.join("\n"), json!({ "tables": tables }));
            Ok(())
        }
        DbCommands::Views => {
            let driver = app.prepare_connection(&name, &config)?;
            let views = explore::list_views(driver.as_mut(), dialect)?;
            out.emit(views.join("\n"), json!({ "views": views }));
            Ok(())
        }
        DbCommands::Truncate { table, confirm } => {
            app.confirm_protected(&name, &config, confirm.as_deref())?;
            let driver = app.prepare_connection(&name, &config)?;
            locks.with_lock(driver.as_mut(), &name, &identity, |driver| {
                explore::truncate_table(driver, dialect, table)
            })?;
            out.emit(
                format!("Truncated {}", table),
                json!({ "truncated": table }),
            );
            Ok(())
        }
        DbCommands::Teardown { all, confirm } => {
            // Teardown is blocked outright on protected configs
            if config.protected {
                return Err(noorm::Error::ProtectedAction {
                    config: name.clone(),
                }
                .into());
            }
            app.confirm_protected(&name, &config, confirm.as_deref())?;
            let driver = app.prepare_connection(&name, &config)?;
            let report = locks.with_lock(driver.as_mut(), &name, &identity, |driver| {
                explore::teardown(driver, dialect, *all)
            })?;
            out.emit(
                format!(
                    "Dropped {} views, {} tables",
                    report.dropped_views.len(),
                    report.dropped_tables.len()
                ),
                json!({
                    "droppedViews": report.dropped_views,
                    "droppedTables": report.dropped_tables,
                }),
            );
            Ok(())
        }
    }
}

fn cmd_reset(
    app: &mut App,
    config_override: Option<&str>,
    confirm: Option<&str>,
    out: Output,
) -> Result<()> {
    let (name, config) = app.target_config(config_override)?;
    app.confirm_protected(&name, &config, confirm)?;
    app.check_stage_secrets(&name, &config)?;

    let dialect = config.dialect;
    let identity = app.identity_for(&config).formatted();
    let template = app.template_engine()?;
    let ctx = app.render_context(&name, &config);
    let project_root = app.project_root.clone();
    let sql_dir = app.sql_dir(&config);
    let build_paths = app.settings.effective_build_paths(&name, &config);
    let bus = app.bus.clone();
    let locks = noorm::lock::LockManager::new(bus.clone());

    let driver = app.prepare_connection(&name, &config)?;
    let outcome = locks.with_lock(driver.as_mut(), &name, &identity, |driver| {
        explore::teardown(driver, dialect, false)?;
        let mut runner = FileRunner::new(driver, &template, &ctx, &bus, &project_root);
        // The objects are gone even though builder rows still match, so
        // a reset always re-executes.
        runner.run_build(
            &sql_dir,
            &build_paths,
            BuildOptions {
                force: true,
                ..Default::default()
            },
        )
    })?;

    let (executed, _, failed) = outcome.counts();
    out.emit(
        format!(
            "Reset {}: {} executed, {} failed",
            outcome.status.as_str(),
            executed,
            failed
        ),
        json!({ "status": outcome.status.as_str(), "executed": executed, "failed": failed }),
    );
    if !outcome.succeeded() {
        return Err(anyhow!("reset finished with failures"));
    }
    Ok(())
}

// ---- identity ----

fn cmd_identity(
    app: &mut App,
    command: &IdentityCommands,
    config_override: Option<&str>,
    out: Output,
) -> Result<()> {
    match command {
        IdentityCommands::Show => {
            let crypto = app.crypto_identity().clone();
            out.emit(
                format!(
                    "{} <{}>\n  hash: {} ({})\n  machine: {}",
                    crypto.name,
                    crypto.email,
                    crypto.identity_hash,
                    crypto.short_id(),
                    crypto.machine
                ),
                json!({
                    "name": crypto.name,
                    "email": crypto.email,
                    "identityHash": crypto.identity_hash,
                    "machine": crypto.machine,
                }),
            );
            Ok(())
        }
        IdentityCommands::Sync => {
            let (name, config) = app.target_config(config_override)?;
            let roster = {
                let driver = app.prepare_connection(&name, &config)?;
                noorm::db::records::list_identities(driver.as_mut())?
            };
            let count = roster.len();
            for (hash, user_name, email, machine) in roster {
                app.state
                    .record_known_user(&hash, &user_name, &email, &machine)?;
            }
            out.emit(
                format!("Synced {} identities", count),
                json!({ "synced": count }),
            );
            Ok(())
        }
    }
}

// ---- version ----

fn cmd_version(app: &mut App, out: Output) -> Result<()> {
    let state_version = app.state.state().schema_version;
    let settings_version = app.settings.settings().schema_version;
    out.emit(
        format!(
            "noorm {}\n  state schema: v{}\n  settings schema: v{}\n  tracking tables: v{} (expected)",
            env!("CARGO_PKG_VERSION"),
            state_version,
            settings_version,
            noorm::db::schema::SCHEMA_VERSION
        ),
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "stateVersion": state_version,
            "settingsVersion": settings_version,
            "schemaVersion": noorm::db::schema::SCHEMA_VERSION,
        }),
    );
    Ok(())
}
