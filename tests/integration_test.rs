// tests/integration_test.rs

//! Integration tests for noorm
//!
//! These tests exercise end-to-end flows across modules: project init,
//! schema builds, change apply/revert, lock contention between two
//! connections, and tamper detection on the encrypted state.

use noorm::app::App;
use noorm::changes::engine::{ChangeEngine, RunOptions};
use noorm::db::adapter::{Dialect, Driver, SqliteDriver};
use noorm::db::records::ChangeState;
use noorm::db::schema;
use noorm::events::EventBus;
use noorm::lock::LockManager;
use noorm::runner::{BuildOptions, FileRunner};
use noorm::settings::rules::BuildPaths;
use noorm::state::model::Config;
use noorm::template::{RenderContext, TemplateEngine};
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tempfile::{tempdir, TempDir};

// NOORM_IDENTITY is process-global; every test that builds an App takes
// this lock so parallel tests cannot swap identities mid-flight.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn setup_project() -> (TempDir, App) {
    let project = tempdir().unwrap();
    std::env::set_var(
        "NOORM_IDENTITY",
        project
            .path()
            .join("home-noorm/identity.key")
            .display()
            .to_string(),
    );
    std::env::remove_var("NOORM_YES");

    let mut app = App::init(project.path(), EventBus::new()).unwrap();

    let db_path = project.path().join("app.db");
    let mut config = Config::new(Dialect::Sqlite, db_path.display().to_string());
    config.extra.insert(
        "default_role".to_string(),
        serde_json::json!("member"),
    );
    app.state.upsert_config("dev", config).unwrap();
    app.state.set_active_config("dev").unwrap();

    fs::create_dir_all(project.path().join("sql")).unwrap();
    fs::create_dir_all(project.path().join("changes")).unwrap();
    (project, app)
}

fn write_file(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn test_fresh_build_skip_and_reexecute_on_edit() {
    let _guard = ENV_LOCK.lock().unwrap();
    let (project, mut app) = setup_project();

    write_file(
        project.path(),
        "sql/001_users.sql",
        "CREATE TABLE users(id INT PRIMARY KEY);",
    );
    write_file(
        project.path(),
        "sql/002_roles.sql.tmpl",
        "CREATE TABLE roles(name TEXT DEFAULT '{%~ config.default_role %}');",
    );

    let (name, config) = app.target_config(None).unwrap();
    let template = app.template_engine().unwrap();
    let ctx = app.render_context(&name, &config);
    let bus = app.bus.clone();
    let root = app.project_root.clone();
    let sql_dir = app.sql_dir(&config);

    let driver = app.prepare_connection(&name, &config).unwrap();
    let mut runner = FileRunner::new(driver.as_mut(), &template, &ctx, &bus, &root);

    // First build creates both tables
    let outcome = runner
        .run_build(&sql_dir, &BuildPaths::default(), BuildOptions::default())
        .unwrap();
    assert!(outcome.succeeded(), "fresh build should succeed");
    assert_eq!(outcome.counts(), (2, 0, 0));

    let rows = driver
        .query("SELECT sql FROM sqlite_master WHERE name='roles'", &[])
        .unwrap();
    assert!(
        rows[0].text("sql").unwrap().contains("'member'"),
        "template should render the config value"
    );

    // Second build reports both files unchanged
    let mut runner = FileRunner::new(driver.as_mut(), &template, &ctx, &bus, &root);
    let outcome = runner
        .run_build(&sql_dir, &BuildPaths::default(), BuildOptions::default())
        .unwrap();
    assert_eq!(outcome.counts(), (0, 2, 0), "repeat build should skip all");

    // Editing one file re-executes exactly that file
    write_file(
        project.path(),
        "sql/002_roles.sql.tmpl",
        "CREATE TABLE IF NOT EXISTS roles(name TEXT DEFAULT 'admin');",
    );
    let mut runner = FileRunner::new(driver.as_mut(), &template, &ctx, &bus, &root);
    let outcome = runner
        .run_build(&sql_dir, &BuildPaths::default(), BuildOptions::default())
        .unwrap();
    assert_eq!(outcome.counts(), (1, 1, 0));
}

#[test]
fn test_change_apply_revert_reapply_end_to_end() {
    let _guard = ENV_LOCK.lock().unwrap();
    let (project, mut app) = setup_project();

    let change = "2025-01-15-add-email";
    write_file(
        project.path(),
        &format!("changes/{}/change/001_add_col.sql", change),
        "ALTER TABLE users ADD COLUMN email TEXT;",
    );
    write_file(
        project.path(),
        &format!("changes/{}/revert/001_drop_col.sql", change),
        "ALTER TABLE users DROP COLUMN email;",
    );

    let (name, config) = app.target_config(None).unwrap();
    let identity = app.identity_for(&config).formatted();
    let template = app.template_engine().unwrap();
    let ctx = app.render_context(&name, &config);
    let bus = app.bus.clone();
    let root = app.project_root.clone();
    let changes_dir = app.changes_dir(&config);
    let sql_dir = app.sql_dir(&config);

    let driver = app.prepare_connection(&name, &config).unwrap();
    driver
        .execute_batch("CREATE TABLE users(id INT PRIMARY KEY);")
        .unwrap();

    let mut engine = ChangeEngine::new(
        driver.as_mut(),
        &template,
        &ctx,
        &bus,
        &root,
        &changes_dir,
        &sql_dir,
        identity,
    );

    assert!(engine.run(change, RunOptions::default()).unwrap().succeeded());
    assert_eq!(engine.list().unwrap()[0].state, ChangeState::Success);

    assert!(engine
        .revert(change, RunOptions::default())
        .unwrap()
        .succeeded());
    assert_eq!(engine.list().unwrap()[0].state, ChangeState::Reverted);

    assert!(engine.run(change, RunOptions::default()).unwrap().succeeded());
    assert_eq!(engine.list().unwrap()[0].state, ChangeState::Success);

    // Attribution lands in the history rows
    let history = engine.history(None).unwrap();
    assert_eq!(history.len(), 3);
    assert!(
        history[0].executed_by.contains('<'),
        "executed_by should be a formatted identity"
    );
}

#[test]
fn test_lock_contention_between_two_connections() {
    let db = tempdir().unwrap();
    let config = Config::new(
        Dialect::Sqlite,
        db.path().join("shared.db").display().to_string(),
    );

    // Two connections stand in for two processes
    let mut alice: Box<dyn Driver> = Box::new(SqliteDriver::open(&config).unwrap());
    let mut bob: Box<dyn Driver> = Box::new(SqliteDriver::open(&config).unwrap());
    schema::migrate(alice.as_mut(), "setup").unwrap();

    let locks = LockManager::new(EventBus::new());
    locks
        .acquire(alice.as_mut(), "prod", "Alice <alice@example.com>")
        .unwrap();

    let err = locks
        .acquire(bob.as_mut(), "prod", "Bob <bob@example.com>")
        .unwrap_err();
    match err {
        noorm::Error::LockAcquire { holder, .. } => {
            assert_eq!(holder, "Alice <alice@example.com>")
        }
        other => panic!("expected LockAcquire, got {:?}", other),
    }

    locks
        .release(alice.as_mut(), "prod", "Alice <alice@example.com>")
        .unwrap();
    locks
        .acquire(bob.as_mut(), "prod", "Bob <bob@example.com>")
        .unwrap();
}

#[test]
fn test_expired_lock_takeover_across_connections() {
    let db = tempdir().unwrap();
    let config = Config::new(
        Dialect::Sqlite,
        db.path().join("shared.db").display().to_string(),
    );

    let mut stale: Box<dyn Driver> = Box::new(SqliteDriver::open(&config).unwrap());
    schema::migrate(stale.as_mut(), "setup").unwrap();

    // A lock that expired a minute ago, left by a crashed process
    let past = (chrono::Utc::now() - chrono::Duration::minutes(1)).to_rfc3339();
    stale
        .execute(
            "INSERT INTO __noorm_lock__ (config_name, locked_by, locked_at, expires_at)
             VALUES ('prod', 'Ghost <ghost@example.com>', ?1, ?1)",
            &[noorm::db::adapter::Value::from(past)],
        )
        .unwrap();

    let mut fresh: Box<dyn Driver> = Box::new(SqliteDriver::open(&config).unwrap());
    let locks = LockManager::new(EventBus::new());
    locks
        .acquire(fresh.as_mut(), "prod", "Bob <bob@example.com>")
        .unwrap();

    let status = locks
        .status(fresh.as_mut(), "prod", "Bob <bob@example.com>")
        .unwrap();
    assert!(matches!(status, noorm::lock::LockStatus::HeldByMe { .. }));
}

#[test]
fn test_state_tampering_is_detected_on_reload() {
    let _guard = ENV_LOCK.lock().unwrap();
    let (project, mut app) = setup_project();
    app.state.set_global_secret("token", "secret").unwrap();

    // In-memory state keeps working
    assert_eq!(
        app.state.state().global_secrets.get("token").map(String::as_str),
        Some("secret")
    );

    // Flip one byte of the base64 ciphertext on disk
    let state_path = project.path().join(".noorm/state.enc");
    let blob = fs::read_to_string(&state_path).unwrap();
    let mut payload: serde_json::Value = serde_json::from_str(&blob).unwrap();
    let ciphertext = payload["ciphertext"].as_str().unwrap().to_string();
    let mut chars: Vec<char> = ciphertext.chars().collect();
    chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
    payload["ciphertext"] = serde_json::Value::String(chars.into_iter().collect());
    fs::write(&state_path, payload.to_string()).unwrap();

    let reload = App::open(project.path(), EventBus::new());
    assert!(reload.is_err(), "tampered state must fail to load");
}

#[test]
fn test_manifest_change_records_expanded_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    let (project, mut app) = setup_project();

    write_file(
        project.path(),
        "sql/views/active.sql",
        "CREATE VIEW active AS SELECT 1;",
    );
    write_file(
        project.path(),
        "sql/views/recent.sql",
        "CREATE VIEW recent AS SELECT 2;",
    );
    write_file(
        project.path(),
        "changes/2025-01-15-replay/change/001_replay_views.txt",
        "views/active.sql\nviews/recent.sql\n",
    );

    let (name, config) = app.target_config(None).unwrap();
    let identity = app.identity_for(&config).formatted();
    let template = app.template_engine().unwrap();
    let ctx = app.render_context(&name, &config);
    let bus = app.bus.clone();
    let root = app.project_root.clone();
    let changes_dir = app.changes_dir(&config);
    let sql_dir = app.sql_dir(&config);

    let driver = app.prepare_connection(&name, &config).unwrap();
    let mut engine = ChangeEngine::new(
        driver.as_mut(),
        &template,
        &ctx,
        &bus,
        &root,
        &changes_dir,
        &sql_dir,
        identity,
    );

    let outcome = engine
        .run("2025-01-15-replay", RunOptions::default())
        .unwrap();
    assert!(outcome.succeeded());

    // The recorded rows list the expanded files, not the manifest
    let files: Vec<&str> = outcome.files.iter().map(|f| f.filepath.as_str()).collect();
    assert_eq!(files, vec!["sql/views/active.sql", "sql/views/recent.sql"]);
}

#[test]
fn test_template_render_purity_gives_stable_checksums() {
    let dir = tempdir().unwrap();
    let engine = TemplateEngine::new(dir.path()).unwrap();
    let ctx = RenderContext {
        config: serde_json::json!({ "schema": "app" }),
        ..Default::default()
    };

    let source = "CREATE TABLE {%~ config.schema %}_audit(id INT);";
    let first = engine.render("t", source, &ctx).unwrap();
    let second = engine.render("t", source, &ctx).unwrap();
    assert_eq!(
        noorm::hash::sha256_hex(first.as_bytes()),
        noorm::hash::sha256_hex(second.as_bytes()),
        "same input and context must hash identically"
    );
}
