// src/changes/engine.rs

//! Change execution engine
//!
//! Runs change directories against the tracking tables: forward apply,
//! revert, single-step next, fast-forward, rewind, and history. Every
//! operation writes one `__noorm_change__` row and one
//! `__noorm_executions__` row per file, and a change's status is always
//! derived from that ledger, never stored.

use crate::changes::discover::{self, resolve_manifest};
use crate::changes::{Change, ChangeFileKind, Side};
use crate::db::adapter::Driver;
use crate::db::records::{
    derive_state, ChangeRecord, ChangeState, Direction, ExecutionRecord, ExecutionStatus,
    FileType, OperationStatus,
};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::hash::{combined_checksum, sha256_hex};
use crate::template::{RenderContext, TemplateEngine};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Options accepted by run/revert/ff/rewind
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Re-execute files even when checksums match
    pub force: bool,
    /// Stop the operation at the first failed file
    pub abort_on_error: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force: false,
            abort_on_error: true,
        }
    }
}

/// Why a change needs to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunReason {
    New,
    Reverted,
    Failed,
    Changed,
    Force,
}

impl RunReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunReason::New => "new",
            RunReason::Reverted => "reverted",
            RunReason::Failed => "failed",
            RunReason::Changed => "changed",
            RunReason::Force => "force",
        }
    }
}

/// Rewind target: a step count or a named change to revert back through
#[derive(Debug, Clone)]
pub enum RewindTarget {
    Count(usize),
    Name(String),
}

/// Per-file outcome of one operation
#[derive(Debug, Clone)]
pub struct FileOutcome {
    pub filepath: String,
    pub status: ExecutionStatus,
    pub skip_reason: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Outcome of one apply or revert operation
#[derive(Debug, Clone)]
pub struct OperationOutcome {
    pub name: String,
    pub direction: Direction,
    pub status: OperationStatus,
    pub files: Vec<FileOutcome>,
    pub duration_ms: i64,
}

impl OperationOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == OperationStatus::Success
    }
}

/// One entry in `list()`
#[derive(Debug, Clone)]
pub struct ChangeListing {
    pub name: String,
    pub state: ChangeState,
    pub orphaned: bool,
    pub description: String,
    pub has_revert: bool,
    pub executed_at: Option<String>,
}

/// A file queued for execution, fully rendered
struct PlannedExec {
    filepath: String,
    file_type: FileType,
    checksum: String,
    sql: String,
}

/// A fully planned side of a change
struct Plan {
    execs: Vec<PlannedExec>,
    /// One checksum per change file (manifests collapse to one entry)
    combined: String,
}

/// The change engine, bound to one open connection and one project
pub struct ChangeEngine<'a> {
    driver: &'a mut dyn Driver,
    template: &'a TemplateEngine,
    ctx: &'a RenderContext,
    bus: &'a EventBus,
    project_root: PathBuf,
    changes_dir: PathBuf,
    sql_dir: PathBuf,
    identity: String,
}

impl<'a> ChangeEngine<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: &'a mut dyn Driver,
        template: &'a TemplateEngine,
        ctx: &'a RenderContext,
        bus: &'a EventBus,
        project_root: &Path,
        changes_dir: &Path,
        sql_dir: &Path,
        identity: String,
    ) -> Self {
        Self {
            driver,
            template,
            ctx,
            bus,
            project_root: project_root.to_path_buf(),
            changes_dir: changes_dir.to_path_buf(),
            sql_dir: sql_dir.to_path_buf(),
            identity,
        }
    }

    /// The changes directory this engine reads
    pub fn changes_dir(&self) -> &Path {
        &self.changes_dir
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.project_root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Render one side of a change into an execution plan.
    ///
    /// Validation happens here, before any database write: sequences must
    /// parse, manifests must resolve, templates must render.
    fn plan_side(&self, change: &Change, side: Side) -> Result<Plan> {
        let files = change.files_for(side);
        let mut execs = Vec::new();
        let mut file_checksums = Vec::new();

        for file in files {
            if file.sequence.is_none() {
                return Err(Error::ChangeValidation {
                    name: change.name.clone(),
                    reason: format!(
                        "{}/{} has no NNN_ sequence prefix",
                        side.dir_name(),
                        file.filename
                    ),
                });
            }

            match file.kind {
                ChangeFileKind::Sql => {
                    let sql = self.template.render_path(&file.path, self.ctx)?;
                    let checksum = sha256_hex(sql.as_bytes());
                    file_checksums.push(checksum.clone());
                    execs.push(PlannedExec {
                        filepath: self.display_path(&file.path),
                        file_type: FileType::Sql,
                        checksum,
                        sql,
                    });
                }
                ChangeFileKind::Manifest => {
                    let targets = resolve_manifest(file, &self.sql_dir)?;
                    let mut ref_checksums = String::new();
                    for target in targets {
                        let sql = self.template.render_path(&target, self.ctx)?;
                        let checksum = sha256_hex(sql.as_bytes());
                        ref_checksums.push_str(&checksum);
                        // Rows born from a manifest keep that provenance
                        // in file_type
                        execs.push(PlannedExec {
                            filepath: self.display_path(&target),
                            file_type: FileType::Manifest,
                            checksum,
                            sql,
                        });
                    }
                    // The manifest's own checksum is derived from its
                    // targets, so editing a referenced file marks the
                    // change as edited too.
                    file_checksums.push(sha256_hex(ref_checksums.as_bytes()));
                }
            }
        }

        Ok(Plan {
            execs,
            combined: combined_checksum(&file_checksums),
        })
    }

    /// Locate a change on disk, distinguishing never-existed from
    /// orphaned (history rows but no files).
    fn find_change(&mut self, name: &str) -> Result<Change> {
        match discover::find_change(&self.changes_dir, name) {
            Ok(change) => Ok(change),
            Err(Error::ChangeNotFound(_)) => {
                let records = ChangeRecord::for_change(self.driver, name)?;
                if records.is_empty() {
                    Err(Error::ChangeNotFound(name.to_string()))
                } else {
                    Err(Error::Orphaned(name.to_string()))
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Staleness test: why would this change run, if at all?
    pub fn needs_run(&mut self, change: &Change, force: bool) -> Result<Option<RunReason>> {
        if force {
            return Ok(Some(RunReason::Force));
        }
        let records = ChangeRecord::for_change(self.driver, &change.name)?;
        Ok(match derive_state(&records) {
            ChangeState::Pending => Some(RunReason::New),
            ChangeState::Reverted => Some(RunReason::Reverted),
            ChangeState::Failed => Some(RunReason::Failed),
            ChangeState::Success => {
                let plan = self.plan_side(change, Side::Change)?;
                let recorded = records
                    .iter()
                    .rev()
                    .find(|r| {
                        r.direction == Direction::Apply && r.status == OperationStatus::Success
                    })
                    .and_then(|r| r.checksum.clone());
                if recorded.as_deref() != Some(plan.combined.as_str()) {
                    Some(RunReason::Changed)
                } else {
                    None
                }
            }
        })
    }

    /// `needs_run` by name, locating the change first
    pub fn check_needs_run(&mut self, name: &str, force: bool) -> Result<Option<RunReason>> {
        let change = self.find_change(name)?;
        self.needs_run(&change, force)
    }

    /// Execute a plan under a fresh operation row
    fn execute_plan(
        &mut self,
        name: &str,
        direction: Direction,
        plan: Plan,
        opts: RunOptions,
        allow_skip: bool,
    ) -> Result<OperationOutcome> {
        let op_id = ChangeRecord::start(self.driver, name, direction, &self.identity)?;
        self.bus.info(
            "change:start",
            format!("{} {}", direction.as_str(), name),
            Some(json!({ "change": name, "direction": direction.as_str(), "files": plan.execs.len() })),
        );

        let started = Instant::now();
        let mut outcomes = Vec::new();
        let mut first_error: Option<String> = None;

        for exec in &plan.execs {
            // Unchanged files skip only on a repeat apply; a run after a
            // revert must re-execute everything.
            if allow_skip && !opts.force && first_error.is_none() {
                let previous = ExecutionRecord::last_success_checksum(
                    self.driver,
                    Some(name),
                    &exec.filepath,
                )?;
                if previous.as_deref() == Some(exec.checksum.as_str()) {
                    debug!("Skipping unchanged {}", exec.filepath);
                    ExecutionRecord::record(
                        self.driver,
                        Some(op_id),
                        &exec.filepath,
                        exec.file_type,
                        &exec.checksum,
                        ExecutionStatus::Skipped,
                        Some("unchanged"),
                        None,
                        0,
                    )?;
                    outcomes.push(FileOutcome {
                        filepath: exec.filepath.clone(),
                        status: ExecutionStatus::Skipped,
                        skip_reason: Some("unchanged".to_string()),
                        error: None,
                        duration_ms: 0,
                    });
                    continue;
                }
            }

            if first_error.is_some() && opts.abort_on_error {
                break;
            }

            let file_start = Instant::now();
            let result = self.driver.execute_batch(&exec.sql);
            let duration_ms = file_start.elapsed().as_millis() as i64;

            match result {
                Ok(()) => {
                    ExecutionRecord::record(
                        self.driver,
                        Some(op_id),
                        &exec.filepath,
                        exec.file_type,
                        &exec.checksum,
                        ExecutionStatus::Success,
                        None,
                        None,
                        duration_ms,
                    )?;
                    self.bus.debug(
                        "change:file",
                        format!("executed {}", exec.filepath),
                        Some(json!({ "change": name, "file": exec.filepath, "status": "success" })),
                    );
                    outcomes.push(FileOutcome {
                        filepath: exec.filepath.clone(),
                        status: ExecutionStatus::Success,
                        skip_reason: None,
                        error: None,
                        duration_ms,
                    });
                }
                Err(err) => {
                    let message = err.to_string();
                    warn!("File {} failed: {}", exec.filepath, message);
                    ExecutionRecord::record(
                        self.driver,
                        Some(op_id),
                        &exec.filepath,
                        exec.file_type,
                        &exec.checksum,
                        ExecutionStatus::Failed,
                        None,
                        Some(&message),
                        duration_ms,
                    )?;
                    outcomes.push(FileOutcome {
                        filepath: exec.filepath.clone(),
                        status: ExecutionStatus::Failed,
                        skip_reason: None,
                        error: Some(message.clone()),
                        duration_ms,
                    });
                    if first_error.is_none() {
                        first_error = Some(message);
                    }
                }
            }
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        let status = if first_error.is_none() {
            OperationStatus::Success
        } else {
            OperationStatus::Failed
        };
        ChangeRecord::complete(
            self.driver,
            op_id,
            status,
            duration_ms,
            first_error.as_deref(),
            Some(&plan.combined),
        )?;

        let event = if status == OperationStatus::Success {
            "change:complete"
        } else {
            "change:failed"
        };
        self.bus.emit(
            event,
            if status == OperationStatus::Success {
                crate::events::Level::Info
            } else {
                crate::events::Level::Error
            },
            format!("{} {} {}", direction.as_str(), name, status.as_str()),
            Some(json!({
                "change": name,
                "direction": direction.as_str(),
                "status": status.as_str(),
                "durationMs": duration_ms,
            })),
        );
        info!(
            "{} {} finished: {} ({} files, {} ms)",
            direction.as_str(),
            name,
            status.as_str(),
            outcomes.len(),
            duration_ms
        );

        Ok(OperationOutcome {
            name: name.to_string(),
            direction,
            status,
            files: outcomes,
            duration_ms,
        })
    }

    /// Apply one change forward
    pub fn run(&mut self, name: &str, opts: RunOptions) -> Result<OperationOutcome> {
        let change = self.find_change(name)?;
        if change.change_files.is_empty() {
            return Err(Error::ChangeValidation {
                name: change.name.clone(),
                reason: "change/ contains no SQL or manifest files".to_string(),
            });
        }

        let plan = self.plan_side(&change, Side::Change)?;
        let records = ChangeRecord::for_change(self.driver, name)?;
        let allow_skip = derive_state(&records) == ChangeState::Success;

        self.execute_plan(name, Direction::Apply, plan, opts, allow_skip)
    }

    /// Revert one change using its `revert/` side in reverse order
    pub fn revert(&mut self, name: &str, opts: RunOptions) -> Result<OperationOutcome> {
        let change = self.find_change(name)?;

        let records = ChangeRecord::for_change(self.driver, name)?;
        match derive_state(&records) {
            ChangeState::Success | ChangeState::Failed => {}
            ChangeState::Pending | ChangeState::Reverted => {
                return Err(Error::NotApplied(name.to_string()));
            }
        }

        if change.revert_files.is_empty() {
            return Err(Error::ChangeValidation {
                name: change.name.clone(),
                reason: "revert/ contains no files; write one before reverting".to_string(),
            });
        }

        let plan = self.plan_side(&change, Side::Revert)?;
        self.execute_plan(name, Direction::Revert, plan, opts, false)
    }

    /// Apply the single first pending change, or report nothing-to-do
    pub fn next(&mut self, opts: RunOptions) -> Result<Option<OperationOutcome>> {
        let changes = discover::discover_changes(&self.changes_dir)?;
        for change in changes {
            let records = ChangeRecord::for_change(self.driver, &change.name)?;
            if derive_state(&records).is_pending() {
                let name = change.name.clone();
                return self.run(&name, opts).map(Some);
            }
        }
        Ok(None)
    }

    /// Apply all pending changes in canonical order, stopping on the
    /// first failure when `abort_on_error` is set.
    pub fn ff(&mut self, opts: RunOptions) -> Result<Vec<OperationOutcome>> {
        let changes = discover::discover_changes(&self.changes_dir)?;
        let mut outcomes = Vec::new();

        for change in changes {
            let records = ChangeRecord::for_change(self.driver, &change.name)?;
            if !derive_state(&records).is_pending() {
                continue;
            }
            let outcome = self.run(&change.name, opts)?;
            let failed = !outcome.succeeded();
            outcomes.push(outcome);
            if failed && opts.abort_on_error {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Revert the last `n` applied changes, or back to and including a
    /// named change. Targets are validated before anything runs.
    pub fn rewind(&mut self, target: RewindTarget, opts: RunOptions) -> Result<Vec<OperationOutcome>> {
        let mut applied = ChangeRecord::applied_in_order(self.driver)?;
        applied.reverse();

        let targets: Vec<String> = match &target {
            RewindTarget::Count(n) => applied.iter().take(*n).cloned().collect(),
            RewindTarget::Name(name) => {
                let Some(pos) = applied.iter().position(|a| a == name) else {
                    return Err(Error::NotApplied(name.clone()));
                };
                applied[..=pos].to_vec()
            }
        };

        // Every target must exist on disk and carry revert files before
        // the first revert starts.
        for name in &targets {
            let change = self.find_change(name)?;
            if change.revert_files.is_empty() {
                return Err(Error::ChangeValidation {
                    name: name.clone(),
                    reason: "rewind needs revert/ files for every target".to_string(),
                });
            }
        }

        let mut outcomes = Vec::new();
        for name in &targets {
            let outcome = self.revert(name, opts)?;
            let failed = !outcome.succeeded();
            outcomes.push(outcome);
            if failed && opts.abort_on_error {
                break;
            }
        }
        Ok(outcomes)
    }

    /// All changes with their derived status, disk-first, then orphans
    pub fn list(&mut self) -> Result<Vec<ChangeListing>> {
        let changes = discover::discover_changes(&self.changes_dir)?;
        let mut listings = Vec::new();
        let mut on_disk = std::collections::BTreeSet::new();

        for change in &changes {
            on_disk.insert(change.name.clone());
            let records = ChangeRecord::for_change(self.driver, &change.name)?;
            let executed_at = records
                .iter()
                .rev()
                .find(|r| r.status == OperationStatus::Success)
                .map(|r| r.executed_at.clone());
            listings.push(ChangeListing {
                name: change.name.clone(),
                state: derive_state(&records),
                orphaned: false,
                description: change.description.clone(),
                has_revert: !change.revert_files.is_empty(),
                executed_at,
            });
        }

        for name in ChangeRecord::recorded_names(self.driver)? {
            if on_disk.contains(&name) {
                continue;
            }
            let records = ChangeRecord::for_change(self.driver, &name)?;
            listings.push(ChangeListing {
                state: derive_state(&records),
                orphaned: true,
                description: String::new(),
                has_revert: false,
                executed_at: records.last().map(|r| r.executed_at.clone()),
                name,
            });
        }

        Ok(listings)
    }

    /// Raw operation history, newest first
    pub fn history(&mut self, limit: Option<usize>) -> Result<Vec<ChangeRecord>> {
        ChangeRecord::history(self.driver, limit)
    }

    /// Remove an orphaned change from history. The SQL is gone, so this
    /// is the only way to clear its records.
    pub fn forget(&mut self, name: &str) -> Result<usize> {
        if self.changes_dir.join(name).is_dir() {
            return Err(Error::ChangeValidation {
                name: name.to_string(),
                reason: "change still exists on disk; delete it first".to_string(),
            });
        }
        let deleted = ChangeRecord::delete_for_change(self.driver, name)?;
        if deleted == 0 {
            return Err(Error::ChangeNotFound(name.to_string()));
        }
        info!("Forgot orphaned change {}", name);
        Ok(deleted)
    }

    /// Guard for the scaffold API: a change that ever applied
    /// successfully is immutable.
    pub fn ensure_mutable(&mut self, name: &str) -> Result<()> {
        let records = ChangeRecord::for_change(self.driver, name)?;
        let ever_applied = records.iter().any(|r| {
            r.direction == Direction::Apply && r.status == OperationStatus::Success
        });
        if ever_applied {
            return Err(Error::ChangeValidation {
                name: name.to_string(),
                reason: "change has been applied; create a new change instead".to_string(),
            });
        }
        Ok(())
    }
}
