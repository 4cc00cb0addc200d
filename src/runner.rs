// src/runner.rs

//! Schema builder / file runner
//!
//! Executes the idempotent baseline: single files, directories, or the
//! whole schema tree filtered through the settings rule evaluator. Every
//! file is rendered, checksummed, and recorded as a builder row
//! (`change_id IS NULL`); unchanged files skip instead of re-executing, so
//! repeat builds are cheap and auditable.

use crate::db::adapter::Driver;
use crate::db::records::{ExecutionRecord, ExecutionStatus, FileType};
use crate::error::{Error, Result};
use crate::events::EventBus;
use crate::hash::sha256_hex;
use crate::settings::rules::BuildPaths;
use crate::template::{RenderContext, TemplateEngine};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Options for one runner invocation
#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    /// Execute files even when their checksum matches the last success
    pub force: bool,
    /// Stop the batch at the first failed file
    pub abort_on_error: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            force: false,
            abort_on_error: true,
        }
    }
}

/// Outcome of one file
#[derive(Debug, Clone)]
pub struct FileResult {
    pub filepath: String,
    pub status: ExecutionStatus,
    pub skip_reason: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Overall status of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Success,
    Partial,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Success => "success",
            BatchStatus::Partial => "partial",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Accumulated results of a batch run
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub files: Vec<FileResult>,
}

impl BatchOutcome {
    fn from_files(files: Vec<FileResult>) -> Self {
        let failures = files
            .iter()
            .filter(|f| f.status == ExecutionStatus::Failed)
            .count();
        let successes = files
            .iter()
            .filter(|f| f.status != ExecutionStatus::Failed)
            .count();
        let status = if failures == 0 {
            BatchStatus::Success
        } else if successes > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Failed
        };
        Self { status, files }
    }

    pub fn succeeded(&self) -> bool {
        self.status == BatchStatus::Success
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let mut executed = 0;
        let mut skipped = 0;
        let mut failed = 0;
        for file in &self.files {
            match file.status {
                ExecutionStatus::Success => executed += 1,
                ExecutionStatus::Skipped => skipped += 1,
                ExecutionStatus::Failed => failed += 1,
            }
        }
        (executed, skipped, failed)
    }
}

fn is_sql_file(path: &Path) -> bool {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    name.ends_with(".sql") || name.ends_with(".sql.tmpl")
}

/// Collect SQL files depth-first: entries at each level are visited in
/// name order, directories before their own contents come up naturally.
fn collect_sql_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .collect();
    entries.sort();

    let mut files = Vec::new();
    for entry in entries {
        if entry.is_dir() {
            files.extend(collect_sql_files(&entry)?);
        } else if is_sql_file(&entry) {
            files.push(entry);
        }
    }
    Ok(files)
}

/// The file runner, bound to one open connection and one project
pub struct FileRunner<'a> {
    driver: &'a mut dyn Driver,
    template: &'a TemplateEngine,
    ctx: &'a RenderContext,
    bus: &'a EventBus,
    project_root: PathBuf,
}

impl<'a> FileRunner<'a> {
    pub fn new(
        driver: &'a mut dyn Driver,
        template: &'a TemplateEngine,
        ctx: &'a RenderContext,
        bus: &'a EventBus,
        project_root: &Path,
    ) -> Self {
        Self {
            driver,
            template,
            ctx,
            bus,
            project_root: project_root.to_path_buf(),
        }
    }

    fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.project_root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    /// Render, checksum, and (unless unchanged) execute one file
    pub fn run_file(&mut self, path: &Path, opts: BuildOptions) -> Result<FileResult> {
        if !path.is_file() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )));
        }

        let filepath = self.display_path(path);
        let sql = self.template.render_path(path, self.ctx)?;
        let checksum = sha256_hex(sql.as_bytes());

        if !opts.force {
            let previous =
                ExecutionRecord::last_success_checksum(self.driver, None, &filepath)?;
            if previous.as_deref() == Some(checksum.as_str()) {
                debug!("Skipping unchanged {}", filepath);
                ExecutionRecord::record(
                    self.driver,
                    None,
                    &filepath,
                    FileType::Sql,
                    &checksum,
                    ExecutionStatus::Skipped,
                    Some("unchanged"),
                    None,
                    0,
                )?;
                return Ok(FileResult {
                    filepath,
                    status: ExecutionStatus::Skipped,
                    skip_reason: Some("unchanged".to_string()),
                    error: None,
                    duration_ms: 0,
                });
            }
        }

        let started = Instant::now();
        let result = self.driver.execute_batch(&sql);
        let duration_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                ExecutionRecord::record(
                    self.driver,
                    None,
                    &filepath,
                    FileType::Sql,
                    &checksum,
                    ExecutionStatus::Success,
                    None,
                    None,
                    duration_ms,
                )?;
                self.bus.info(
                    "run:file",
                    format!("executed {}", filepath),
                    Some(json!({ "file": filepath, "status": "success", "durationMs": duration_ms })),
                );
                Ok(FileResult {
                    filepath,
                    status: ExecutionStatus::Success,
                    skip_reason: None,
                    error: None,
                    duration_ms,
                })
            }
            Err(err) => {
                let message = err.to_string();
                warn!("File {} failed: {}", filepath, message);
                ExecutionRecord::record(
                    self.driver,
                    None,
                    &filepath,
                    FileType::Sql,
                    &checksum,
                    ExecutionStatus::Failed,
                    None,
                    Some(&message),
                    duration_ms,
                )?;
                self.bus.error(
                    "run:file",
                    format!("failed {}", filepath),
                    Some(json!({ "file": filepath, "status": "failed", "error": message })),
                );
                Ok(FileResult {
                    filepath,
                    status: ExecutionStatus::Failed,
                    skip_reason: None,
                    error: Some(message),
                    duration_ms,
                })
            }
        }
    }

    fn run_batch(&mut self, files: Vec<PathBuf>, opts: BuildOptions) -> Result<BatchOutcome> {
        let total = files.len();
        self.bus.info(
            "run:start",
            format!("running {} files", total),
            Some(json!({ "files": total })),
        );

        let mut results = Vec::new();
        for file in files {
            let result = self.run_file(&file, opts)?;
            let failed = result.status == ExecutionStatus::Failed;
            results.push(result);
            if failed && opts.abort_on_error {
                break;
            }
        }

        let outcome = BatchOutcome::from_files(results);
        let (executed, skipped, failed) = outcome.counts();
        info!(
            "Batch {}: {} executed, {} skipped, {} failed",
            outcome.status.as_str(),
            executed,
            skipped,
            failed
        );
        self.bus.info(
            "run:complete",
            format!("batch {}", outcome.status.as_str()),
            Some(json!({
                "status": outcome.status.as_str(),
                "executed": executed,
                "skipped": skipped,
                "failed": failed,
            })),
        );
        Ok(outcome)
    }

    /// Execute every SQL file under `dir` in path order
    pub fn run_dir(&mut self, dir: &Path, opts: BuildOptions) -> Result<BatchOutcome> {
        if !dir.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such directory: {}", dir.display()),
            )));
        }
        let files = collect_sql_files(dir)?;
        self.run_batch(files, opts)
    }

    /// The builder entry point: `run_dir` over the schema tree, filtered
    /// through the effective include/exclude lists.
    pub fn run_build(
        &mut self,
        sql_dir: &Path,
        paths: &BuildPaths,
        opts: BuildOptions,
    ) -> Result<BatchOutcome> {
        if !sql_dir.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such directory: {}", sql_dir.display()),
            )));
        }

        let files: Vec<PathBuf> = collect_sql_files(sql_dir)?
            .into_iter()
            .filter(|file| {
                let rel = file.strip_prefix(sql_dir).unwrap_or(file);
                let allowed = paths.allows(rel);
                if !allowed {
                    debug!("Excluded by build paths: {}", rel.display());
                }
                allowed
            })
            .collect();
        self.run_batch(files, opts)
    }
}
