// src/db/records.rs

//! Row types and CRUD for the tracking tables
//!
//! These structs mirror `__noorm_change__` and `__noorm_executions__` and
//! carry the derived-status logic: a change's user-visible status is never
//! stored, it is derived from its operation history.

use crate::db::adapter::{Driver, Row, Value};
use crate::error::Result;

/// Operation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Apply,
    Revert,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Apply => "apply",
            Direction::Revert => "revert",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "revert" => Direction::Revert,
            _ => Direction::Apply,
        }
    }
}

/// Stored status of one operation row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Running,
    Success,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Running => "running",
            OperationStatus::Success => "success",
            OperationStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "running" => OperationStatus::Running,
            "success" => OperationStatus::Success,
            _ => OperationStatus::Failed,
        }
    }
}

/// Stored status of one file execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Skipped => "skipped",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "success" => ExecutionStatus::Success,
            "skipped" => ExecutionStatus::Skipped,
            _ => ExecutionStatus::Failed,
        }
    }
}

/// Kind of file recorded in an execution row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Sql,
    Manifest,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Sql => "sql",
            FileType::Manifest => "manifest",
        }
    }
}

/// Derived, user-visible status of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    Pending,
    Success,
    Failed,
    Reverted,
}

impl ChangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeState::Pending => "pending",
            ChangeState::Success => "success",
            ChangeState::Failed => "failed",
            ChangeState::Reverted => "reverted",
        }
    }

    /// Whether the change counts as not-applied for planning purposes
    pub fn is_pending(&self) -> bool {
        matches!(self, ChangeState::Pending | ChangeState::Reverted)
    }
}

/// One row in `__noorm_change__`
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub id: i64,
    pub name: String,
    pub direction: Direction,
    pub status: OperationStatus,
    pub executed_at: String,
    pub executed_by: String,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub checksum: Option<String>,
}

const CHANGE_COLUMNS: &str =
    "id, name, direction, status, executed_at, executed_by, duration_ms, error_message, checksum";

impl ChangeRecord {
    fn from_row(row: &Row) -> Self {
        Self {
            id: row.i64("id").unwrap_or_default(),
            name: row.text("name").unwrap_or_default(),
            direction: Direction::parse(row.text("direction").unwrap_or_default().as_str()),
            status: OperationStatus::parse(row.text("status").unwrap_or_default().as_str()),
            executed_at: row.text("executed_at").unwrap_or_default(),
            executed_by: row.text("executed_by").unwrap_or_default(),
            duration_ms: row.i64("duration_ms"),
            error_message: row.text("error_message"),
            checksum: row.text("checksum"),
        }
    }

    /// Open an operation row in `running` state, returning its id
    pub fn start(
        driver: &mut dyn Driver,
        name: &str,
        direction: Direction,
        executed_by: &str,
    ) -> Result<i64> {
        driver.execute(
            "INSERT INTO __noorm_change__ (name, direction, status, executed_by)
             VALUES (?1, ?2, 'running', ?3)",
            &[
                Value::from(name),
                Value::from(direction.as_str()),
                Value::from(executed_by),
            ],
        )?;
        let rows = driver.query("SELECT last_insert_rowid() AS id", &[])?;
        Ok(rows.first().and_then(|r| r.i64("id")).unwrap_or_default())
    }

    /// Close an operation row with its final status
    pub fn complete(
        driver: &mut dyn Driver,
        id: i64,
        status: OperationStatus,
        duration_ms: i64,
        error_message: Option<&str>,
        checksum: Option<&str>,
    ) -> Result<()> {
        driver.execute(
            "UPDATE __noorm_change__
             SET status = ?1, duration_ms = ?2, error_message = ?3, checksum = ?4
             WHERE id = ?5",
            &[
                Value::from(status.as_str()),
                Value::from(duration_ms),
                Value::from(error_message.map(str::to_string)),
                Value::from(checksum.map(str::to_string)),
                Value::from(id),
            ],
        )?;
        Ok(())
    }

    /// All operation rows for one change, oldest first
    pub fn for_change(driver: &mut dyn Driver, name: &str) -> Result<Vec<Self>> {
        let rows = driver.query(
            &format!(
                "SELECT {} FROM __noorm_change__ WHERE name = ?1 ORDER BY id",
                CHANGE_COLUMNS
            ),
            &[Value::from(name)],
        )?;
        Ok(rows.iter().map(Self::from_row).collect())
    }

    /// Latest operation row for one change
    pub fn latest_for(driver: &mut dyn Driver, name: &str) -> Result<Option<Self>> {
        let rows = driver.query(
            &format!(
                "SELECT {} FROM __noorm_change__ WHERE name = ?1 ORDER BY id DESC LIMIT 1",
                CHANGE_COLUMNS
            ),
            &[Value::from(name)],
        )?;
        Ok(rows.first().map(Self::from_row))
    }

    /// Operation history, newest first
    pub fn history(driver: &mut dyn Driver, limit: Option<usize>) -> Result<Vec<Self>> {
        let sql = match limit {
            Some(n) => format!(
                "SELECT {} FROM __noorm_change__ ORDER BY id DESC LIMIT {}",
                CHANGE_COLUMNS, n
            ),
            None => format!("SELECT {} FROM __noorm_change__ ORDER BY id DESC", CHANGE_COLUMNS),
        };
        let rows = driver.query(&sql, &[])?;
        Ok(rows.iter().map(Self::from_row).collect())
    }

    /// Every change name that has at least one operation row
    pub fn recorded_names(driver: &mut dyn Driver) -> Result<Vec<String>> {
        let rows = driver.query(
            "SELECT DISTINCT name FROM __noorm_change__ ORDER BY name",
            &[],
        )?;
        Ok(rows.iter().filter_map(|r| r.text("name")).collect())
    }

    /// Names of currently-applied changes in application order (the id of
    /// their last successful apply), used by rewind planning.
    pub fn applied_in_order(driver: &mut dyn Driver) -> Result<Vec<String>> {
        let names = Self::recorded_names(driver)?;
        let mut applied: Vec<(i64, String)> = Vec::new();
        for name in names {
            let records = Self::for_change(driver, &name)?;
            if derive_state(&records) == ChangeState::Success {
                let last_apply_id = records
                    .iter()
                    .rev()
                    .find(|r| {
                        r.direction == Direction::Apply && r.status == OperationStatus::Success
                    })
                    .map(|r| r.id)
                    .unwrap_or_default();
                applied.push((last_apply_id, name));
            }
        }
        applied.sort();
        Ok(applied.into_iter().map(|(_, name)| name).collect())
    }

    /// Drop all history rows for one change (the orphan-forget path)
    pub fn delete_for_change(driver: &mut dyn Driver, name: &str) -> Result<usize> {
        driver.execute(
            "DELETE FROM __noorm_executions__ WHERE change_id IN
               (SELECT id FROM __noorm_change__ WHERE name = ?1)",
            &[Value::from(name)],
        )?;
        let deleted = driver.execute(
            "DELETE FROM __noorm_change__ WHERE name = ?1",
            &[Value::from(name)],
        )?;
        Ok(deleted)
    }
}

/// Derive the user-visible status from a change's operation history.
///
/// The most recent row wins: a successful apply means `success`, a
/// successful revert means `reverted`, any failure (including a `running`
/// row abandoned by a crash) means `failed`, and no rows means `pending`.
pub fn derive_state(records: &[ChangeRecord]) -> ChangeState {
    let Some(last) = records.last() else {
        return ChangeState::Pending;
    };
    match (last.direction, last.status) {
        (Direction::Apply, OperationStatus::Success) => ChangeState::Success,
        (Direction::Revert, OperationStatus::Success) => ChangeState::Reverted,
        (_, OperationStatus::Failed) | (_, OperationStatus::Running) => ChangeState::Failed,
    }
}

/// One row in `__noorm_executions__`
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: i64,
    pub change_id: Option<i64>,
    pub filepath: String,
    pub file_type: String,
    pub checksum: String,
    pub status: ExecutionStatus,
    pub skip_reason: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: Option<i64>,
    pub executed_at: String,
}

const EXECUTION_COLUMNS: &str = "id, change_id, filepath, file_type, checksum, status, skip_reason, error_message, duration_ms, executed_at";

impl ExecutionRecord {
    fn from_row(row: &Row) -> Self {
        Self {
            id: row.i64("id").unwrap_or_default(),
            change_id: row.i64("change_id"),
            filepath: row.text("filepath").unwrap_or_default(),
            file_type: row.text("file_type").unwrap_or_default(),
            checksum: row.text("checksum").unwrap_or_default(),
            status: ExecutionStatus::parse(row.text("status").unwrap_or_default().as_str()),
            skip_reason: row.text("skip_reason"),
            error_message: row.text("error_message"),
            duration_ms: row.i64("duration_ms"),
            executed_at: row.text("executed_at").unwrap_or_default(),
        }
    }

    /// Record one file outcome
    #[allow(clippy::too_many_arguments)]
    pub fn record(
        driver: &mut dyn Driver,
        change_id: Option<i64>,
        filepath: &str,
        file_type: FileType,
        checksum: &str,
        status: ExecutionStatus,
        skip_reason: Option<&str>,
        error_message: Option<&str>,
        duration_ms: i64,
    ) -> Result<()> {
        driver.execute(
            "INSERT INTO __noorm_executions__
               (change_id, filepath, file_type, checksum, status, skip_reason, error_message, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            &[
                change_id.map(Value::Integer).unwrap_or(Value::Null),
                Value::from(filepath),
                Value::from(file_type.as_str()),
                Value::from(checksum),
                Value::from(status.as_str()),
                Value::from(skip_reason.map(str::to_string)),
                Value::from(error_message.map(str::to_string)),
                Value::from(duration_ms),
            ],
        )?;
        Ok(())
    }

    /// Checksum of the most recent successful execution of a file.
    ///
    /// Builder rows (`change_id = NULL`) and change-scoped rows are
    /// separate namespaces; a change name is matched across all of its
    /// operation rows so re-runs see earlier attempts.
    pub fn last_success_checksum(
        driver: &mut dyn Driver,
        change_name: Option<&str>,
        filepath: &str,
    ) -> Result<Option<String>> {
        let rows = match change_name {
            None => driver.query(
                "SELECT checksum FROM __noorm_executions__
                 WHERE change_id IS NULL AND filepath = ?1 AND status IN ('success', 'skipped')
                 ORDER BY id DESC LIMIT 1",
                &[Value::from(filepath)],
            )?,
            Some(name) => driver.query(
                "SELECT e.checksum AS checksum FROM __noorm_executions__ e
                 JOIN __noorm_change__ c ON c.id = e.change_id
                 WHERE c.name = ?1 AND e.filepath = ?2 AND e.status IN ('success', 'skipped')
                 ORDER BY e.id DESC LIMIT 1",
                &[Value::from(name), Value::from(filepath)],
            )?,
        };
        Ok(rows.first().and_then(|r| r.text("checksum")))
    }

    /// All execution rows belonging to one operation
    pub fn for_operation(driver: &mut dyn Driver, change_id: i64) -> Result<Vec<Self>> {
        let rows = driver.query(
            &format!(
                "SELECT {} FROM __noorm_executions__ WHERE change_id = ?1 ORDER BY id",
                EXECUTION_COLUMNS
            ),
            &[Value::from(change_id)],
        )?;
        Ok(rows.iter().map(Self::from_row).collect())
    }

    /// All builder rows (no enclosing change)
    pub fn builder_rows(driver: &mut dyn Driver) -> Result<Vec<Self>> {
        let rows = driver.query(
            &format!(
                "SELECT {} FROM __noorm_executions__ WHERE change_id IS NULL ORDER BY id",
                EXECUTION_COLUMNS
            ),
            &[],
        )?;
        Ok(rows.iter().map(Self::from_row).collect())
    }
}

/// Upsert one collaborator into `__noorm_identities__`
pub fn upsert_identity(
    driver: &mut dyn Driver,
    identity_hash: &str,
    name: &str,
    email: &str,
    machine: &str,
) -> Result<()> {
    driver.execute(
        "INSERT INTO __noorm_identities__ (identity_hash, name, email, machine)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(identity_hash) DO UPDATE SET
           name = excluded.name,
           email = excluded.email,
           machine = excluded.machine,
           last_seen = CURRENT_TIMESTAMP",
        &[
            Value::from(identity_hash),
            Value::from(name),
            Value::from(email),
            Value::from(machine),
        ],
    )?;
    Ok(())
}

/// The full collaborator roster as (hash, name, email, machine) tuples
pub fn list_identities(driver: &mut dyn Driver) -> Result<Vec<(String, String, String, String)>> {
    let rows = driver.query(
        "SELECT identity_hash, name, email, machine FROM __noorm_identities__ ORDER BY name",
        &[],
    )?;
    Ok(rows
        .iter()
        .map(|r| {
            (
                r.text("identity_hash").unwrap_or_default(),
                r.text("name").unwrap_or_default(),
                r.text("email").unwrap_or_default(),
                r.text("machine").unwrap_or_default(),
            )
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::adapter::SqliteDriver;
    use crate::db::schema;

    fn test_driver() -> Box<dyn Driver> {
        let mut driver: Box<dyn Driver> = Box::new(SqliteDriver::open_in_memory().unwrap());
        schema::migrate(driver.as_mut(), "tester").unwrap();
        driver
    }

    #[test]
    fn test_change_record_lifecycle() {
        let mut driver = test_driver();
        let id = ChangeRecord::start(
            driver.as_mut(),
            "2025-01-15-add-email",
            Direction::Apply,
            "Alice <alice@example.com>",
        )
        .unwrap();

        ChangeRecord::complete(
            driver.as_mut(),
            id,
            OperationStatus::Success,
            42,
            None,
            Some("abc123"),
        )
        .unwrap();

        let records = ChangeRecord::for_change(driver.as_mut(), "2025-01-15-add-email").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, OperationStatus::Success);
        assert_eq!(records[0].checksum.as_deref(), Some("abc123"));
        assert_eq!(records[0].duration_ms, Some(42));
    }

    #[test]
    fn test_derive_state_transitions() {
        let mut driver = test_driver();
        let name = "2025-01-15-add-email";

        let records = ChangeRecord::for_change(driver.as_mut(), name).unwrap();
        assert_eq!(derive_state(&records), ChangeState::Pending);

        let id = ChangeRecord::start(driver.as_mut(), name, Direction::Apply, "a").unwrap();
        ChangeRecord::complete(driver.as_mut(), id, OperationStatus::Success, 1, None, None)
            .unwrap();
        let records = ChangeRecord::for_change(driver.as_mut(), name).unwrap();
        assert_eq!(derive_state(&records), ChangeState::Success);

        let id = ChangeRecord::start(driver.as_mut(), name, Direction::Revert, "a").unwrap();
        ChangeRecord::complete(driver.as_mut(), id, OperationStatus::Success, 1, None, None)
            .unwrap();
        let records = ChangeRecord::for_change(driver.as_mut(), name).unwrap();
        assert_eq!(derive_state(&records), ChangeState::Reverted);
        assert!(derive_state(&records).is_pending());

        let id = ChangeRecord::start(driver.as_mut(), name, Direction::Apply, "a").unwrap();
        ChangeRecord::complete(
            driver.as_mut(),
            id,
            OperationStatus::Failed,
            1,
            Some("syntax error"),
            None,
        )
        .unwrap();
        let records = ChangeRecord::for_change(driver.as_mut(), name).unwrap();
        assert_eq!(derive_state(&records), ChangeState::Failed);
    }

    #[test]
    fn test_abandoned_running_row_reads_as_failed() {
        let mut driver = test_driver();
        ChangeRecord::start(driver.as_mut(), "c", Direction::Apply, "a").unwrap();
        let records = ChangeRecord::for_change(driver.as_mut(), "c").unwrap();
        assert_eq!(derive_state(&records), ChangeState::Failed);
    }

    #[test]
    fn test_applied_in_order_follows_apply_ids() {
        let mut driver = test_driver();
        for name in ["b-second", "a-first", "c-third"] {
            let id = ChangeRecord::start(driver.as_mut(), name, Direction::Apply, "a").unwrap();
            ChangeRecord::complete(driver.as_mut(), id, OperationStatus::Success, 1, None, None)
                .unwrap();
        }

        // Application order, not name order
        let applied = ChangeRecord::applied_in_order(driver.as_mut()).unwrap();
        assert_eq!(applied, vec!["b-second", "a-first", "c-third"]);
    }

    #[test]
    fn test_execution_checksum_lookup_scoped_by_context() {
        let mut driver = test_driver();
        let id = ChangeRecord::start(driver.as_mut(), "c", Direction::Apply, "a").unwrap();

        ExecutionRecord::record(
            driver.as_mut(),
            Some(id),
            "change/001_add.sql",
            FileType::Sql,
            "sum-change",
            ExecutionStatus::Success,
            None,
            None,
            5,
        )
        .unwrap();
        ExecutionRecord::record(
            driver.as_mut(),
            None,
            "tables/users.sql",
            FileType::Sql,
            "sum-builder",
            ExecutionStatus::Success,
            None,
            None,
            5,
        )
        .unwrap();

        assert_eq!(
            ExecutionRecord::last_success_checksum(driver.as_mut(), Some("c"), "change/001_add.sql")
                .unwrap()
                .as_deref(),
            Some("sum-change")
        );
        assert_eq!(
            ExecutionRecord::last_success_checksum(driver.as_mut(), None, "tables/users.sql")
                .unwrap()
                .as_deref(),
            Some("sum-builder")
        );
        assert_eq!(
            ExecutionRecord::last_success_checksum(driver.as_mut(), None, "change/001_add.sql")
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_failed_execution_does_not_update_checksum() {
        let mut driver = test_driver();
        ExecutionRecord::record(
            driver.as_mut(),
            None,
            "tables/users.sql",
            FileType::Sql,
            "good",
            ExecutionStatus::Success,
            None,
            None,
            5,
        )
        .unwrap();
        ExecutionRecord::record(
            driver.as_mut(),
            None,
            "tables/users.sql",
            FileType::Sql,
            "bad",
            ExecutionStatus::Failed,
            None,
            Some("boom"),
            5,
        )
        .unwrap();

        assert_eq!(
            ExecutionRecord::last_success_checksum(driver.as_mut(), None, "tables/users.sql")
                .unwrap()
                .as_deref(),
            Some("good")
        );
    }

    #[test]
    fn test_delete_for_change_removes_executions() {
        let mut driver = test_driver();
        let id = ChangeRecord::start(driver.as_mut(), "gone", Direction::Apply, "a").unwrap();
        ExecutionRecord::record(
            driver.as_mut(),
            Some(id),
            "change/001.sql",
            FileType::Sql,
            "sum",
            ExecutionStatus::Success,
            None,
            None,
            1,
        )
        .unwrap();

        ChangeRecord::delete_for_change(driver.as_mut(), "gone").unwrap();
        assert!(ChangeRecord::for_change(driver.as_mut(), "gone")
            .unwrap()
            .is_empty());
        assert!(ExecutionRecord::for_operation(driver.as_mut(), id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_identity_upsert_keeps_first_seen() {
        let mut driver = test_driver();
        upsert_identity(driver.as_mut(), "hash1", "Alice", "a@example.com", "m1").unwrap();
        upsert_identity(driver.as_mut(), "hash1", "Alice B", "a@example.com", "m2").unwrap();

        let roster = list_identities(driver.as_mut()).unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].1, "Alice B");
        assert_eq!(roster[0].3, "m2");
    }
}
