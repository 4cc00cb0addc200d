// src/db/explore.rs

//! Schema inspection and reset primitives
//!
//! Catalog queries and destructive statements are dialect data; the logic
//! consuming them never branches on the dialect tag at call sites. The
//! internal `__noorm_*` tables are filtered out of every listing and only
//! dropped when a teardown explicitly asks for them.

use crate::db::adapter::{Dialect, Driver};
use crate::error::Result;
use tracing::{debug, info};

const INTERNAL_PREFIX: &str = "__noorm_";

fn list_tables_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table'
             AND name NOT LIKE 'sqlite_%' ORDER BY name"
        }
        Dialect::Postgres => {
            "SELECT tablename AS name FROM pg_tables
             WHERE schemaname = 'public' ORDER BY tablename"
        }
        Dialect::Mysql => {
            "SELECT table_name AS name FROM information_schema.tables
             WHERE table_schema = DATABASE() AND table_type = 'BASE TABLE'
             ORDER BY table_name"
        }
        Dialect::Mssql => {
            "SELECT name FROM sys.tables ORDER BY name"
        }
    }
}

fn list_views_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => "SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name",
        Dialect::Postgres => {
            "SELECT viewname AS name FROM pg_views
             WHERE schemaname = 'public' ORDER BY viewname"
        }
        Dialect::Mysql => {
            "SELECT table_name AS name FROM information_schema.views
             WHERE table_schema = DATABASE() ORDER BY table_name"
        }
        Dialect::Mssql => "SELECT name FROM sys.views ORDER BY name",
    }
}

/// User tables, internal bookkeeping excluded
pub fn list_tables(driver: &mut dyn Driver, dialect: Dialect) -> Result<Vec<String>> {
    let rows = driver.query(list_tables_sql(dialect), &[])?;
    Ok(rows
        .iter()
        .filter_map(|r| r.text("name"))
        .filter(|name| !name.starts_with(INTERNAL_PREFIX))
        .collect())
}

/// User views
pub fn list_views(driver: &mut dyn Driver, dialect: Dialect) -> Result<Vec<String>> {
    let rows = driver.query(list_views_sql(dialect), &[])?;
    Ok(rows
        .iter()
        .filter_map(|r| r.text("name"))
        .filter(|name| !name.starts_with(INTERNAL_PREFIX))
        .collect())
}

/// Delete every row of one table
pub fn truncate_table(driver: &mut dyn Driver, dialect: Dialect, table: &str) -> Result<()> {
    let quoted = dialect.quote_ident(table);
    let sql = match dialect {
        // SQLite has no TRUNCATE statement
        Dialect::Sqlite => format!("DELETE FROM {}", quoted),
        _ => format!("TRUNCATE TABLE {}", quoted),
    };
    debug!("Truncating {}", table);
    driver.execute_batch(&sql)?;
    Ok(())
}

/// Drop one table
pub fn drop_table(driver: &mut dyn Driver, dialect: Dialect, table: &str) -> Result<()> {
    let quoted = dialect.quote_ident(table);
    debug!("Dropping table {}", table);
    driver.execute_batch(&format!("DROP TABLE IF EXISTS {}", quoted))?;
    Ok(())
}

/// Drop one view
pub fn drop_view(driver: &mut dyn Driver, dialect: Dialect, view: &str) -> Result<()> {
    let quoted = dialect.quote_ident(view);
    debug!("Dropping view {}", view);
    driver.execute_batch(&format!("DROP VIEW IF EXISTS {}", quoted))?;
    Ok(())
}

/// Outcome of a teardown pass
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub dropped_views: Vec<String>,
    pub dropped_tables: Vec<String>,
}

/// Drop all user views and tables. With `include_internal` the
/// `__noorm_*` tables go too, leaving a bare database.
///
/// Views drop before tables so dependent objects go first; remaining
/// ordering issues are the database's own dependency handling.
pub fn teardown(
    driver: &mut dyn Driver,
    dialect: Dialect,
    include_internal: bool,
) -> Result<TeardownReport> {
    let mut report = TeardownReport::default();

    for view in list_views(driver, dialect)? {
        drop_view(driver, dialect, &view)?;
        report.dropped_views.push(view);
    }
    for table in list_tables(driver, dialect)? {
        drop_table(driver, dialect, &table)?;
        report.dropped_tables.push(table);
    }

    if include_internal {
        let rows = driver.query(list_tables_sql(dialect), &[])?;
        for table in rows.iter().filter_map(|r| r.text("name")) {
            if table.starts_with(INTERNAL_PREFIX) {
                drop_table(driver, dialect, &table)?;
                report.dropped_tables.push(table);
            }
        }
    }

    info!(
        "Teardown dropped {} views, {} tables",
        report.dropped_views.len(),
        report.dropped_tables.len()
    );
    Ok(report)
}
