// src/changes/discover.rs

//! Change discovery and manifest resolution
//!
//! Reads the `changes/` tree into `Change` values and resolves `.txt`
//! manifests into the schema files they reference. Discovery is tolerant
//! of stray files; structural problems surface later, when a specific
//! change is validated for execution.

use crate::changes::{Change, ChangeFile, ChangeFileKind};
use crate::error::{Error, Result};
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Split a change directory name into its optional date prefix and the
/// slug after it: `2025-01-15-add-email` -> (2025-01-15, "add-email").
pub fn parse_change_name(name: &str) -> (Option<NaiveDate>, String) {
    if name.len() > 11 && name.is_char_boundary(10) {
        let (prefix, rest) = name.split_at(10);
        if let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d") {
            if let Some(slug) = rest.strip_prefix('-') {
                return (Some(date), slug.to_string());
            }
        }
    }
    (None, name.to_string())
}

/// Parse the `NNN` sequence prefix from a change filename
pub fn parse_sequence(filename: &str) -> Option<u32> {
    let digits: String = filename.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() || !filename[digits.len()..].starts_with('_') {
        return None;
    }
    digits.parse().ok()
}

fn classify_file(filename: &str) -> Option<ChangeFileKind> {
    if filename.ends_with(".sql") || filename.ends_with(".sql.tmpl") {
        Some(ChangeFileKind::Sql)
    } else if filename.ends_with(".txt") {
        Some(ChangeFileKind::Manifest)
    } else {
        None
    }
}

fn read_side(dir: &Path) -> Result<Vec<ChangeFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();
        let Some(kind) = classify_file(&filename) else {
            continue;
        };
        files.push(ChangeFile {
            sequence: parse_sequence(&filename),
            path: entry.path(),
            kind,
            filename,
        });
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

/// Read one change directory
pub fn read_change(path: &Path) -> Result<Change> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::ChangeValidation {
            name: path.display().to_string(),
            reason: "not a directory".to_string(),
        })?;
    let (date, description) = parse_change_name(&name);

    Ok(Change {
        change_files: read_side(&path.join("change"))?,
        revert_files: read_side(&path.join("revert"))?,
        has_changelog: path.join("changelog.md").exists(),
        path: path.to_path_buf(),
        name,
        date,
        description,
    })
}

/// Discover every change under `changes_dir`, sorted into canonical apply
/// order: dated changes first by `(date, name)`, then undated ones by
/// name.
pub fn discover_changes(changes_dir: &Path) -> Result<Vec<Change>> {
    if !changes_dir.exists() {
        debug!("No changes directory at {}", changes_dir.display());
        return Ok(Vec::new());
    }

    let mut changes = Vec::new();
    for entry in fs::read_dir(changes_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        changes.push(read_change(&entry.path())?);
    }

    changes.sort_by(|a, b| {
        (a.date.unwrap_or(NaiveDate::MAX), a.name.as_str())
            .cmp(&(b.date.unwrap_or(NaiveDate::MAX), b.name.as_str()))
    });
    debug!("Discovered {} changes", changes.len());
    Ok(changes)
}

/// Find one change by name
pub fn find_change(changes_dir: &Path, name: &str) -> Result<Change> {
    let path = changes_dir.join(name);
    if !path.is_dir() {
        return Err(Error::ChangeNotFound(name.to_string()));
    }
    read_change(&path)
}

/// Resolve a manifest into the schema files it references.
///
/// Lines are paths relative to the schema directory; blank lines and `#`
/// comments are ignored. Every target must exist before any SQL runs.
pub fn resolve_manifest(manifest: &ChangeFile, sql_dir: &Path) -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string(&manifest.path)?;

    let mut resolved = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let target = sql_dir.join(line);
        if !target.is_file() {
            return Err(Error::ManifestReference {
                manifest: manifest.filename.clone(),
                target: line.to_string(),
            });
        }
        resolved.push(target);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changes::Side;
    use tempfile::tempdir;

    fn write_change(root: &Path, name: &str, change: &[&str], revert: &[&str]) {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("change")).unwrap();
        fs::create_dir_all(dir.join("revert")).unwrap();
        for file in change {
            fs::write(dir.join("change").join(file), "SELECT 1;").unwrap();
        }
        for file in revert {
            fs::write(dir.join("revert").join(file), "SELECT 1;").unwrap();
        }
    }

    #[test]
    fn test_parse_change_name() {
        let (date, slug) = parse_change_name("2025-01-15-add-email");
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 1, 15));
        assert_eq!(slug, "add-email");

        let (date, slug) = parse_change_name("hotfix-users");
        assert_eq!(date, None);
        assert_eq!(slug, "hotfix-users");

        // A date-like prefix that fails to parse stays part of the slug
        let (date, slug) = parse_change_name("2025-13-99-bogus");
        assert_eq!(date, None);
        assert_eq!(slug, "2025-13-99-bogus");
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("001_add_col.sql"), Some(1));
        assert_eq!(parse_sequence("042_rename.sql.tmpl"), Some(42));
        assert_eq!(parse_sequence("no_prefix.sql"), None);
        assert_eq!(parse_sequence("12noseparator.sql"), None);
    }

    #[test]
    fn test_discovery_order_dated_then_undated() {
        let dir = tempdir().unwrap();
        write_change(dir.path(), "zz-undated", &["001_a.sql"], &[]);
        write_change(dir.path(), "2025-02-01-second", &["001_a.sql"], &[]);
        write_change(dir.path(), "2025-01-15-first", &["001_a.sql"], &[]);
        write_change(dir.path(), "aa-undated", &["001_a.sql"], &[]);

        let changes = discover_changes(dir.path()).unwrap();
        let names: Vec<&str> = changes.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "2025-01-15-first",
                "2025-02-01-second",
                "aa-undated",
                "zz-undated"
            ]
        );
    }

    #[test]
    fn test_side_ordering() {
        let dir = tempdir().unwrap();
        write_change(
            dir.path(),
            "2025-01-15-multi",
            &["002_b.sql", "001_a.sql", "003_c.sql"],
            &["001_x.sql", "002_y.sql"],
        );

        let change = find_change(dir.path(), "2025-01-15-multi").unwrap();
        let forward: Vec<&str> = change
            .files_for(Side::Change)
            .iter()
            .map(|f| f.filename.as_str())
            .collect();
        assert_eq!(forward, vec!["001_a.sql", "002_b.sql", "003_c.sql"]);

        let reverse: Vec<&str> = change
            .files_for(Side::Revert)
            .iter()
            .map(|f| f.filename.as_str())
            .collect();
        assert_eq!(reverse, vec!["002_y.sql", "001_x.sql"]);
    }

    #[test]
    fn test_non_sql_files_ignored() {
        let dir = tempdir().unwrap();
        write_change(dir.path(), "2025-01-15-x", &["001_a.sql"], &[]);
        fs::write(
            dir.path().join("2025-01-15-x/change/notes.md"),
            "# not sql",
        )
        .unwrap();

        let change = find_change(dir.path(), "2025-01-15-x").unwrap();
        assert_eq!(change.change_files.len(), 1);
    }

    #[test]
    fn test_find_change_missing() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            find_change(dir.path(), "ghost"),
            Err(Error::ChangeNotFound(_))
        ));
    }

    #[test]
    fn test_manifest_resolution() {
        let dir = tempdir().unwrap();
        let sql_dir = dir.path().join("sql");
        fs::create_dir_all(sql_dir.join("views")).unwrap();
        fs::write(sql_dir.join("views/a.sql"), "CREATE VIEW a AS SELECT 1;").unwrap();
        fs::write(sql_dir.join("views/b.sql"), "CREATE VIEW b AS SELECT 2;").unwrap();

        let manifest_path = dir.path().join("001_replay.txt");
        fs::write(&manifest_path, "# comment\nviews/a.sql\n\nviews/b.sql\n").unwrap();
        let manifest = ChangeFile {
            filename: "001_replay.txt".to_string(),
            path: manifest_path,
            kind: ChangeFileKind::Manifest,
            sequence: Some(1),
        };

        let resolved = resolve_manifest(&manifest, &sql_dir).unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved[0].ends_with("views/a.sql"));
    }

    #[test]
    fn test_manifest_missing_target() {
        let dir = tempdir().unwrap();
        let sql_dir = dir.path().join("sql");
        fs::create_dir_all(&sql_dir).unwrap();

        let manifest_path = dir.path().join("001_replay.txt");
        fs::write(&manifest_path, "views/missing.sql\n").unwrap();
        let manifest = ChangeFile {
            filename: "001_replay.txt".to_string(),
            path: manifest_path,
            kind: ChangeFileKind::Manifest,
            sequence: Some(1),
        };

        let err = resolve_manifest(&manifest, &sql_dir).unwrap_err();
        match err {
            Error::ManifestReference { target, .. } => assert_eq!(target, "views/missing.sql"),
            other => panic!("expected ManifestReference, got {:?}", other),
        }
    }
}
