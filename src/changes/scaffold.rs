// src/changes/scaffold.rs

//! Scaffold API for change directories
//!
//! The only sanctioned way to mutate a change on disk. Callers must first
//! check that no successful apply is recorded for the change; the engine
//! exposes that check and the CLI enforces it.

use crate::changes::{discover, Change, Side};
use crate::error::{Error, Result};
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

fn validate_slug(slug: &str) -> Result<()> {
    let ok = !slug.is_empty()
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !ok {
        return Err(Error::ChangeValidation {
            name: slug.to_string(),
            reason: "slug must be lowercase letters, digits, '-' or '_'".to_string(),
        });
    }
    Ok(())
}

/// Create a new change directory with empty `change/` and `revert/` sides
/// and a changelog stub. The name is `YYYY-MM-DD-<slug>`.
pub fn create(changes_dir: &Path, slug: &str, date: NaiveDate) -> Result<Change> {
    validate_slug(slug)?;
    let name = format!("{}-{}", date.format("%Y-%m-%d"), slug);
    let path = changes_dir.join(&name);
    if path.exists() {
        return Err(Error::ChangeValidation {
            name,
            reason: "change already exists".to_string(),
        });
    }

    fs::create_dir_all(path.join("change"))?;
    fs::create_dir_all(path.join("revert"))?;
    fs::write(
        path.join("changelog.md"),
        format!("# {}\n\nDescribe this change here.\n", slug),
    )?;

    info!("Created change {}", name);
    discover::read_change(&path)
}

/// Add a file to one side, assigning the next sequence number.
///
/// `template` switches the extension to `.sql.tmpl`; a `.txt` manifest is
/// requested with `manifest`.
pub fn add_file(
    change: &Change,
    side: Side,
    slug: &str,
    template: bool,
    manifest: bool,
) -> Result<PathBuf> {
    validate_slug(slug)?;
    let existing = change.files_for(side);
    let next = existing
        .iter()
        .filter_map(|f| f.sequence)
        .max()
        .unwrap_or(0)
        + 1;
    if next > 999 {
        return Err(Error::ChangeValidation {
            name: change.name.clone(),
            reason: "sequence numbers are exhausted (max 999)".to_string(),
        });
    }

    let ext = if manifest {
        "txt"
    } else if template {
        "sql.tmpl"
    } else {
        "sql"
    };
    let filename = format!("{:03}_{}.{}", next, slug, ext);
    let path = change.path.join(side.dir_name()).join(&filename);
    fs::write(&path, "")?;

    info!("Added {} to {}/{}", filename, change.name, side.dir_name());
    Ok(path)
}

/// Rename a change's slug, keeping its date prefix
pub fn rename(change: &Change, new_slug: &str) -> Result<String> {
    validate_slug(new_slug)?;
    let new_name = match change.date {
        Some(date) => format!("{}-{}", date.format("%Y-%m-%d"), new_slug),
        None => new_slug.to_string(),
    };
    let new_path = change
        .path
        .parent()
        .map(|p| p.join(&new_name))
        .ok_or_else(|| Error::ChangeValidation {
            name: change.name.clone(),
            reason: "change has no parent directory".to_string(),
        })?;
    if new_path.exists() {
        return Err(Error::ChangeValidation {
            name: new_name,
            reason: "target name already exists".to_string(),
        });
    }

    fs::rename(&change.path, &new_path)?;
    info!("Renamed change {} -> {}", change.name, new_name);
    Ok(new_name)
}

/// Resequence one side to match `order`, renumbering files to a
/// contiguous `001..N`.
///
/// `order` lists every filename on that side exactly once. Renames go
/// through temporary names so swapping two files cannot collide.
pub fn reorder(change: &Change, side: Side, order: &[String]) -> Result<()> {
    let current = change.files_for(side);
    if order.len() != current.len() {
        return Err(Error::ChangeValidation {
            name: change.name.clone(),
            reason: format!(
                "reorder lists {} files but {} exist",
                order.len(),
                current.len()
            ),
        });
    }
    for filename in order {
        if !current.iter().any(|f| &f.filename == filename) {
            return Err(Error::ChangeValidation {
                name: change.name.clone(),
                reason: format!("unknown file in reorder: {}", filename),
            });
        }
    }

    let side_dir = change.path.join(side.dir_name());

    // Phase 1: move everything aside
    for (i, filename) in order.iter().enumerate() {
        fs::rename(
            side_dir.join(filename),
            side_dir.join(format!(".reorder-{}", i)),
        )?;
    }
    // Phase 2: assign final names
    for (i, filename) in order.iter().enumerate() {
        let suffix = filename
            .split_once('_')
            .map(|(_, rest)| rest)
            .unwrap_or(filename);
        let final_name = format!("{:03}_{}", i + 1, suffix);
        fs::rename(
            side_dir.join(format!(".reorder-{}", i)),
            side_dir.join(final_name),
        )?;
    }

    info!("Reordered {}/{}", change.name, side.dir_name());
    Ok(())
}

/// Delete a change directory outright
pub fn delete(change: &Change) -> Result<()> {
    fs::remove_dir_all(&change.path)?;
    info!("Deleted change {}", change.name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
    }

    #[test]
    fn test_create_scaffolds_structure() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let change = create(&root, "add-email", date()).unwrap();

        assert_eq!(change.name, "2025-01-15-add-email");
        assert!(change.path.join("change").is_dir());
        assert!(change.path.join("revert").is_dir());
        assert!(change.has_changelog);
    }

    #[test]
    fn test_create_rejects_duplicates_and_bad_slugs() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        create(&root, "add-email", date()).unwrap();

        assert!(create(&root, "add-email", date()).is_err());
        assert!(create(&root, "Bad Slug!", date()).is_err());
    }

    #[test]
    fn test_add_file_sequences_contiguously() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let change = create(&root, "add-email", date()).unwrap();

        add_file(&change, Side::Change, "add-col", false, false).unwrap();
        let change = discover::read_change(&change.path).unwrap();
        add_file(&change, Side::Change, "backfill", true, false).unwrap();
        let change = discover::read_change(&change.path).unwrap();
        add_file(&change, Side::Change, "replay", false, true).unwrap();

        let change = discover::read_change(&change.path).unwrap();
        let names: Vec<&str> = change
            .files_for(Side::Change)
            .iter()
            .map(|f| f.filename.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["001_add-col.sql", "002_backfill.sql.tmpl", "003_replay.txt"]
        );
    }

    #[test]
    fn test_sides_sequence_independently() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let change = create(&root, "add-email", date()).unwrap();

        add_file(&change, Side::Change, "fwd", false, false).unwrap();
        let change = discover::read_change(&change.path).unwrap();
        add_file(&change, Side::Revert, "undo", false, false).unwrap();

        let change = discover::read_change(&change.path).unwrap();
        assert_eq!(change.revert_files[0].filename, "001_undo.sql");
    }

    #[test]
    fn test_rename_keeps_date() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let change = create(&root, "add-email", date()).unwrap();

        let new_name = rename(&change, "add-contact").unwrap();
        assert_eq!(new_name, "2025-01-15-add-contact");
        assert!(root.join(&new_name).is_dir());
        assert!(!root.join("2025-01-15-add-email").exists());
    }

    #[test]
    fn test_reorder_renumbers() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let change = create(&root, "multi", date()).unwrap();
        for slug in ["first", "second", "third"] {
            let change = discover::read_change(&change.path).unwrap();
            add_file(&change, Side::Change, slug, false, false).unwrap();
        }

        let change = discover::read_change(&change.path).unwrap();
        reorder(
            &change,
            Side::Change,
            &[
                "003_third.sql".to_string(),
                "001_first.sql".to_string(),
                "002_second.sql".to_string(),
            ],
        )
        .unwrap();

        let change = discover::read_change(&change.path).unwrap();
        let names: Vec<&str> = change
            .files_for(Side::Change)
            .iter()
            .map(|f| f.filename.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["001_third.sql", "002_first.sql", "003_second.sql"]
        );
    }

    #[test]
    fn test_reorder_rejects_incomplete_order() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let change = create(&root, "multi", date()).unwrap();
        add_file(&change, Side::Change, "only", false, false).unwrap();

        let change = discover::read_change(&change.path).unwrap();
        assert!(reorder(&change, Side::Change, &[]).is_err());
        assert!(reorder(&change, Side::Change, &["ghost.sql".to_string()]).is_err());
    }

    #[test]
    fn test_delete_removes_directory() {
        let dir = tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let change = create(&root, "doomed", date()).unwrap();

        delete(&change).unwrap();
        assert!(!change.path.exists());
    }
}
