//! Migration file discovery.
//!
//! A migrations directory holds `NNN-<identifier>.sql` files and
//! `NNN-<identifier>` subdirectories, walked recursively in name order.
//! Entries that do not follow the convention are ignored.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use miette::Diagnostic;
use regex_lite::Regex;
use thiserror::Error;
use tracing::debug;

static FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9]{3})-[A-Za-z0-9_-]+\.sql$").expect("file pattern is valid")
});

static DIR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]{3})-[A-Za-z0-9_-]+$").expect("directory pattern is valid"));

/// Errors raised while walking a migrations directory.
///
/// All of them are fatal and happen before any file is parsed.
#[derive(Debug, Error, Diagnostic)]
pub enum DiscoveryError {
    /// The root is missing or not a directory.
    #[error("Migrations directory not found: {}", .0.display())]
    #[diagnostic(code(fsql::discovery::not_a_directory))]
    NotADirectory(PathBuf),

    /// Two files in one directory share an ordinal.
    #[error("Duplicate number found in directory {}: {ordinal}", directory.display())]
    #[diagnostic(
        code(fsql::discovery::duplicate_ordinal),
        help("renumber one of the files so each ordinal appears once per directory")
    )]
    DuplicateOrdinal { directory: PathBuf, ordinal: String },

    /// A file and a directory in one location share an ordinal.
    #[error(
        "Conflict in {}: migration step {ordinal} exists as both file and directory",
        directory.display()
    )]
    #[diagnostic(code(fsql::discovery::ordinal_conflict))]
    OrdinalConflict { directory: PathBuf, ordinal: String },

    /// A directory could not be listed.
    #[error("Failed to read directory {}: {source}", path.display())]
    #[diagnostic(code(fsql::discovery::io))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Ordinal prefix of a valid migration file name.
pub fn file_ordinal(name: &str) -> Option<&str> {
    FILE_PATTERN
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Ordinal prefix of a valid migration directory name.
pub fn dir_ordinal(name: &str) -> Option<&str> {
    DIR_PATTERN
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// Collect migration files under `root`, depth first in name order.
pub fn discover_sql_files(root: &Path) -> Result<Vec<PathBuf>, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::NotADirectory(root.to_path_buf()));
    }

    let mut files = Vec::new();
    walk(root, &mut files)?;
    debug!(root = %root.display(), files = files.len(), "discovered migration files");
    Ok(files)
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), DiscoveryError> {
    let io_err = |source: std::io::Error| DiscoveryError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let file_type = entry.file_type().map_err(io_err)?;
        entries.push((entry.file_name().to_string_lossy().into_owned(), file_type));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut file_ordinals = BTreeSet::new();
    let mut dir_ordinals = BTreeSet::new();

    for (name, _) in entries.iter().filter(|(_, t)| t.is_file()) {
        let Some(ordinal) = file_ordinal(name) else {
            debug!(file = %dir.join(name).display(), "skipping non-migration file");
            continue;
        };
        if !file_ordinals.insert(ordinal.to_string()) {
            return Err(DiscoveryError::DuplicateOrdinal {
                directory: dir.to_path_buf(),
                ordinal: ordinal.to_string(),
            });
        }
    }
    for (name, _) in entries.iter().filter(|(_, t)| t.is_dir()) {
        if let Some(ordinal) = dir_ordinal(name) {
            dir_ordinals.insert(ordinal.to_string());
        }
    }
    if let Some(ordinal) = file_ordinals.intersection(&dir_ordinals).next() {
        return Err(DiscoveryError::OrdinalConflict {
            directory: dir.to_path_buf(),
            ordinal: ordinal.clone(),
        });
    }

    for (name, file_type) in &entries {
        let path = dir.join(name);
        if file_type.is_dir() && dir_ordinal(name).is_some() {
            walk(&path, files)?;
        } else if file_type.is_file() && file_ordinal(name).is_some() {
            files.push(path);
        }
    }
    Ok(())
}
