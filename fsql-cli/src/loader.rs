//! Concurrent SQL file loading.

use std::path::{Path, PathBuf};

use fsql_migrate::{SourceFile, normalize_path};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::{CliError, CliResult};

/// A file that could not be read.
#[derive(Debug)]
pub struct LoadFailure {
    /// The path as given.
    pub path: PathBuf,
    /// Why reading failed.
    pub error: std::io::Error,
}

/// Result of loading a batch of files.
#[derive(Debug, Default)]
pub struct LoadedSources {
    /// Readable files, in input order.
    pub sources: Vec<SourceFile>,
    /// Unreadable files, in input order.
    pub failures: Vec<LoadFailure>,
}

/// Path string used for a file's canonical IDs.
pub fn source_path(path: &Path) -> String {
    normalize_path(&path.to_string_lossy().replace('\\', "/"))
}

/// Read every file concurrently, keeping input order.
///
/// Unreadable files are logged and reported in `failures`; they do not stop
/// the rest of the batch.
pub async fn load_sources(paths: &[PathBuf]) -> LoadedSources {
    let reads = paths.iter().map(|path| async move {
        let result = tokio::fs::read_to_string(path).await;
        (path, result)
    });

    let mut loaded = LoadedSources::default();
    for (path, result) in join_all(reads).await {
        match result {
            Ok(content) => {
                debug!(file = %path.display(), bytes = content.len(), "loaded SQL file");
                loaded.sources.push(SourceFile::new(source_path(path), content));
            }
            Err(error) => {
                warn!(file = %path.display(), error = %error, "failed to load SQL file");
                loaded.failures.push(LoadFailure {
                    path: path.clone(),
                    error,
                });
            }
        }
    }
    loaded
}

/// Read a single file that must exist.
pub async fn load_file(path: &Path) -> CliResult<SourceFile> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Err(CliError::FileNotFound(path.to_path_buf()));
    }
    let content = tokio::fs::read_to_string(path).await?;
    Ok(SourceFile::new(source_path(path), content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_load_preserves_order_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("001-a.sql");
        let b = dir.path().join("002-b.sql");
        std::fs::write(&a, "SELECT 1;").unwrap();
        std::fs::write(&b, "SELECT 2;").unwrap();
        let missing = dir.path().join("003-missing.sql");

        let loaded = load_sources(&[b.clone(), missing.clone(), a.clone()]).await;

        let contents: Vec<&str> = loaded.sources.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["SELECT 2;", "SELECT 1;"]);
        assert_eq!(loaded.failures.len(), 1);
        assert_eq!(loaded.failures[0].path, missing);
    }

    #[tokio::test]
    async fn test_load_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_file(&dir.path().join("nope.sql")).await.unwrap_err();
        assert!(matches!(err, CliError::FileNotFound(_)));
    }

    #[test]
    fn test_source_path_is_normalized() {
        assert_eq!(source_path(Path::new("./migrations/001-a.sql")), "migrations/001-a.sql");
        assert_eq!(source_path(Path::new("db/../m/001-a.sql")), "m/001-a.sql");
    }
}
