/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Local artifact pruning

use crate::{
    error::{BackupError, Result},
    record::ArtifactNaming,
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, warn};

/// Outcome of pruning the local backup directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LocalPruneReport {
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Keep the `max_backups` newest artifacts in `dir` by modification time.
///
/// Only files matching `naming` are considered. Files that cannot be
/// removed are recorded in the report rather than failing the prune.
pub async fn prune_local(
    dir: &Path,
    naming: &ArtifactNaming,
    max_backups: usize,
) -> Result<LocalPruneReport> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| BackupError::LocalPrune(format!("Cannot read {}: {}", dir.display(), e)))?;

    let mut artifacts: Vec<(SystemTime, PathBuf)> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| BackupError::LocalPrune(e.to_string()))?
    {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| naming.matches(name));
        if !matches {
            continue;
        }

        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        artifacts.push((metadata.modified()?, path));
    }

    // Newest first; names break mtime ties so the order is stable
    artifacts.sort_by(|a, b| b.cmp(a));

    let mut report = LocalPruneReport {
        kept: artifacts.len().min(max_backups),
        ..Default::default()
    };
    for (_, path) in artifacts.into_iter().skip(max_backups) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed local backup");
                report.deleted.push(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                report.deleted.push(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to remove local backup");
                report.failed.push(path);
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn naming() -> ArtifactNaming {
        ArtifactNaming::new("db", "sql.gz").unwrap()
    }

    async fn touch(dir: &Path, name: &str, age: Duration) {
        let path = dir.join(name);
        tokio::fs::write(&path, b"x").await.unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_keeps_newest_by_mtime() {
        let dir = TempDir::new().unwrap();
        for (i, name) in [
            "db_20240101_000000.sql.gz",
            "db_20240102_000000.sql.gz",
            "db_20240103_000000.sql.gz",
        ]
        .iter()
        .enumerate()
        {
            // The lexicographically smallest name is the newest file
            touch(dir.path(), name, Duration::from_secs(60 * (i as u64 + 1))).await;
        }
        touch(dir.path(), "notes.txt", Duration::from_secs(86_400)).await;

        let report = prune_local(dir.path(), &naming(), 2).await.unwrap();

        assert_eq!(report.kept, 2);
        assert_eq!(
            report.deleted,
            vec![dir.path().join("db_20240103_000000.sql.gz")]
        );
        assert!(dir.path().join("db_20240101_000000.sql.gz").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn test_encrypted_artifacts_are_counted() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "db_20240101_000000.sql.gz.enc", Duration::from_secs(120)).await;
        touch(dir.path(), "db_20240102_000000.sql.gz.enc", Duration::from_secs(60)).await;

        let report = prune_local(dir.path(), &naming(), 1).await.unwrap();

        assert_eq!(report.deleted.len(), 1);
        assert!(dir.path().join("db_20240102_000000.sql.gz.enc").exists());
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let dir = TempDir::new().unwrap();
        let err = prune_local(&dir.path().join("gone"), &naming(), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::LocalPrune(_)));
        assert!(!err.is_fatal());
    }
}
