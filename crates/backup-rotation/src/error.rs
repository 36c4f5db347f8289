/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Error types for the backup pipeline

use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors raised while producing, shipping or rotating backups.
///
/// `Dump`, `Encryption` and `Upload` abort a run. Pruning errors are
/// reported but never change the outcome of an otherwise successful run.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dump failed: {0}")]
    Dump(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Local prune failed: {0}")]
    LocalPrune(String),

    #[error("Remote prune failed: {0}")]
    RemotePrune(String),

    #[error("Failed to delete {id}: {reason}")]
    Delete { id: String, reason: String },

    #[error("Invalid artifact format: {0}")]
    InvalidFormat(String),

    #[error("Another run holds the lock at {path}")]
    Locked { path: String },

    #[error("Schedule error: {0}")]
    Schedule(String),
}

impl BackupError {
    /// Whether this error aborts the pipeline run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BackupError::LocalPrune(_) | BackupError::RemotePrune(_) | BackupError::Delete { .. }
        )
    }

    /// Get error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            BackupError::Io(_) => "io",
            BackupError::Serialization(_) => "serialization",
            BackupError::Config(_) => "config",
            BackupError::Dump(_) => "dump",
            BackupError::Compression(_) => "compression",
            BackupError::Encryption(_) => "encryption",
            BackupError::Upload(_) => "upload",
            BackupError::Storage(_) => "storage",
            BackupError::LocalPrune(_) => "local_prune",
            BackupError::RemotePrune(_) => "remote_prune",
            BackupError::Delete { .. } => "delete",
            BackupError::InvalidFormat(_) => "invalid_format",
            BackupError::Locked { .. } => "locked",
            BackupError::Schedule(_) => "schedule",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_fatal() {
        assert!(BackupError::Dump("exit 2".into()).is_fatal());
        assert!(BackupError::Upload("timeout".into()).is_fatal());
        assert!(!BackupError::RemotePrune("listing failed".into()).is_fatal());
        assert!(
            !BackupError::Delete {
                id: "abc".into(),
                reason: "403".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_error_category() {
        assert_eq!(BackupError::Encryption("x".into()).category(), "encryption");
        assert_eq!(BackupError::LocalPrune("x".into()).category(), "local_prune");
    }
}
