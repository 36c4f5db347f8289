/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Single-run lock
//!
//! The lock is an exclusive advisory lock (`flock` on Unix, `LockFileEx` on
//! Windows) held on a file in the backup directory. The kernel drops it when
//! the owning process exits for any reason, so a killed run never blocks the
//! next one. The file itself stays in place and only records the pid of the
//! last holder for operators.

use crate::error::{BackupError, Result};
use fs2::FileExt;
use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

pub const LOCK_FILE_NAME: &str = ".backup-rotation.lock";

/// Exclusive marker for one pipeline run in a backup directory.
///
/// Released when the guard is dropped or the process dies.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(BackupError::Locked {
                    path: path.display().to_string(),
                });
            }
            return Err(e.into());
        }

        // Stale content from a dead holder is simply overwritten
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_data()?;

        debug!(path = %path.display(), "Acquired run lock");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "Failed to release run lock");
        }
    }
}
