/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Database dump producers
//!
//! The dump utility runs as a child process. Its stdout is read in chunks
//! and handed over a bounded channel to the compressor, which runs on a
//! blocking thread, so the uncompressed dump is never held in memory.

use crate::{
    compression::{spawn_compressor, CompressionConfig},
    config::secret_serde,
    error::{BackupError, Result},
};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    process::Stdio,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::mpsc,
};
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 16;

/// Produces a compressed logical dump at a local path
#[async_trait]
pub trait DumpProducer: Send + Sync + std::fmt::Debug {
    /// Write the artifact to `dest`. On failure no file is left at `dest`.
    async fn produce(&self, dest: &Path) -> Result<DumpStats>;
}

/// Size of a finished dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DumpStats {
    pub raw_bytes: u64,
    pub compressed_bytes: u64,
}

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Mysql,
    Postgres,
}

impl DatabaseEngine {
    fn default_binary(&self) -> &'static str {
        match self {
            DatabaseEngine::Mysql => "mysqldump",
            DatabaseEngine::Postgres => "pg_dump",
        }
    }

    fn password_env(&self) -> &'static str {
        match self {
            DatabaseEngine::Mysql => "MYSQL_PWD",
            DatabaseEngine::Postgres => "PGPASSWORD",
        }
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub engine: DatabaseEngine,
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    #[serde(with = "secret_serde")]
    pub password: Option<SecretString>,
    pub database: String,
    /// Overrides the engine's dump utility
    pub dump_binary: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: DatabaseEngine::Mysql,
            host: "database".to_string(),
            port: None,
            user: "root".to_string(),
            password: None,
            database: String::new(),
            dump_binary: None,
            extra_args: Vec::new(),
        }
    }
}

impl DatabaseConfig {
    pub fn dump_binary(&self) -> PathBuf {
        self.dump_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.engine.default_binary()))
    }

    /// Arguments passed to the dump utility. The password is never part of
    /// the argument list.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![format!("--host={}", self.host)];
        if let Some(port) = self.port {
            args.push(format!("--port={}", port));
        }

        match self.engine {
            DatabaseEngine::Mysql => {
                args.push(format!("--user={}", self.user));
                args.extend(
                    ["--single-transaction", "--quick", "--lock-tables=false"]
                        .map(str::to_string),
                );
            }
            DatabaseEngine::Postgres => {
                args.push(format!("--username={}", self.user));
                args.extend(["--no-password", "--format=plain"].map(str::to_string));
            }
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(self.database.clone());
        args
    }
}

/// Dump producer that shells out to `mysqldump` or `pg_dump`
#[derive(Debug, Clone)]
pub struct CommandDump {
    database: DatabaseConfig,
    compression: CompressionConfig,
}

impl CommandDump {
    pub fn new(database: DatabaseConfig, compression: CompressionConfig) -> Self {
        Self {
            database,
            compression,
        }
    }

    async fn run(&self, dest: &Path) -> Result<DumpStats> {
        let binary = self.database.dump_binary();
        let mut command = Command::new(&binary);
        command
            .args(self.database.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &self.database.password {
            command.env(self.database.engine.password_env(), password.expose_secret());
        }

        debug!(binary = %binary.display(), database = %self.database.database, "Spawning dump");
        let mut child = command
            .spawn()
            .map_err(|e| BackupError::Dump(format!("Failed to start {}: {}", binary.display(), e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::Dump("Dump stdout not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackupError::Dump("Dump stderr not captured".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut output = String::new();
            stderr.read_to_string(&mut output).await.map(|_| output)
        });

        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let compressor = spawn_compressor(dest.to_path_buf(), self.compression, rx);

        let pumped = pump(stdout, tx).await;
        if pumped.is_err() {
            // The compressor is gone; stop the producer so it cannot block
            // on a full pipe.
            let _ = child.start_kill();
        }

        let status = child.wait().await?;
        let compressed = compressor
            .await
            .map_err(|e| BackupError::Compression(format!("Compressor task failed: {}", e)))?;
        let stderr = stderr_task
            .await
            .ok()
            .and_then(|output| output.ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(BackupError::Dump(format!(
                "{} exited with {}: {}",
                binary.display(),
                status,
                stderr.trim()
            )));
        }
        pumped?;
        let raw_bytes = compressed?;

        if !stderr.trim().is_empty() {
            warn!(stderr = %stderr.trim(), "Dump utility reported warnings");
        }

        let compressed_bytes = tokio::fs::metadata(dest).await?.len();
        Ok(DumpStats {
            raw_bytes,
            compressed_bytes,
        })
    }
}

#[async_trait]
impl DumpProducer for CommandDump {
    async fn produce(&self, dest: &Path) -> Result<DumpStats> {
        match self.run(dest).await {
            Ok(stats) => {
                info!(
                    path = %dest.display(),
                    raw_bytes = stats.raw_bytes,
                    compressed_bytes = stats.compressed_bytes,
                    "Database dump written"
                );
                Ok(stats)
            }
            Err(err) => {
                if let Err(cleanup) = tokio::fs::remove_file(dest).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %dest.display(), error = %cleanup, "Failed to remove partial dump");
                    }
                }
                Err(err)
            }
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) -> Result<u64> {
    let mut total = 0u64;
    loop {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(total);
        }
        chunk.truncate(read);
        total += read as u64;
        tx.send(chunk)
            .await
            .map_err(|_| BackupError::Compression("Compressor stopped accepting data".to_string()))?;
    }
}
