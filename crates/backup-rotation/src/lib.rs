/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! # Backup Rotation
//!
//! Scheduled logical database backups with tiered remote retention:
//!
//! - Streamed dumps through `mysqldump` or `pg_dump` with gzip or zstd
//! - Passphrase encryption (AES-256-GCM or ChaCha20-Poly1305)
//! - Upload to a local directory or Amazon S3
//! - Hourly, daily, weekly, monthly and yearly retention bands
//! - Cron scheduling with a single-run lock

pub mod compression;
pub mod config;
pub mod dump;
pub mod encryption;
pub mod error;
pub mod local;
pub mod lock;
pub mod metrics;
pub mod pipeline;
pub mod record;
pub mod retention;
pub mod scheduler;
pub mod storage;

pub use compression::{CompressionConfig, CompressionType};
pub use config::BackupRotationConfig;
pub use dump::{CommandDump, DatabaseConfig, DatabaseEngine, DumpProducer};
pub use encryption::{decrypt_file, ArtifactEncryptor, EncryptionConfig, EncryptionType, PassphraseEncryptor};
pub use error::{BackupError, Result};
pub use pipeline::{Orchestrator, PipelineSettings, RemotePruneReport, RetentionPlan, RunReport, RunState, Stage};
pub use record::{ArtifactNaming, BackupRecord};
pub use retention::{classify, Band, BucketKey, RetentionDecision, RetentionPolicy};
pub use scheduler::{BackupScheduler, ScheduleConfig};
pub use storage::{create_gateway, RemoteObject, StorageConfig, StorageGateway};

use chrono::Utc;
use std::{future::Future, sync::Arc};
use tracing::info;

/// Backup rotation service assembled from configuration
#[derive(Debug, Clone)]
pub struct BackupRotationService {
    inner: Arc<BackupRotationServiceInner>,
}

#[derive(Debug)]
struct BackupRotationServiceInner {
    config: BackupRotationConfig,
    orchestrator: Orchestrator,
}

impl BackupRotationService {
    /// Create a new backup rotation service
    pub async fn new(config: BackupRotationConfig) -> Result<Self> {
        info!("Initializing backup rotation service");
        config.validate_rotation()?;

        let storage = storage::create_gateway(&config.storage).await?;
        let settings = PipelineSettings {
            naming: config.artifacts.naming()?,
            policy: config.retention.policy(),
            folder: config.storage.folder.clone(),
            local_dir: config.artifacts.directory.clone(),
            max_local: config.local.max_backups,
        };
        let producer = Arc::new(CommandDump::new(
            config.database.clone(),
            config.artifacts.compression,
        ));

        let mut orchestrator = Orchestrator::new(settings, producer, storage);
        if let Some(encryptor) = PassphraseEncryptor::from_config(&config.encryption)? {
            orchestrator = orchestrator.with_encryptor(Arc::new(encryptor));
        }

        Ok(Self {
            inner: Arc::new(BackupRotationServiceInner {
                config,
                orchestrator,
            }),
        })
    }

    pub fn config(&self) -> &BackupRotationConfig {
        &self.inner.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }

    /// Perform one full backup run
    pub async fn run_once(&self) -> Result<RunReport> {
        self.inner.config.validate()?;
        self.inner.orchestrator.run().await
    }

    /// Classify the remote folder without deleting anything
    pub async fn plan(&self) -> Result<RetentionPlan> {
        self.inner.orchestrator.plan(Utc::now()).await
    }

    /// Apply remote retention only
    pub async fn prune(&self) -> Result<RemotePruneReport> {
        self.inner.orchestrator.prune_remote(Utc::now()).await
    }

    /// Run on the configured schedule until `shutdown` resolves
    pub async fn run_scheduled<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.inner.config.validate()?;
        metrics::describe();

        let scheduler = BackupScheduler::new(&self.inner.config.schedule)?;
        scheduler.run(&self.inner.orchestrator, shutdown).await
    }
}
