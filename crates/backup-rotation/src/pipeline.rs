/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup pipeline
//!
//! One run walks `Dumping -> Encrypting -> Uploading -> LocalPruning ->
//! RemotePruning`. A failure in the first three stages ends the run; the
//! pruning stages only ever add warnings to the report.

use crate::{
    dump::{DumpProducer, DumpStats},
    encryption::ArtifactEncryptor,
    error::{BackupError, Result},
    local::{prune_local, LocalPruneReport},
    lock::RunLock,
    metrics,
    record::{ArtifactNaming, BackupRecord},
    retention::{classify, BandTally, RetentionDecision, RetentionPolicy},
    storage::StorageGateway,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Dumping,
    Encrypting,
    Uploading,
    LocalPruning,
    RemotePruning,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Dumping => "dumping",
            Stage::Encrypting => "encrypting",
            Stage::Uploading => "uploading",
            Stage::LocalPruning => "local_pruning",
            Stage::RemotePruning => "remote_pruning",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "stage", rename_all = "snake_case")]
pub enum RunState {
    Done,
    Failed(Stage),
}

/// Fixed inputs of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub naming: ArtifactNaming,
    pub policy: RetentionPolicy,
    /// Remote folder holding the artifacts
    pub folder: String,
    pub local_dir: PathBuf,
    pub max_local: usize,
}

/// A remote delete that did not go through
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteFailure {
    pub id: String,
    pub reason: String,
}

/// Outcome of remote rotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemotePruneReport {
    pub listed: usize,
    pub kept: usize,
    pub unparsed: usize,
    pub tally: BandTally,
    pub deleted: Vec<String>,
    pub failed: Vec<DeleteFailure>,
}

/// Remote listing together with the decision that would be applied to it
#[derive(Debug, Clone, Serialize)]
pub struct RetentionPlan {
    pub now: DateTime<Utc>,
    pub records: Vec<BackupRecord>,
    pub decision: RetentionDecision,
}

/// Everything that happened during one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub state: RunState,
    pub duration_secs: f64,
    pub dump: Option<DumpStats>,
    /// Final local artifact, encrypted or not
    pub artifact: Option<PathBuf>,
    pub artifact_bytes: Option<u64>,
    pub uploaded_id: Option<String>,
    pub local_prune: Option<LocalPruneReport>,
    pub remote_prune: Option<RemotePruneReport>,
    pub error: Option<String>,
    pub notes: Vec<String>,
}

impl RunReport {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            state: RunState::Done,
            duration_secs: 0.0,
            dump: None,
            artifact: None,
            artifact_bytes: None,
            uploaded_id: None,
            local_prune: None,
            remote_prune: None,
            error: None,
            notes: Vec::new(),
        }
    }

    fn fail(mut self, stage: Stage, err: BackupError) -> Self {
        error!(stage = %stage, error = %err, "Backup run failed");
        self.state = RunState::Failed(stage);
        self.error = Some(err.to_string());
        self
    }

    fn note(&mut self, stage: Stage, err: &BackupError) {
        warn!(stage = %stage, error = %err, "Stage finished with errors");
        self.notes.push(format!("{}: {}", stage, err));
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self.state {
            RunState::Done => None,
            RunState::Failed(stage) => Some(stage),
        }
    }

    /// Process exit status for this run
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Done => 0,
            RunState::Failed(Stage::Dumping) => 2,
            RunState::Failed(Stage::Encrypting) => 3,
            RunState::Failed(Stage::Uploading) => 4,
            RunState::Failed(_) => 1,
        }
    }
}

/// Drives a backup run against its collaborators
#[derive(Debug, Clone)]
pub struct Orchestrator {
    settings: PipelineSettings,
    producer: Arc<dyn DumpProducer>,
    encryptor: Option<Arc<dyn ArtifactEncryptor>>,
    storage: Arc<dyn StorageGateway>,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        producer: Arc<dyn DumpProducer>,
        storage: Arc<dyn StorageGateway>,
    ) -> Self {
        Self {
            settings,
            producer,
            encryptor: None,
            storage,
        }
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn ArtifactEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run the whole pipeline once.
    ///
    /// Errors are returned only when the run cannot start at all; stage
    /// failures are reported through [`RunReport::state`].
    pub async fn run(&self) -> Result<RunReport> {
        self.run_at(Utc::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let started = Instant::now();
        tokio::fs::create_dir_all(&self.settings.local_dir).await?;
        let _lock = RunLock::acquire(&self.settings.local_dir)?;

        let mut report = self.execute(now).await;
        report.duration_secs = started.elapsed().as_secs_f64();
        metrics::record_run(&report);

        if report.is_success() {
            info!(
                id = report.uploaded_id.as_deref().unwrap_or_default(),
                duration_secs = report.duration_secs,
                notes = report.notes.len(),
                "Backup run completed"
            );
        }
        Ok(report)
    }

    async fn execute(&self, now: DateTime<Utc>) -> RunReport {
        let mut report = RunReport::new(now);
        let dump_path = self
            .settings
            .local_dir
            .join(self.settings.naming.file_name(now));

        info!(stage = %Stage::Dumping, path = %dump_path.display(), "Starting stage");
        match self.producer.produce(&dump_path).await {
            Ok(stats) => report.dump = Some(stats),
            Err(err) => return report.fail(Stage::Dumping, err),
        }

        let artifact = match &self.encryptor {
            Some(encryptor) => {
                info!(stage = %Stage::Encrypting, "Starting stage");
                match encryptor.encrypt(&dump_path).await {
                    Ok(encrypted) => {
                        remove_plaintext(&dump_path, &encrypted, &mut report).await;
                        encrypted
                    }
                    Err(err) => return report.fail(Stage::Encrypting, err),
                }
            }
            None => dump_path,
        };

        let artifact_name = match artifact.file_name().and_then(|name| name.to_str()) {
            Some(name) => name.to_string(),
            None => {
                let err = BackupError::Upload(format!(
                    "Artifact path has no usable file name: {}",
                    artifact.display()
                ));
                return report.fail(Stage::Uploading, err);
            }
        };
        report.artifact_bytes = tokio::fs::metadata(&artifact).await.ok().map(|m| m.len());
        report.artifact = Some(artifact.clone());

        info!(stage = %Stage::Uploading, name = %artifact_name, "Starting stage");
        match self
            .storage
            .upload(&artifact_name, &artifact, &self.settings.folder)
            .await
        {
            Ok(id) => {
                info!(id = %id, backend = self.storage.backend_name(), "Artifact uploaded");
                report.uploaded_id = Some(id);
            }
            Err(err) => return report.fail(Stage::Uploading, err),
        }

        info!(stage = %Stage::LocalPruning, "Starting stage");
        match prune_local(
            &self.settings.local_dir,
            &self.settings.naming,
            self.settings.max_local,
        )
        .await
        {
            Ok(pruned) => {
                for path in &pruned.failed {
                    report.notes.push(format!(
                        "{}: could not remove {}",
                        Stage::LocalPruning,
                        path.display()
                    ));
                }
                report.local_prune = Some(pruned);
            }
            Err(err) => report.note(Stage::LocalPruning, &local_prune_error(err)),
        }

        info!(stage = %Stage::RemotePruning, "Starting stage");
        match self.prune_remote(now).await {
            Ok(pruned) => {
                for failure in &pruned.failed {
                    report.notes.push(format!(
                        "{}: could not delete {}: {}",
                        Stage::RemotePruning,
                        failure.id,
                        failure.reason
                    ));
                }
                report.remote_prune = Some(pruned);
            }
            Err(err) => report.note(Stage::RemotePruning, &err),
        }

        report
    }

    /// List the remote folder and classify it without deleting anything
    pub async fn plan(&self, now: DateTime<Utc>) -> Result<RetentionPlan> {
        let objects = self
            .storage
            .list(&self.settings.folder, &self.settings.naming.list_prefix())
            .await
            .map_err(|e| BackupError::RemotePrune(format!("Listing failed: {}", e)))?;

        let records: Vec<BackupRecord> = objects
            .into_iter()
            .map(|object| BackupRecord::from_remote(object, &self.settings.naming))
            .collect();
        let decision = classify(now, &records, &self.settings.policy);

        debug!(
            listed = records.len(),
            keep = decision.keep.len(),
            delete = decision.delete.len(),
            unparsed = decision.unparsed.len(),
            "Classified remote backups"
        );
        Ok(RetentionPlan {
            now,
            records,
            decision,
        })
    }

    /// Apply the retention policy to the remote folder.
    ///
    /// A listing failure aborts the prune; individual delete failures are
    /// collected and the batch continues.
    pub async fn prune_remote(&self, now: DateTime<Utc>) -> Result<RemotePruneReport> {
        let plan = self.plan(now).await?;
        let decision = plan.decision;

        let mut report = RemotePruneReport {
            listed: plan.records.len(),
            kept: decision.keep.len(),
            unparsed: decision.unparsed.len(),
            tally: decision.tally,
            ..Default::default()
        };

        for id in &decision.delete {
            match self.storage.delete(id).await {
                Ok(()) => {
                    debug!(id = %id, "Deleted remote backup");
                    report.deleted.push(id.clone());
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "Failed to delete remote backup");
                    report.failed.push(DeleteFailure {
                        id: id.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        metrics::record_remote_prune(&report);
        info!(
            kept = report.kept,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            unparsed = report.unparsed,
            hourly = report.tally.hourly,
            daily = report.tally.daily,
            weekly = report.tally.weekly,
            monthly = report.tally.monthly,
            yearly = report.tally.yearly,
            "Remote rotation finished"
        );
        Ok(report)
    }
}

/// Drop the plaintext dump once its encrypted sibling is on disk
async fn remove_plaintext(plaintext: &Path, encrypted: &Path, report: &mut RunReport) {
    match tokio::fs::try_exists(encrypted).await {
        Ok(true) => {
            if let Err(e) = tokio::fs::remove_file(plaintext).await {
                report.note(Stage::Encrypting, &BackupError::Io(e));
            }
        }
        _ => report.notes.push(format!(
            "{}: encrypted file not confirmed, kept {}",
            Stage::Encrypting,
            plaintext.display()
        )),
    }
}

fn local_prune_error(err: BackupError) -> BackupError {
    match err {
        BackupError::LocalPrune(_) => err,
        other => BackupError::LocalPrune(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        record::ENCRYPTED_EXTENSION,
        storage::{memory::MemoryStorageBackend, RemoteObject},
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::HashSet;
    use tempfile::TempDir;

    #[derive(Debug)]
    struct FakeDump {
        fail: bool,
    }

    #[async_trait]
    impl DumpProducer for FakeDump {
        async fn produce(&self, dest: &Path) -> Result<DumpStats> {
            if self.fail {
                return Err(BackupError::Dump("mysqldump exited with 2".to_string()));
            }
            tokio::fs::write(dest, b"-- dump").await?;
            Ok(DumpStats {
                raw_bytes: 7,
                compressed_bytes: 7,
            })
        }
    }

    #[derive(Debug)]
    struct FakeEncryptor {
        fail: bool,
    }

    #[async_trait]
    impl ArtifactEncryptor for FakeEncryptor {
        async fn encrypt(&self, source: &Path) -> Result<PathBuf> {
            if self.fail {
                return Err(BackupError::Encryption("bad key".to_string()));
            }
            let target = PathBuf::from(format!("{}.{}", source.display(), ENCRYPTED_EXTENSION));
            tokio::fs::copy(source, &target).await?;
            Ok(target)
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap()
    }

    fn settings(dir: &Path) -> PipelineSettings {
        PipelineSettings {
            naming: ArtifactNaming::new("db", "sql.gz").unwrap(),
            policy: RetentionPolicy::default(),
            folder: "backups".to_string(),
            local_dir: dir.to_path_buf(),
            max_local: 5,
        }
    }

    fn orchestrator(dir: &Path, storage: Arc<MemoryStorageBackend>, fail_dump: bool) -> Orchestrator {
        Orchestrator::new(
            settings(dir),
            Arc::new(FakeDump { fail: fail_dump }),
            storage,
        )
    }

    #[tokio::test]
    async fn test_successful_run() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorageBackend::with_names(&[
            "db_20240310_080000.sql.gz",
            "db_20240305_090000.sql.gz",
            "db_20240305_150000.sql.gz",
            "unrelated.txt",
        ]));

        let report = orchestrator(dir.path(), storage.clone(), false)
            .run_at(now())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.uploaded_id.as_deref(), Some("id-db_20240310_120000.sql.gz"));
        assert!(dir.path().join("db_20240310_120000.sql.gz").exists());

        let remote = report.remote_prune.unwrap();
        assert_eq!(remote.deleted, vec!["id-db_20240305_090000.sql.gz".to_string()]);
        assert_eq!(remote.kept, 3);

        let names: HashSet<String> = storage.names().into_iter().collect();
        assert!(names.contains("db_20240310_120000.sql.gz"));
        assert!(names.contains("db_20240305_150000.sql.gz"));
        assert!(names.contains("unrelated.txt"));
        assert!(!names.contains("db_20240305_090000.sql.gz"));

        // The lock is released after the run
        assert!(RunLock::acquire(dir.path()).is_ok());
    }

    #[tokio::test]
    async fn test_dump_failure_stops_pipeline() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorageBackend::with_names(&["db_20200101_000000.sql.gz"]));

        let report = orchestrator(dir.path(), storage.clone(), true)
            .run_at(now())
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Failed(Stage::Dumping));
        assert_eq!(report.exit_code(), 2);
        assert!(report.uploaded_id.is_none());
        // Nothing was pruned
        assert_eq!(storage.names(), vec!["db_20200101_000000.sql.gz".to_string()]);
    }

    #[tokio::test]
    async fn test_encryption_replaces_plaintext() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorageBackend::default());

        let report = orchestrator(dir.path(), storage.clone(), false)
            .with_encryptor(Arc::new(FakeEncryptor { fail: false }))
            .run_at(now())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(!dir.path().join("db_20240310_120000.sql.gz").exists());
        assert!(dir.path().join("db_20240310_120000.sql.gz.enc").exists());
        assert_eq!(storage.names(), vec!["db_20240310_120000.sql.gz.enc".to_string()]);
    }

    #[tokio::test]
    async fn test_encryption_failure_keeps_plaintext() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorageBackend::default());

        let report = orchestrator(dir.path(), storage.clone(), false)
            .with_encryptor(Arc::new(FakeEncryptor { fail: true }))
            .run_at(now())
            .await
            .unwrap();

        assert_eq!(report.failed_stage(), Some(Stage::Encrypting));
        assert_eq!(report.exit_code(), 3);
        assert!(dir.path().join("db_20240310_120000.sql.gz").exists());
        assert!(storage.names().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_preserves_artifact() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorageBackend {
            fail_upload: true,
            ..Default::default()
        });

        let report = orchestrator(dir.path(), storage, false)
            .run_at(now())
            .await
            .unwrap();

        assert_eq!(report.exit_code(), 4);
        assert!(report.local_prune.is_none());
        assert!(dir.path().join("db_20240310_120000.sql.gz").exists());
    }

    #[tokio::test]
    async fn test_listing_failure_does_not_fail_run() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorageBackend {
            fail_list: true,
            ..Default::default()
        });

        let report = orchestrator(dir.path(), storage, false)
            .run_at(now())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(report.remote_prune.is_none());
        assert_eq!(report.notes.len(), 1);
        assert!(report.notes[0].starts_with("remote_pruning"));
    }

    #[tokio::test]
    async fn test_delete_failures_are_counted() {
        let dir = TempDir::new().unwrap();
        let storage = MemoryStorageBackend {
            fail_delete: HashSet::from(["id-db_20240305_090000.sql.gz".to_string()]),
            ..Default::default()
        };
        for name in [
            "db_20240305_090000.sql.gz",
            "db_20240305_150000.sql.gz",
            "db_20240304_090000.sql.gz",
            "db_20240304_100000.sql.gz",
        ] {
            storage.insert(name);
        }
        let storage = Arc::new(storage);

        let report = orchestrator(dir.path(), storage.clone(), false)
            .prune_remote(now())
            .await
            .unwrap();

        assert_eq!(report.deleted, vec!["id-db_20240304_090000.sql.gz".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, "id-db_20240305_090000.sql.gz");
        assert_eq!(storage.names().len(), 3);
    }

    #[tokio::test]
    async fn test_local_retention_applied() {
        let dir = TempDir::new().unwrap();
        for day in 1..=6 {
            tokio::fs::write(dir.path().join(format!("db_202403{:02}_000000.sql.gz", day)), b"x")
                .await
                .unwrap();
        }
        let storage = Arc::new(MemoryStorageBackend::default());
        let mut orchestrator = orchestrator(dir.path(), storage, false);
        orchestrator.settings.max_local = 3;

        let report = orchestrator.run_at(now()).await.unwrap();

        let local = report.local_prune.unwrap();
        assert_eq!(local.kept, 3);
        assert_eq!(local.deleted.len(), 4);
        assert!(dir.path().join("db_20240310_120000.sql.gz").exists());
    }

    /// Uploads into memory, then removes the local backup directory
    #[derive(Debug)]
    struct DirRemovingStorage {
        inner: Arc<MemoryStorageBackend>,
        dir: PathBuf,
    }

    #[async_trait]
    impl StorageGateway for DirRemovingStorage {
        async fn upload(&self, name: &str, source: &Path, folder: &str) -> Result<String> {
            let id = self.inner.upload(name, source, folder).await?;
            tokio::fs::remove_dir_all(&self.dir).await?;
            Ok(id)
        }

        async fn list(&self, folder: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
            self.inner.list(folder, prefix).await
        }

        async fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id).await
        }

        fn backend_name(&self) -> &'static str {
            "dir-removing"
        }
    }

    #[tokio::test]
    async fn test_local_prune_failure_does_not_fail_run() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("local");
        let inner = Arc::new(MemoryStorageBackend::with_names(&[
            "db_20240305_090000.sql.gz",
            "db_20240305_150000.sql.gz",
        ]));
        let storage = Arc::new(DirRemovingStorage {
            inner: inner.clone(),
            dir: dir.clone(),
        });

        let report = Orchestrator::new(settings(&dir), Arc::new(FakeDump { fail: false }), storage)
            .run_at(now())
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.exit_code(), 0);
        assert!(report.local_prune.is_none());
        assert_eq!(report.notes.len(), 1);
        assert!(report.notes[0].starts_with("local_pruning"));

        // Remote rotation still ran after the local failure
        let remote = report.remote_prune.unwrap();
        assert_eq!(remote.deleted, vec!["id-db_20240305_090000.sql.gz".to_string()]);
        let names: HashSet<String> = inner.names().into_iter().collect();
        assert!(names.contains("db_20240310_120000.sql.gz"));
        assert!(!names.contains("db_20240305_090000.sql.gz"));
    }

    #[tokio::test]
    async fn test_leftover_lock_file_does_not_block_runs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(crate::lock::LOCK_FILE_NAME), "999999\n").unwrap();
        let storage = Arc::new(MemoryStorageBackend::default());
        let orchestrator = orchestrator(dir.path(), storage.clone(), false);

        for hour in [12, 13, 14] {
            let at = Utc.with_ymd_and_hms(2024, 3, 10, hour, 0, 0).unwrap();
            let report = orchestrator.run_at(at).await.unwrap();
            assert!(report.is_success());
        }

        assert_eq!(storage.names().len(), 3);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_remote_prune_logs_band_survivors() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorageBackend::with_names(&[
            "db_20240310_080000.sql.gz",
            "db_20240305_090000.sql.gz",
            "db_20240305_150000.sql.gz",
            "db_20240220_090000.sql.gz",
        ]));
        orchestrator(dir.path(), storage, false)
            .prune_remote(now())
            .await
            .unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|line| line.contains("Remote rotation finished"))
            .unwrap();
        for field in ["hourly=1", "daily=1", "weekly=1", "monthly=0", "yearly=0"] {
            assert!(line.contains(field), "missing {field} in {line}");
        }
    }

    #[tokio::test]
    async fn test_plan_does_not_delete() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(MemoryStorageBackend::with_names(&[
            "db_20240305_090000.sql.gz",
            "db_20240305_150000.sql.gz",
        ]));

        let plan = orchestrator(dir.path(), storage.clone(), false)
            .plan(now())
            .await
            .unwrap();

        assert_eq!(plan.decision.delete.len(), 1);
        assert_eq!(storage.names().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_rejected() {
        let dir = TempDir::new().unwrap();
        let _held = RunLock::acquire(dir.path()).unwrap();
        let storage = Arc::new(MemoryStorageBackend::default());

        let err = orchestrator(dir.path(), storage.clone(), false)
            .run_at(now())
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Locked { .. }));
        assert!(storage.names().is_empty());
    }
}
