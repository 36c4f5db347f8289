/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Metrics collection for backup runs
//!
//! Values are emitted through the `metrics` facade; without an installed
//! recorder they are discarded. [`BackupStats`] keeps a running summary for
//! long-lived processes.

use crate::pipeline::{RemotePruneReport, RunReport};
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Register metric descriptions with the installed recorder
pub fn describe() {
    describe_counter!("backup_runs_total", "Backup runs by outcome");
    describe_counter!("backup_stage_failures_total", "Failed runs by pipeline stage");
    describe_counter!("backup_remote_deleted_total", "Remote artifacts removed by rotation");
    describe_counter!(
        "backup_remote_delete_failures_total",
        "Remote deletes that failed during rotation"
    );
    describe_gauge!("backup_artifact_bytes", "Size of the most recent uploaded artifact");
    describe_histogram!("backup_run_duration_seconds", "Wall time of a backup run");
}

/// Record the outcome of one pipeline run
pub fn record_run(report: &RunReport) {
    let outcome = if report.is_success() { "success" } else { "failure" };
    counter!("backup_runs_total", "outcome" => outcome).increment(1);
    histogram!("backup_run_duration_seconds").record(report.duration_secs);

    if let Some(stage) = report.failed_stage() {
        counter!("backup_stage_failures_total", "stage" => stage.as_str()).increment(1);
    }
    if report.uploaded_id.is_some() {
        if let Some(bytes) = report.artifact_bytes {
            gauge!("backup_artifact_bytes").set(bytes as f64);
        }
    }
}

/// Record the deletes issued by remote rotation
pub fn record_remote_prune(report: &RemotePruneReport) {
    counter!("backup_remote_deleted_total").increment(report.deleted.len() as u64);
    counter!("backup_remote_delete_failures_total").increment(report.failed.len() as u64);
}

/// Running totals across the runs of one process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackupStats {
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub total_bytes_uploaded: u64,
    pub remote_deleted: u64,
    pub remote_delete_failures: u64,
    pub average_run_duration: f64,
    pub last_run_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub failures_by_stage: HashMap<String, u64>,
}

impl BackupStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a finished run into the totals
    pub fn record(&mut self, report: &RunReport) {
        self.total_runs += 1;

        match report.failed_stage() {
            None => {
                self.successful_runs += 1;
                self.last_success_time = Some(report.started_at);
            }
            Some(stage) => {
                self.failed_runs += 1;
                *self
                    .failures_by_stage
                    .entry(stage.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        if report.uploaded_id.is_some() {
            self.total_bytes_uploaded += report.artifact_bytes.unwrap_or(0);
        }
        if let Some(remote) = &report.remote_prune {
            self.remote_deleted += remote.deleted.len() as u64;
            self.remote_delete_failures += remote.failed.len() as u64;
        }

        // Update average duration
        let total_duration = self.average_run_duration * (self.total_runs - 1) as f64;
        self.average_run_duration = (total_duration + report.duration_secs) / self.total_runs as f64;

        self.last_run_time = Some(report.started_at);
    }
}
