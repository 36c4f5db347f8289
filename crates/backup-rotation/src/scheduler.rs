/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup scheduling system

use crate::{
    error::{BackupError, Result},
    metrics::BackupStats,
    pipeline::Orchestrator,
};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::{future::Future, str::FromStr, sync::Arc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Schedule configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cron expression; five-field expressions get a zero seconds field
    pub cron: Option<String>,
    /// Run once immediately before waiting for the first tick
    pub run_on_start: bool,
}

impl ScheduleConfig {
    /// Hourly unless configured otherwise
    pub fn expression(&self) -> &str {
        self.cron.as_deref().unwrap_or("0 0 * * * *")
    }
}

/// Backup scheduler
#[derive(Debug)]
pub struct BackupScheduler {
    config: ScheduleConfig,
    schedule: Schedule,
    stats: Arc<RwLock<BackupStats>>,
}

/// Scheduler status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub expression: String,
    pub next_backup: Option<DateTime<Utc>>,
    pub stats: BackupStats,
}

impl BackupScheduler {
    /// Create a new backup scheduler
    pub fn new(config: &ScheduleConfig) -> Result<Self> {
        let schedule = parse_schedule(config.expression())?;
        info!(expression = config.expression(), "Initializing backup scheduler");

        Ok(Self {
            config: config.clone(),
            schedule,
            stats: Arc::new(RwLock::new(BackupStats::new())),
        })
    }

    pub fn next_run(&self) -> Option<DateTime<Utc>> {
        self.schedule.upcoming(Utc).next()
    }

    /// Get schedule status
    pub async fn get_status(&self) -> SchedulerStatus {
        SchedulerStatus {
            expression: self.config.expression().to_string(),
            next_backup: self.next_run(),
            stats: self.stats.read().await.clone(),
        }
    }

    /// Run the pipeline at every scheduled instant until `shutdown` resolves.
    ///
    /// Runs execute one after another; a tick that passes while a run is in
    /// progress is skipped. Shutdown takes effect between runs.
    pub async fn run<F>(&self, orchestrator: &Orchestrator, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.config.run_on_start {
            self.tick(orchestrator).await;
        }

        loop {
            let next = self.next_run().ok_or_else(|| {
                BackupError::Schedule(format!(
                    "No upcoming run for expression {}",
                    self.config.expression()
                ))
            })?;
            let delay = (next - Utc::now()).to_std().unwrap_or_default();
            info!(next_run = %next, "Waiting for next scheduled backup");

            tokio::select! {
                _ = tokio::time::sleep(delay) => self.tick(orchestrator).await,
                _ = &mut shutdown => {
                    info!("Stopping backup scheduler");
                    return Ok(());
                }
            }
        }
    }

    async fn tick(&self, orchestrator: &Orchestrator) {
        match orchestrator.run().await {
            Ok(report) => {
                if let Some(stage) = report.failed_stage() {
                    warn!(stage = %stage, "Scheduled backup failed");
                }
                self.stats.write().await.record(&report);
            }
            Err(err @ BackupError::Locked { .. }) => {
                warn!(error = %err, "Skipping scheduled backup");
            }
            Err(err) => {
                error!(error = %err, "Scheduled backup could not start");
            }
        }
    }
}

fn parse_schedule(expression: &str) -> Result<Schedule> {
    let fields = expression.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| {
        BackupError::Schedule(format!("Invalid cron expression '{}': {}", expression, e))
    })
}
