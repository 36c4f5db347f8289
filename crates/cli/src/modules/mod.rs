/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use std::path::Path;

use backup_rotation::{BackupRotationConfig, BackupRotationService};

pub mod cli;
pub mod commands;
pub mod logging;
pub mod output;

/// Exit status for errors raised before any pipeline stage runs
pub const EXIT_SETUP_FAILURE: u8 = 1;

/// Load configuration from the optional file plus the environment
pub async fn load_config(path: Option<&Path>) -> anyhow::Result<BackupRotationConfig> {
    Ok(BackupRotationConfig::load(path).await?)
}

/// Build the service for commands that talk to storage
pub async fn load_service(path: Option<&Path>) -> anyhow::Result<BackupRotationService> {
    let config = load_config(path).await?;
    Ok(BackupRotationService::new(config).await?)
}
