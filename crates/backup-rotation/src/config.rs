/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Configuration for the backup pipeline
//!
//! Settings come from an optional TOML file and are then overridden by
//! environment variables, so container deployments can run with no file.

use crate::{
    compression::CompressionConfig,
    dump::{DatabaseConfig, DatabaseEngine},
    encryption::{EncryptionConfig, PassphraseEncryptor},
    error::{BackupError, Result},
    record::ArtifactNaming,
    retention::RetentionPolicy,
    scheduler::ScheduleConfig,
    storage::{LocalStorageConfig, S3StorageConfig, StorageBackendType, StorageConfig},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{path::{Path, PathBuf}, str::FromStr};
use tracing::{debug, info};

/// Main configuration for the backup pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupRotationConfig {
    pub database: DatabaseConfig,
    pub artifacts: ArtifactConfig,
    pub retention: RetentionConfig,
    pub encryption: EncryptionConfig,
    pub storage: StorageConfig,
    pub local: LocalRetentionConfig,
    pub schedule: ScheduleConfig,
}

/// Where and how local artifacts are written
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub directory: PathBuf,
    pub prefix: String,
    /// Base extension before the compression suffix
    pub extension: String,
    pub compression: CompressionConfig,
}

/// Remote retention windows expressed as counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub keep_hourly_hours: u32,
    pub keep_daily_days: u32,
    pub keep_weekly_weeks: u32,
    pub keep_monthly_months: u32,
    pub keep_yearly: bool,
}

/// How many artifacts stay on local disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalRetentionConfig {
    pub max_backups: usize,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            directory: "/backups".into(),
            prefix: "backup".to_string(),
            extension: "sql".to_string(),
            compression: CompressionConfig::default(),
        }
    }
}

impl ArtifactConfig {
    pub fn naming(&self) -> Result<ArtifactNaming> {
        ArtifactNaming::new(
            self.prefix.clone(),
            format!("{}{}", self.extension, self.compression.default_type.extension()),
        )
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_hourly_hours: 24,
            keep_daily_days: 7,
            keep_weekly_weeks: 4,
            keep_monthly_months: 12,
            keep_yearly: true,
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_counts(
            self.keep_hourly_hours,
            self.keep_daily_days,
            self.keep_weekly_weeks,
            self.keep_monthly_months,
            self.keep_yearly,
        )
    }
}

impl Default for LocalRetentionConfig {
    fn default() -> Self {
        Self { max_backups: 5 }
    }
}

impl BackupRotationConfig {
    /// Load configuration from an optional TOML file, then apply
    /// environment overrides
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path).await?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading configuration from file: {}", path.display());

        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            BackupError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("TOML parse error: {}", e)))
    }

    /// Apply overrides from environment-style variables
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Database configuration
        if let Some(engine) = lookup("BACKUP_DB_ENGINE") {
            self.database.engine = match engine.to_ascii_lowercase().as_str() {
                "mysql" | "mariadb" => DatabaseEngine::Mysql,
                "postgres" | "postgresql" => DatabaseEngine::Postgres,
                other => {
                    return Err(BackupError::Config(format!("Invalid BACKUP_DB_ENGINE: {}", other)))
                }
            };
        }
        if let Some(host) = lookup("MYSQL_HOST") {
            self.database.host = host;
        }
        if let Some(port) = lookup("MYSQL_PORT") {
            self.database.port = Some(parse_var("MYSQL_PORT", &port)?);
        }
        if let Some(user) = lookup("MYSQL_USER") {
            self.database.user = user;
        }
        if let Some(password) = lookup("MYSQL_PASSWORD") {
            self.database.password = Some(SecretString::from(password));
        }
        if let Some(database) = lookup("MYSQL_DATABASE") {
            self.database.database = database;
        }

        // Artifact configuration
        if let Some(directory) = lookup("BACKUP_DIR") {
            self.artifacts.directory = directory.into();
        }
        if let Some(prefix) = lookup("BACKUP_PREFIX") {
            self.artifacts.prefix = prefix;
        }

        // Retention configuration
        if let Some(hours) = lookup("BACKUP_KEEP_HOURLY_HOURS") {
            self.retention.keep_hourly_hours = parse_var("BACKUP_KEEP_HOURLY_HOURS", &hours)?;
        }
        if let Some(days) = lookup("BACKUP_KEEP_DAILY_DAYS") {
            self.retention.keep_daily_days = parse_var("BACKUP_KEEP_DAILY_DAYS", &days)?;
        }
        if let Some(weeks) = lookup("BACKUP_KEEP_WEEKLY_WEEKS") {
            self.retention.keep_weekly_weeks = parse_var("BACKUP_KEEP_WEEKLY_WEEKS", &weeks)?;
        }
        if let Some(months) = lookup("BACKUP_KEEP_MONTHLY_MONTHS") {
            self.retention.keep_monthly_months = parse_var("BACKUP_KEEP_MONTHLY_MONTHS", &months)?;
        }
        if let Some(yearly) = lookup("BACKUP_KEEP_YEARLY") {
            self.retention.keep_yearly = parse_flag(&yearly);
        }

        // Encryption is switched on by a non-empty key
        if let Some(key) = lookup("BACKUP_ENCRYPTION_KEY").filter(|key| !key.is_empty()) {
            self.encryption.enabled = true;
            self.encryption.passphrase = Some(SecretString::from(key));
        }

        // Storage configuration
        if let Some(backend) = lookup("BACKUP_STORAGE_BACKEND") {
            self.storage.backend_type = match backend.to_ascii_lowercase().as_str() {
                "local" => StorageBackendType::Local,
                "s3" => StorageBackendType::S3,
                other => {
                    return Err(BackupError::Config(format!(
                        "Invalid BACKUP_STORAGE_BACKEND: {}",
                        other
                    )))
                }
            };
        }
        if let Some(folder) = lookup("BACKUP_REMOTE_FOLDER") {
            self.storage.folder = folder;
        }
        if let Some(path) = lookup("BACKUP_STORAGE_PATH") {
            self.storage.local = Some(LocalStorageConfig {
                path: path.into(),
                create_directories: true,
            });
        }
        if let Some(bucket) = lookup("BACKUP_S3_BUCKET") {
            self.storage.s3.get_or_insert_with(S3StorageConfig::default).bucket = bucket;
        }
        if let Some(region) = lookup("BACKUP_S3_REGION") {
            self.storage.s3.get_or_insert_with(S3StorageConfig::default).region = Some(region);
        }
        if let Some(endpoint) = lookup("BACKUP_S3_ENDPOINT") {
            let s3 = self.storage.s3.get_or_insert_with(S3StorageConfig::default);
            s3.endpoint = Some(endpoint);
            s3.force_path_style = true;
        }

        // Local retention and scheduling
        if let Some(max) = lookup("BACKUP_MAX_LOCAL") {
            self.local.max_backups = parse_var("BACKUP_MAX_LOCAL", &max)?;
        }
        if let Some(cron) = lookup("BACKUP_SCHEDULE").filter(|cron| !cron.trim().is_empty()) {
            self.schedule.cron = Some(cron);
        }

        debug!("Applied environment overrides");
        Ok(())
    }

    /// Check the configuration for a full pipeline run
    pub fn validate(&self) -> Result<()> {
        if self.database.database.trim().is_empty() {
            return Err(BackupError::Config("No database name configured".to_string()));
        }
        if self.local.max_backups == 0 {
            return Err(BackupError::Config(
                "Local retention must keep at least one backup".to_string(),
            ));
        }
        self.validate_rotation()?;
        PassphraseEncryptor::from_config(&self.encryption)?;
        Ok(())
    }

    /// Check only what remote rotation needs
    pub fn validate_rotation(&self) -> Result<()> {
        self.artifacts.naming()?;
        self.retention.policy().validate()?;
        self.storage.validate()
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BackupError::Config(format!("Invalid {}: {}", name, e)))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

/// Serde adapter that never writes secrets back out
pub(crate) mod secret_serde {
    use secrecy::SecretString;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(secret: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match secret {
            Some(_) => serializer.serialize_some("***REDACTED***"),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<String>::deserialize(deserializer)?
            .filter(|s| !s.is_empty())
            .map(SecretString::from))
    }
}
