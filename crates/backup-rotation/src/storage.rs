/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Storage gateway abstraction for remote backup artifacts

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

/// An object as reported by a remote listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
}

/// Remote store holding uploaded artifacts.
///
/// Credentials are resolved by each backend; callers only deal in names,
/// folders and opaque ids. `delete` of an id that no longer exists succeeds.
#[async_trait]
pub trait StorageGateway: Send + Sync + std::fmt::Debug {
    /// Upload the file at `source` as `name` inside `folder`, returning its id
    async fn upload(&self, name: &str, source: &Path, folder: &str) -> Result<String>;

    /// List objects directly inside `folder` whose names start with `prefix`
    async fn list(&self, folder: &str, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// Delete an object by id
    async fn delete(&self, id: &str) -> Result<()>;

    fn backend_name(&self) -> &'static str;
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend_type: StorageBackendType,
    /// Remote folder the artifacts live in
    pub folder: String,
    pub local: Option<LocalStorageConfig>,
    pub s3: Option<S3StorageConfig>,
}

/// Type of storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    Local,
    S3,
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub create_directories: bool,
}

/// S3 storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct S3StorageConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

fn default_true() -> bool {
    true
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend_type: StorageBackendType::Local,
            folder: "backups".to_string(),
            local: Some(LocalStorageConfig {
                path: "/var/lib/backup-rotation/remote".into(),
                create_directories: true,
            }),
            s3: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<()> {
        match self.backend_type {
            StorageBackendType::Local if self.local.is_none() => Err(BackupError::Config(
                "Missing local storage config".to_string(),
            )),
            StorageBackendType::S3 => match &self.s3 {
                Some(s3) if !s3.bucket.is_empty() => Ok(()),
                _ => Err(BackupError::Config("Missing S3 bucket".to_string())),
            },
            _ => Ok(()),
        }
    }
}

/// Create a storage gateway from configuration
pub async fn create_gateway(config: &StorageConfig) -> Result<Arc<dyn StorageGateway>> {
    match config.backend_type {
        StorageBackendType::Local => {
            let local_config = config
                .local
                .as_ref()
                .ok_or_else(|| BackupError::Config("Missing local storage config".to_string()))?;
            Ok(Arc::new(LocalStorageBackend::new(local_config).await?))
        }
        StorageBackendType::S3 => {
            #[cfg(feature = "aws-s3")]
            {
                let s3_config = config
                    .s3
                    .as_ref()
                    .ok_or_else(|| BackupError::Config("Missing S3 storage config".to_string()))?;
                Ok(Arc::new(S3StorageBackend::new(s3_config).await?))
            }
            #[cfg(not(feature = "aws-s3"))]
            {
                Err(BackupError::Config("S3 support not enabled".to_string()))
            }
        }
    }
}

/// Local filesystem storage backend.
///
/// Folders are subdirectories of the configured root and ids are paths
/// relative to that root.
#[derive(Debug)]
pub struct LocalStorageBackend {
    config: LocalStorageConfig,
}

impl LocalStorageBackend {
    pub async fn new(config: &LocalStorageConfig) -> Result<Self> {
        if config.create_directories {
            tokio::fs::create_dir_all(&config.path).await?;
        }

        Ok(Self {
            config: config.clone(),
        })
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BackupError::Storage(format!(
                "Refusing path outside storage root: {}",
                relative.display()
            )));
        }
        Ok(self.config.path.join(relative))
    }
}

fn object_id(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", folder, name)
    }
}

#[async_trait]
impl StorageGateway for LocalStorageBackend {
    async fn upload(&self, name: &str, source: &Path, folder: &str) -> Result<String> {
        let id = object_id(folder, name);
        let target = self.resolve(&id)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Copy under a temporary name so listings never see a partial file.
        let partial = target.with_file_name(format!(".{}.partial", name));
        tokio::fs::copy(source, &partial)
            .await
            .map_err(|e| BackupError::Upload(format!("{}: {}", source.display(), e)))?;
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|e| BackupError::Upload(format!("{}: {}", target.display(), e)))?;

        info!(id = %id, "Stored artifact in local storage");
        Ok(id)
    }

    async fn list(&self, folder: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        let dir = self.resolve(folder.trim_matches('/'))?;
        let mut objects = Vec::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(objects),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }

            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .ok()
                .map(DateTime::<Utc>::from);

            objects.push(RemoteObject {
                id: object_id(folder, &name),
                name,
                created,
                size_bytes: Some(metadata.len()),
            });
        }

        debug!(folder, prefix, count = objects.len(), "Listed local storage");
        Ok(objects)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let path = self.resolve(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BackupError::Delete {
                id: id.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    fn backend_name(&self) -> &'static str {
        "local"
    }
}

/// Amazon S3 (or compatible) storage backend.
///
/// Folders are key prefixes and ids are full object keys.
#[cfg(feature = "aws-s3")]
#[derive(Debug)]
pub struct S3StorageBackend {
    config: S3StorageConfig,
    client: aws_sdk_s3::Client,
}

#[cfg(feature = "aws-s3")]
impl S3StorageBackend {
    pub async fn new(config: &S3StorageConfig) -> Result<Self> {
        info!(bucket = %config.bucket, "Initializing S3 storage");

        let mut sdk_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            sdk_config_builder = sdk_config_builder.region(aws_config::Region::new(region.clone()));
        }
        let sdk_config = sdk_config_builder.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            config: config.clone(),
            client: aws_sdk_s3::Client::from_conf(s3_config_builder.build()),
        })
    }
}

#[cfg(feature = "aws-s3")]
#[async_trait]
impl StorageGateway for S3StorageBackend {
    async fn upload(&self, name: &str, source: &Path, folder: &str) -> Result<String> {
        let key = object_id(folder, name);
        let body = aws_sdk_s3::primitives::ByteStream::from_path(source)
            .await
            .map_err(|e| BackupError::Upload(format!("{}: {}", source.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| BackupError::Upload(e.to_string()))?;

        info!(key = %key, bucket = %self.config.bucket, "Uploaded artifact to S3");
        Ok(key)
    }

    async fn list(&self, folder: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        let folder_prefix = object_id(folder, "");
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.config.bucket)
            .prefix(format!("{}{}", folder_prefix, prefix))
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| BackupError::Storage(e.to_string()))?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let name = key.strip_prefix(folder_prefix.as_str()).unwrap_or(key);
                if name.contains('/') {
                    continue;
                }

                objects.push(RemoteObject {
                    id: key.to_string(),
                    name: name.to_string(),
                    created: object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
                    size_bytes: object.size().and_then(|size| u64::try_from(size).ok()),
                });
            }
        }

        debug!(folder, prefix, count = objects.len(), "Listed S3 objects");
        Ok(objects)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(id)
            .send()
            .await
            .map_err(|e| BackupError::Delete {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend(root: &Path) -> LocalStorageBackend {
        LocalStorageBackend::new(&LocalStorageConfig {
            path: root.to_path_buf(),
            create_directories: true,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_local_upload_list_delete() {
        let remote = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let source = work.path().join("db_20240101_000000.sql.gz");
        tokio::fs::write(&source, b"dump").await.unwrap();

        let storage = backend(remote.path()).await;
        let id = storage
            .upload("db_20240101_000000.sql.gz", &source, "nightly")
            .await
            .unwrap();
        assert_eq!(id, "nightly/db_20240101_000000.sql.gz");

        tokio::fs::write(remote.path().join("nightly/notes.txt"), b"x")
            .await
            .unwrap();

        let listed = storage.list("nightly", "db_").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].size_bytes, Some(4));
        assert!(listed[0].created.is_some());

        storage.delete(&id).await.unwrap();
        assert!(storage.list("nightly", "db_").await.unwrap().is_empty());

        // Deleting again is not an error.
        storage.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_list_missing_folder() {
        let remote = TempDir::new().unwrap();
        let storage = backend(remote.path()).await;
        assert!(storage.list("absent", "db_").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_rejects_traversal() {
        let remote = TempDir::new().unwrap();
        let storage = backend(remote.path()).await;
        assert!(storage.delete("../etc/passwd").await.is_err());
        assert!(storage.delete("/etc/passwd").await.is_err());
    }

    #[test]
    fn test_storage_config_validation() {
        assert!(StorageConfig::default().validate().is_ok());

        let s3 = StorageConfig {
            backend_type: StorageBackendType::S3,
            s3: Some(S3StorageConfig::default()),
            ..StorageConfig::default()
        };
        assert!(s3.validate().is_err());
    }
}
