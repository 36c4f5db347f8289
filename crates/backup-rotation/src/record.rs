/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Backup artifact records and the naming scheme that encodes their timestamps

use crate::{error::{BackupError, Result}, storage::RemoteObject};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Extension appended to encrypted artifacts
pub const ENCRYPTED_EXTENSION: &str = "enc";

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Naming scheme `prefix_YYYYMMDD_HHMMSS.ext[.enc]`.
///
/// The timestamp is always written and read as UTC so that bucket keys do
/// not depend on the time zone of the host running the rotation.
#[derive(Debug, Clone)]
pub struct ArtifactNaming {
    prefix: String,
    extension: String,
    pattern: Regex,
}

impl ArtifactNaming {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Result<Self> {
        let prefix = prefix.into();
        let extension = extension.into().trim_start_matches('.').to_string();

        if prefix.is_empty() {
            return Err(BackupError::Config("Artifact prefix must not be empty".to_string()));
        }

        let pattern = Regex::new(&format!(
            r"^{}_(\d{{8}}_\d{{6}})\.{}(?:\.{})?$",
            regex::escape(&prefix),
            regex::escape(&extension),
            ENCRYPTED_EXTENSION,
        ))
        .map_err(|e| BackupError::Config(format!("Invalid artifact naming: {}", e)))?;

        Ok(Self {
            prefix,
            extension,
            pattern,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Prefix used to filter remote listings
    pub fn list_prefix(&self) -> String {
        format!("{}_", self.prefix)
    }

    /// File name for an artifact created at `at`
    pub fn file_name(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}_{}.{}",
            self.prefix,
            at.format(TIMESTAMP_FORMAT),
            self.extension
        )
    }

    /// Decode the creation instant from an artifact name.
    ///
    /// Returns `None` for anything that does not follow the scheme exactly,
    /// including impossible calendar dates.
    pub fn parse(&self, name: &str) -> Option<DateTime<Utc>> {
        let captures = self.pattern.captures(name)?;
        NaiveDateTime::parse_from_str(captures.get(1)?.as_str(), TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn matches(&self, name: &str) -> bool {
        self.parse(name).is_some()
    }
}

/// One backup artifact as seen in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Opaque handle assigned by the store
    pub id: String,
    pub name: String,
    /// Creation instant decoded from `name`; `None` if the name is foreign
    pub timestamp: Option<DateTime<Utc>>,
    /// Store-reported creation time, advisory only
    pub created: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
}

impl BackupRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            timestamp,
            created: None,
            size_bytes: None,
        }
    }

    pub fn from_remote(object: RemoteObject, naming: &ArtifactNaming) -> Self {
        Self {
            timestamp: naming.parse(&object.name),
            id: object.id,
            name: object.name,
            created: object.created,
            size_bytes: object.size_bytes,
        }
    }
}
