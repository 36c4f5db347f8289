/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Compression support for backups

use crate::error::{BackupError, Result};
use flate2::{write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tokio::{sync::mpsc, task::JoinHandle};

/// Compression configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub default_type: CompressionType,
    pub level: CompressionLevel,
}

/// Supported compression types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Gzip,
    Zstd,
}

/// Compression level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    Fast,
    Balanced,
    Best,
    Custom(i32),
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            default_type: CompressionType::Gzip,
            level: CompressionLevel::Balanced,
        }
    }
}

impl CompressionType {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "",
            CompressionType::Gzip => ".gz",
            CompressionType::Zstd => ".zst",
        }
    }
}

impl CompressionLevel {
    pub fn to_level(&self, compression_type: CompressionType) -> i32 {
        match (self, compression_type) {
            (CompressionLevel::Fast, CompressionType::Gzip) => 1,
            (CompressionLevel::Balanced, CompressionType::Gzip) => 6,
            (CompressionLevel::Best, CompressionType::Gzip) => 9,
            (CompressionLevel::Fast, CompressionType::Zstd) => 1,
            (CompressionLevel::Balanced, CompressionType::Zstd) => 3,
            (CompressionLevel::Best, CompressionType::Zstd) => 19,
            (CompressionLevel::Custom(level), _) => *level,
            (_, CompressionType::None) => 0,
        }
    }
}

enum Encoder {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
}

/// Blocking writer that compresses everything written to it into a file
pub struct CompressingSink {
    encoder: Encoder,
    bytes_in: u64,
}

impl CompressingSink {
    pub fn create(path: &Path, config: &CompressionConfig) -> Result<Self> {
        let file = BufWriter::new(File::create(path)?);
        let level = config.level.to_level(config.default_type);

        let encoder = match config.default_type {
            CompressionType::None => Encoder::Plain(file),
            CompressionType::Gzip => Encoder::Gzip(GzEncoder::new(
                file,
                Compression::new(level.clamp(0, 9) as u32),
            )),
            CompressionType::Zstd => Encoder::Zstd(
                zstd::stream::write::Encoder::new(file, level)
                    .map_err(|e| BackupError::Compression(e.to_string()))?,
            ),
        };

        Ok(Self {
            encoder,
            bytes_in: 0,
        })
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let written = match &mut self.encoder {
            Encoder::Plain(w) => w.write_all(chunk),
            Encoder::Gzip(w) => w.write_all(chunk),
            Encoder::Zstd(w) => w.write_all(chunk),
        };
        written.map_err(|e| BackupError::Compression(e.to_string()))?;
        self.bytes_in += chunk.len() as u64;
        Ok(())
    }

    /// Flush the compressor trailer and sync the file. Returns the number of
    /// uncompressed bytes consumed.
    pub fn finish(self) -> Result<u64> {
        let buffered = match self.encoder {
            Encoder::Plain(w) => Ok(w),
            Encoder::Gzip(w) => w.finish(),
            Encoder::Zstd(w) => w.finish(),
        }
        .map_err(|e| BackupError::Compression(e.to_string()))?;

        let file = buffered
            .into_inner()
            .map_err(|e| BackupError::Compression(e.into_error().to_string()))?;
        file.sync_all()?;
        Ok(self.bytes_in)
    }
}

/// Drain `chunks` into a compressed file on a blocking thread.
///
/// The task ends when the sender side is dropped. The returned handle yields
/// the number of uncompressed bytes written.
pub fn spawn_compressor(
    path: PathBuf,
    config: CompressionConfig,
    mut chunks: mpsc::Receiver<Vec<u8>>,
) -> JoinHandle<Result<u64>> {
    tokio::task::spawn_blocking(move || {
        let mut sink = CompressingSink::create(&path, &config)?;
        while let Some(chunk) = chunks.blocking_recv() {
            sink.write_chunk(&chunk)?;
        }
        sink.finish()
    })
}
