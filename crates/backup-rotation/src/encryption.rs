/*
 * SPDX-FileCopyrightText: 2024 A3Mailer Project
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

//! Encryption support for backups
//!
//! Artifacts are sealed with an AEAD cipher under a key derived from a
//! passphrase. The plaintext is cut into fixed-size segments sealed with the
//! STREAM construction (`aead::stream`, 32-bit big-endian counter plus a
//! last-segment flag), so neither side holds a whole artifact in memory and
//! truncation at a segment boundary is detected. Layout of an encrypted file:
//!
//! ```text
//! magic (13) | cipher (1) | kdf (1) | cost (4) | memory (4) | lanes (4) | segment (4) | salt (16) | nonce (7) | segments
//! ```
//!
//! Every segment but the last holds exactly `segment` plaintext bytes plus a
//! 16 byte tag. All integers are big-endian. The KDF parameters travel with
//! the file so old artifacts stay readable after the configuration changes.

use crate::{
    config::secret_serde,
    error::{BackupError, Result},
    record::ENCRYPTED_EXTENSION,
};
use aes_gcm::{
    aead::{
        self,
        generic_array::GenericArray,
        stream::{DecryptorBE32, EncryptorBE32},
        KeyInit,
    },
    Aes256Gcm,
};
use async_trait::async_trait;
use chacha20poly1305::ChaCha20Poly1305;
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::{
    fs::File,
    io::{BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};
use tracing::info;

/// Magic bytes identifying an encrypted artifact
pub const MAGIC_HEADER: &[u8] = b"DBROT_ENC_V1\0";

/// Lowest PBKDF2 iteration count accepted
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// Plaintext bytes per sealed segment
pub const DEFAULT_SEGMENT_SIZE: u32 = 64 * 1024;

/// Largest segment accepted, bounds the buffers a header can request
pub const MAX_SEGMENT_SIZE: u32 = 16 * 1024 * 1024;

const SALT_SIZE: usize = 16;
/// 12 byte AEAD nonce minus the 5 bytes STREAM uses for counter and flag
const STREAM_NONCE_SIZE: usize = 7;
const KEY_SIZE: usize = 32;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = MAGIC_HEADER.len() + 2 + 16 + SALT_SIZE + STREAM_NONCE_SIZE;

/// Encryption configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub default_type: EncryptionType,
    pub key_derivation: KeyDerivationConfig,
    #[serde(with = "secret_serde")]
    pub passphrase: Option<SecretString>,
}

/// Supported encryption types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionType {
    Aes256Gcm,
    ChaCha20Poly1305,
}

/// Key derivation configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyDerivationConfig {
    pub algorithm: KeyDerivationAlgorithm,
    /// PBKDF2 rounds
    pub iterations: u32,
    /// Argon2 passes
    pub time_cost: u32,
    /// Argon2 memory in KiB
    pub memory_cost: u32,
    pub parallelism: u32,
}

/// Key derivation algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDerivationAlgorithm {
    Pbkdf2Sha256,
    Argon2id,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            default_type: EncryptionType::Aes256Gcm,
            key_derivation: KeyDerivationConfig::default(),
            passphrase: None,
        }
    }
}

impl Default for KeyDerivationConfig {
    fn default() -> Self {
        Self {
            algorithm: KeyDerivationAlgorithm::Pbkdf2Sha256,
            iterations: MIN_PBKDF2_ITERATIONS,
            time_cost: 3,
            memory_cost: 65536, // 64 MB
            parallelism: 4,
        }
    }
}

impl EncryptionType {
    fn id(&self) -> u8 {
        match self {
            EncryptionType::Aes256Gcm => 1,
            EncryptionType::ChaCha20Poly1305 => 2,
        }
    }

    fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(EncryptionType::Aes256Gcm),
            2 => Ok(EncryptionType::ChaCha20Poly1305),
            other => Err(BackupError::InvalidFormat(format!("Unknown cipher id {}", other))),
        }
    }
}

/// Seals consecutive plaintext segments
enum SegmentSealer {
    Aes(EncryptorBE32<Aes256Gcm>),
    ChaCha(EncryptorBE32<ChaCha20Poly1305>),
    Finished,
}

impl SegmentSealer {
    fn new(cipher: EncryptionType, key: &[u8; KEY_SIZE], nonce: &[u8; STREAM_NONCE_SIZE]) -> Self {
        let key = GenericArray::from_slice(key);
        match cipher {
            EncryptionType::Aes256Gcm => SegmentSealer::Aes(EncryptorBE32::from_aead(
                Aes256Gcm::new(key),
                GenericArray::from_slice(nonce),
            )),
            EncryptionType::ChaCha20Poly1305 => SegmentSealer::ChaCha(EncryptorBE32::from_aead(
                ChaCha20Poly1305::new(key),
                GenericArray::from_slice(nonce),
            )),
        }
    }

    fn seal(&mut self, segment: &[u8], last: bool) -> Result<Vec<u8>> {
        let sealed = if last {
            match std::mem::replace(self, SegmentSealer::Finished) {
                SegmentSealer::Aes(stream) => stream.encrypt_last(segment),
                SegmentSealer::ChaCha(stream) => stream.encrypt_last(segment),
                SegmentSealer::Finished => Err(aead::Error),
            }
        } else {
            match self {
                SegmentSealer::Aes(stream) => stream.encrypt_next(segment),
                SegmentSealer::ChaCha(stream) => stream.encrypt_next(segment),
                SegmentSealer::Finished => Err(aead::Error),
            }
        };
        sealed.map_err(|_| BackupError::Encryption("Cipher rejected plaintext".to_string()))
    }
}

/// Opens consecutive sealed segments
enum SegmentOpener {
    Aes(DecryptorBE32<Aes256Gcm>),
    ChaCha(DecryptorBE32<ChaCha20Poly1305>),
    Finished,
}

impl SegmentOpener {
    fn new(cipher: EncryptionType, key: &[u8; KEY_SIZE], nonce: &[u8; STREAM_NONCE_SIZE]) -> Self {
        let key = GenericArray::from_slice(key);
        match cipher {
            EncryptionType::Aes256Gcm => SegmentOpener::Aes(DecryptorBE32::from_aead(
                Aes256Gcm::new(key),
                GenericArray::from_slice(nonce),
            )),
            EncryptionType::ChaCha20Poly1305 => SegmentOpener::ChaCha(DecryptorBE32::from_aead(
                ChaCha20Poly1305::new(key),
                GenericArray::from_slice(nonce),
            )),
        }
    }

    fn open(&mut self, segment: &[u8], last: bool) -> Result<Vec<u8>> {
        let opened = if last {
            match std::mem::replace(self, SegmentOpener::Finished) {
                SegmentOpener::Aes(stream) => stream.decrypt_last(segment),
                SegmentOpener::ChaCha(stream) => stream.decrypt_last(segment),
                SegmentOpener::Finished => Err(aead::Error),
            }
        } else {
            match self {
                SegmentOpener::Aes(stream) => stream.decrypt_next(segment),
                SegmentOpener::ChaCha(stream) => stream.decrypt_next(segment),
                SegmentOpener::Finished => Err(aead::Error),
            }
        };
        opened.map_err(|_| {
            BackupError::Encryption("Wrong passphrase or corrupted artifact".to_string())
        })
    }
}

impl KeyDerivationAlgorithm {
    fn id(&self) -> u8 {
        match self {
            KeyDerivationAlgorithm::Pbkdf2Sha256 => 1,
            KeyDerivationAlgorithm::Argon2id => 2,
        }
    }

    fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(KeyDerivationAlgorithm::Pbkdf2Sha256),
            2 => Ok(KeyDerivationAlgorithm::Argon2id),
            other => Err(BackupError::InvalidFormat(format!("Unknown KDF id {}", other))),
        }
    }
}

impl KeyDerivationConfig {
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            KeyDerivationAlgorithm::Pbkdf2Sha256 if self.iterations < MIN_PBKDF2_ITERATIONS => {
                Err(BackupError::Config(format!(
                    "PBKDF2 needs at least {} iterations, got {}",
                    MIN_PBKDF2_ITERATIONS, self.iterations
                )))
            }
            KeyDerivationAlgorithm::Argon2id if self.time_cost == 0 || self.parallelism == 0 => {
                Err(BackupError::Config(
                    "Argon2 time cost and parallelism must be positive".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn cost(&self) -> u32 {
        match self.algorithm {
            KeyDerivationAlgorithm::Pbkdf2Sha256 => self.iterations,
            KeyDerivationAlgorithm::Argon2id => self.time_cost,
        }
    }

    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<[u8; KEY_SIZE]> {
        let mut key = [0u8; KEY_SIZE];
        match self.algorithm {
            KeyDerivationAlgorithm::Pbkdf2Sha256 => {
                pbkdf2::pbkdf2_hmac::<Sha256>(passphrase, salt, self.iterations, &mut key);
            }
            KeyDerivationAlgorithm::Argon2id => {
                let params = argon2::Params::new(
                    self.memory_cost,
                    self.time_cost,
                    self.parallelism,
                    Some(KEY_SIZE),
                )
                .map_err(|e| BackupError::Encryption(format!("Invalid Argon2 parameters: {}", e)))?;
                argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params)
                    .hash_password_into(passphrase, salt, &mut key)
                    .map_err(|e| BackupError::Encryption(format!("Key derivation failed: {}", e)))?;
            }
        }
        Ok(key)
    }
}

/// Turns a local artifact into an encrypted sibling file
#[async_trait]
pub trait ArtifactEncryptor: Send + Sync + std::fmt::Debug {
    /// Encrypt `source` into a new file and return its path. `source` is
    /// left untouched whether or not encryption succeeds.
    async fn encrypt(&self, source: &Path) -> Result<PathBuf>;
}

/// Passphrase-based artifact encryptor
#[derive(Debug, Clone)]
pub struct PassphraseEncryptor {
    cipher: EncryptionType,
    kdf: KeyDerivationConfig,
    passphrase: SecretString,
    segment_size: u32,
}

impl PassphraseEncryptor {
    pub fn new(cipher: EncryptionType, kdf: KeyDerivationConfig, passphrase: SecretString) -> Result<Self> {
        kdf.validate()?;
        if passphrase.expose_secret().is_empty() {
            return Err(BackupError::Config("Encryption passphrase is empty".to_string()));
        }
        Ok(Self {
            cipher,
            kdf,
            passphrase,
            segment_size: DEFAULT_SEGMENT_SIZE,
        })
    }

    /// Build an encryptor if encryption is enabled
    pub fn from_config(config: &EncryptionConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let passphrase = config.passphrase.clone().ok_or_else(|| {
            BackupError::Config("Encryption enabled but no passphrase configured".to_string())
        })?;
        Self::new(config.default_type, config.key_derivation, passphrase).map(Some)
    }

    /// Override the plaintext bytes sealed per segment
    pub fn with_segment_size(mut self, segment_size: u32) -> Result<Self> {
        check_segment_size(segment_size)?;
        self.segment_size = segment_size;
        Ok(self)
    }

    fn seal_file(&self, source: &Path, target: &Path) -> Result<()> {
        let mut salt = [0u8; SALT_SIZE];
        let mut nonce = [0u8; STREAM_NONCE_SIZE];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let key = self.kdf.derive(self.passphrase.expose_secret().as_bytes(), &salt)?;
        let header = Header {
            cipher: self.cipher,
            kdf: self.kdf,
            segment_size: self.segment_size,
            salt,
            nonce,
        };
        let mut sealer = SegmentSealer::new(self.cipher, &key, &nonce);
        let mut reader = BufReader::new(File::open(source)?);

        write_atomically(target, |writer| {
            header.write_to(writer)?;
            for_each_segment(&mut reader, self.segment_size as usize, |segment, last| {
                writer.write_all(&sealer.seal(segment, last)?)?;
                Ok(())
            })
        })
    }
}

#[async_trait]
impl ArtifactEncryptor for PassphraseEncryptor {
    async fn encrypt(&self, source: &Path) -> Result<PathBuf> {
        let mut target = source.as_os_str().to_owned();
        target.push(".");
        target.push(ENCRYPTED_EXTENSION);
        let target = PathBuf::from(target);

        let encryptor = self.clone();
        let (source_path, target_path) = (source.to_path_buf(), target.clone());
        tokio::task::spawn_blocking(move || encryptor.seal_file(&source_path, &target_path))
            .await
            .map_err(|e| BackupError::Encryption(format!("Encryption task failed: {}", e)))??;

        let written = tokio::fs::metadata(&target).await.map_err(|e| {
            BackupError::Encryption(format!("Encrypted file missing after write: {}", e))
        })?;
        info!(
            path = %target.display(),
            bytes = written.len(),
            segment_size = self.segment_size,
            "Artifact encrypted"
        );
        Ok(target)
    }
}

/// Decrypt an artifact produced by [`PassphraseEncryptor`] into `dest`,
/// returning the plaintext size. `dest` only appears once every segment
/// has been authenticated.
pub async fn decrypt_file(source: &Path, dest: &Path, passphrase: &SecretString) -> Result<u64> {
    let (source, dest) = (source.to_path_buf(), dest.to_path_buf());
    let passphrase = passphrase.clone();

    tokio::task::spawn_blocking(move || {
        open_file(&source, &dest, passphrase.expose_secret().as_bytes())
    })
    .await
    .map_err(|e| BackupError::Encryption(format!("Decryption task failed: {}", e)))?
}

fn open_file(source: &Path, dest: &Path, passphrase: &[u8]) -> Result<u64> {
    let mut reader = BufReader::new(File::open(source)?);
    let header = Header::read_from(&mut reader)?;
    let key = header.kdf.derive(passphrase, &header.salt)?;
    let mut opener = SegmentOpener::new(header.cipher, &key, &header.nonce);

    let mut written = 0u64;
    let sealed_segment = header.segment_size as usize + TAG_SIZE;
    write_atomically(dest, |writer| {
        for_each_segment(&mut reader, sealed_segment, |segment, last| {
            let plaintext = opener.open(segment, last)?;
            writer.write_all(&plaintext)?;
            written += plaintext.len() as u64;
            Ok(())
        })
    })?;
    Ok(written)
}

/// Fixed-size file header
#[derive(Debug)]
struct Header {
    cipher: EncryptionType,
    kdf: KeyDerivationConfig,
    segment_size: u32,
    salt: [u8; SALT_SIZE],
    nonce: [u8; STREAM_NONCE_SIZE],
}

impl Header {
    fn write_to(&self, writer: &mut dyn Write) -> Result<()> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        bytes.extend_from_slice(MAGIC_HEADER);
        bytes.push(self.cipher.id());
        bytes.push(self.kdf.algorithm.id());
        bytes.extend_from_slice(&self.kdf.cost().to_be_bytes());
        bytes.extend_from_slice(&self.kdf.memory_cost.to_be_bytes());
        bytes.extend_from_slice(&self.kdf.parallelism.to_be_bytes());
        bytes.extend_from_slice(&self.segment_size.to_be_bytes());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.nonce);
        writer.write_all(&bytes)?;
        Ok(())
    }

    fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut bytes = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(not_encrypted());
            }
            Err(e) => return Err(e.into()),
        }
        if !bytes.starts_with(MAGIC_HEADER) {
            return Err(not_encrypted());
        }

        let mut offset = MAGIC_HEADER.len();
        let cipher = EncryptionType::from_id(bytes[offset])?;
        let algorithm = KeyDerivationAlgorithm::from_id(bytes[offset + 1])?;
        offset += 2;

        let mut read_u32 = |offset: &mut usize| {
            let mut word = [0u8; 4];
            word.copy_from_slice(&bytes[*offset..*offset + 4]);
            *offset += 4;
            u32::from_be_bytes(word)
        };
        let cost = read_u32(&mut offset);
        let memory_cost = read_u32(&mut offset);
        let parallelism = read_u32(&mut offset);
        let segment_size = read_u32(&mut offset);
        check_segment_size(segment_size).map_err(|_| {
            BackupError::InvalidFormat(format!("Invalid segment size {}", segment_size))
        })?;

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[offset..offset + SALT_SIZE]);
        offset += SALT_SIZE;
        let mut nonce = [0u8; STREAM_NONCE_SIZE];
        nonce.copy_from_slice(&bytes[offset..offset + STREAM_NONCE_SIZE]);

        Ok(Self {
            cipher,
            kdf: KeyDerivationConfig {
                algorithm,
                iterations: cost,
                time_cost: cost,
                memory_cost,
                parallelism,
            },
            segment_size,
            salt,
            nonce,
        })
    }
}

fn not_encrypted() -> BackupError {
    BackupError::InvalidFormat("Not an encrypted backup artifact".to_string())
}

fn check_segment_size(segment_size: u32) -> Result<()> {
    if segment_size == 0 || segment_size > MAX_SEGMENT_SIZE {
        return Err(BackupError::Config(format!(
            "Segment size must be between 1 and {} bytes, got {}",
            MAX_SEGMENT_SIZE, segment_size
        )));
    }
    Ok(())
}

/// Fill `buf` from `reader`, stopping early only at end of input
fn read_segment(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Hand `reader` to `process` in `size` byte pieces. The final piece is
/// flagged, and is empty only when the whole input is.
fn for_each_segment(
    reader: &mut impl Read,
    size: usize,
    mut process: impl FnMut(&[u8], bool) -> Result<()>,
) -> Result<()> {
    let mut current = vec![0u8; size];
    let mut next = vec![0u8; size];
    let mut len = read_segment(reader, &mut current)?;
    loop {
        let next_len = if len == size {
            read_segment(reader, &mut next)?
        } else {
            0
        };
        if next_len == 0 {
            return process(&current[..len], true);
        }
        process(&current[..len], false)?;
        std::mem::swap(&mut current, &mut next);
        len = next_len;
    }
}

/// Write `target` through a synced temporary file in the same directory
fn write_atomically(
    target: &Path,
    fill: impl FnOnce(&mut dyn Write) -> Result<()>,
) -> Result<()> {
    let dir = target
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(&mut file);
        fill(&mut writer)?;
        writer.flush()?;
    }
    file.as_file().sync_all()?;
    file.persist(target).map_err(|e| BackupError::Io(e.error))?;
    Ok(())
}
