// src/hash.rs

//! Configurable hashing for file integrity and content addressing
//!
//! This module provides a unified interface for the supported hash algorithms:
//! - **SHA-256**: Cryptographic hash, the default for manifests and archives
//! - **XXH128**: Non-cryptographic hash, much faster for very large payloads
//!
//! Checksums are always carried in prefixed form (`sha256:<hex>`), so a
//! manifest written on one machine can be verified on another without
//! knowing which algorithm the packer was configured with.
//!
//! All hashing is incremental. [`HashingReader`] and [`HashingWriter`] wrap a
//! stream and compute the checksum of the bytes flowing through it, which is
//! how archives are verified without ever being held in memory.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use xxhash_rust::xxh3::Xxh3;

/// Read buffer size used by streaming hash helpers (64 KB)
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256 (256-bit cryptographic hash)
    #[default]
    Sha256,

    /// XXH128 (128-bit non-cryptographic hash)
    ///
    /// Detects corruption but not tampering. Suitable for large model
    /// weights moved over trusted storage.
    Xxh128,
}

impl HashAlgorithm {
    /// Get the hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Xxh128 => 16,
        }
    }

    /// Get the hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Get the algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Xxh128 => "xxh128",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "xxh128" | "xxhash" | "xxh3" => Ok(Self::Xxh128),
            _ => Err(HashError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// Hash parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashError {
    #[error("unknown hash algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("invalid hash length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("invalid hex in hash: {0}")]
    InvalidHex(String),
}

/// A checksum value with its algorithm
///
/// Serializes as the prefixed string form, e.g. `"sha256:2cf24d..."`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum {
    /// The algorithm used
    pub algorithm: HashAlgorithm,
    /// The hash value as a lowercase hex string
    pub value: String,
}

impl Checksum {
    /// Create a checksum from a hex value, validating length and characters
    pub fn new(algorithm: HashAlgorithm, value: impl Into<String>) -> Result<Self, HashError> {
        let value = value.into();
        let expected_len = algorithm.hex_len();

        if value.len() != expected_len {
            return Err(HashError::InvalidLength {
                expected: expected_len,
                got: value.len(),
            });
        }

        if !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(HashError::InvalidHex(value));
        }

        Ok(Self {
            algorithm,
            value: value.to_lowercase(),
        })
    }

    fn new_unchecked(algorithm: HashAlgorithm, value: String) -> Self {
        Self { algorithm, value }
    }

    /// Get the hex digest
    #[inline]
    pub fn as_hex(&self) -> &str {
        &self.value
    }

    /// Parse a prefixed checksum string (`sha256:abc...` or `xxh128:abc...`)
    ///
    /// Unprefixed values are read as SHA-256.
    pub fn parse_prefixed(s: &str) -> Result<Self, HashError> {
        if let Some((algo, hash)) = s.split_once(':') {
            let algorithm = algo.parse()?;
            Self::new(algorithm, hash)
        } else {
            Self::new(HashAlgorithm::Sha256, s)
        }
    }

    /// Format as a prefixed string
    pub fn to_prefixed_string(&self) -> String {
        format!("{}:{}", self.algorithm.name(), self.value)
    }

    /// Start a hasher using this checksum's algorithm
    pub fn hasher(&self) -> Hasher {
        Hasher::new(self.algorithm)
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.name(), self.value)
    }
}

impl FromStr for Checksum {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_prefixed(s)
    }
}

impl TryFrom<String> for Checksum {
    type Error = HashError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse_prefixed(&s)
    }
}

impl From<Checksum> for String {
    fn from(c: Checksum) -> Self {
        c.to_prefixed_string()
    }
}

/// Incremental hasher for any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Sha256(Sha256),
    Xxh128(Box<Xxh3>),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
            HashAlgorithm::Xxh128 => HasherState::Xxh128(Box::new(Xxh3::new())),
        };
        Self { algorithm, state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Sha256(hasher) => hasher.update(data),
            HasherState::Xxh128(hasher) => hasher.update(data),
        }
    }

    /// Finalize and return the checksum
    pub fn finalize(self) -> Checksum {
        let value = match self.state {
            HasherState::Sha256(hasher) => hex::encode(hasher.finalize()),
            HasherState::Xxh128(hasher) => format!("{:032x}", hasher.digest128()),
        };
        Checksum::new_unchecked(self.algorithm, value)
    }

    /// Get the algorithm being used
    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

/// Compute the checksum of a byte slice
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Checksum {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the checksum of everything a reader yields
///
/// Returns the checksum and the number of bytes read.
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, mut reader: R) -> io::Result<(Checksum, u64)> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
        total += n as u64;
    }

    Ok((hasher.finalize(), total))
}

/// Compute the checksum of a file on disk
pub fn hash_file(algorithm: HashAlgorithm, path: &std::path::Path) -> io::Result<(Checksum, u64)> {
    let file = std::fs::File::open(path)?;
    hash_reader(algorithm, io::BufReader::new(file))
}

/// SHA-256 of a byte slice as a prefixed string
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data).to_prefixed_string()
}

/// Reader adapter that hashes bytes as they are read
pub struct HashingReader<R> {
    inner: R,
    hasher: Hasher,
    bytes: u64,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            hasher: Hasher::new(algorithm),
            bytes: 0,
        }
    }

    /// Number of bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Consume the rest of the stream so the checksum covers all of it
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(self, &mut io::sink())
    }

    /// Finish and return the checksum, byte count and inner reader
    pub fn finish(self) -> (Checksum, u64, R) {
        (self.hasher.finalize(), self.bytes, self.inner)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

/// Writer adapter that hashes bytes as they are written
pub struct HashingWriter<W> {
    inner: W,
    hasher: Hasher,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, algorithm: HashAlgorithm) -> Self {
        Self {
            inner,
            hasher: Hasher::new(algorithm),
            bytes: 0,
        }
    }

    /// Number of bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Finish and return the checksum, byte count and inner writer
    pub fn finish(self) -> (Checksum, u64, W) {
        (self.hasher.finalize(), self.bytes, self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        let c = hash_bytes(HashAlgorithm::Sha256, b"hello");
        assert_eq!(
            c.as_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(c.to_prefixed_string(), sha256(b"hello"));
    }

    #[test]
    fn test_xxh128_streaming_matches_one_shot() {
        let data = vec![7u8; 200_000];
        let one_shot = hash_bytes(HashAlgorithm::Xxh128, &data);
        let (streamed, n) = hash_reader(HashAlgorithm::Xxh128, &data[..]).unwrap();
        assert_eq!(one_shot, streamed);
        assert_eq!(n, data.len() as u64);
        assert_eq!(
            format!("{:032x}", xxhash_rust::xxh3::xxh3_128(&data)),
            streamed.value
        );
    }

    #[test]
    fn test_parse_prefixed() {
        let c = Checksum::parse_prefixed(
            "sha256:2CF24DBA5FB0A30E26E83B2AC5B9E29E1B161E5C1FA7425E73043362938B9824",
        )
        .unwrap();
        assert_eq!(c.algorithm, HashAlgorithm::Sha256);
        assert!(c.value.chars().all(|ch| !ch.is_ascii_uppercase()));

        assert!(matches!(
            Checksum::parse_prefixed("md5:abcd"),
            Err(HashError::UnknownAlgorithm(_))
        ));
        assert!(matches!(
            Checksum::parse_prefixed("sha256:abcd"),
            Err(HashError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_serde_prefixed_form() {
        let c = hash_bytes(HashAlgorithm::Xxh128, b"data");
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.starts_with("\"xxh128:"));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_hashing_reader_and_writer_agree() {
        let data = b"some archive bytes".repeat(1000);

        let mut reader = HashingReader::new(&data[..], HashAlgorithm::Sha256);
        let mut out = Vec::new();
        io::copy(&mut reader, &mut out).unwrap();
        let (read_sum, read_len, _) = reader.finish();

        let mut writer = HashingWriter::new(Vec::new(), HashAlgorithm::Sha256);
        writer.write_all(&data).unwrap();
        let (write_sum, write_len, inner) = writer.finish();

        assert_eq!(read_sum, write_sum);
        assert_eq!(read_len, write_len);
        assert_eq!(inner, data);
    }
}
