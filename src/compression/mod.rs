// src/compression/mod.rs
//! Unified compression/decompression utilities
//!
//! Provides a consistent interface for the compression formats an archive
//! payload may use (none, gzip, zstd, xz). Decoding never needs to be told
//! the format: it is detected from the payload's magic bytes.

use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use std::str::FromStr;
use thiserror::Error;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to create {format} codec: {source}")]
    CodecCreation {
        format: &'static str,
        source: io::Error,
    },

    #[error("Unsupported compression format: {0}")]
    UnsupportedFormat(String),
}

/// Supported compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    /// No compression (plain tar)
    None,
    /// Gzip compression (.gz)
    #[default]
    Gzip,
    /// Zstandard compression (.zst)
    Zstd,
    /// XZ/LZMA compression (.xz)
    Xz,
}

impl CompressionFormat {
    /// Detect compression format from magic bytes
    ///
    /// Magic bytes:
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00` (FD + "7zXZ" + NUL)
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
            Self::Gzip
        } else if data.len() >= 6 && data[..6] == [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00] {
            Self::Xz
        } else if data.len() >= 4 && data[..4] == [0x28, 0xb5, 0x2f, 0xfd] {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Archive file extension for this format
    pub fn archive_extension(&self) -> &'static str {
        match self {
            Self::None => "tar",
            Self::Gzip => "tar.gz",
            Self::Zstd => "tar.zst",
            Self::Xz => "tar.xz",
        }
    }

    /// Get a human-readable name for this format
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
            Self::Xz => "xz",
        }
    }

    /// Default level for this format
    pub fn default_level(&self) -> i32 {
        match self {
            Self::None => 0,
            Self::Gzip | Self::Xz => 6,
            Self::Zstd => 3,
        }
    }

    fn clamp_level(&self, level: i32) -> i32 {
        match self {
            Self::None => 0,
            Self::Gzip | Self::Xz => level.clamp(0, 9),
            Self::Zstd => level.clamp(1, 22),
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CompressionFormat {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "store" | "" => Ok(Self::None),
            "gzip" | "gz" => Ok(Self::Gzip),
            "zstd" | "zst" => Ok(Self::Zstd),
            "xz" | "lzma" => Ok(Self::Xz),
            other => Err(CompressionError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// A compressing writer for one of the supported formats
///
/// Must be closed with [`Encoder::finish`] so the trailer gets written.
pub enum Encoder<W: Write> {
    None(W),
    Gzip(flate2::write::GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Xz(xz2::write::XzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    /// Finish the stream and return the underlying writer
    pub fn finish(self) -> io::Result<W> {
        match self {
            Self::None(w) => Ok(w),
            Self::Gzip(e) => e.finish(),
            Self::Zstd(e) => e.finish(),
            Self::Xz(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::None(w) => w.write(buf),
            Self::Gzip(e) => e.write(buf),
            Self::Zstd(e) => e.write(buf),
            Self::Xz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::None(w) => w.flush(),
            Self::Gzip(e) => e.flush(),
            Self::Zstd(e) => e.flush(),
            Self::Xz(e) => e.flush(),
        }
    }
}

/// Create a compressing writer
///
/// The gzip header is written without mtime or filename so identical
/// input always produces identical bytes.
pub fn create_encoder<W: Write>(
    writer: W,
    format: CompressionFormat,
    level: i32,
) -> Result<Encoder<W>, CompressionError> {
    let level = format.clamp_level(level);
    match format {
        CompressionFormat::None => Ok(Encoder::None(writer)),
        CompressionFormat::Gzip => Ok(Encoder::Gzip(flate2::write::GzEncoder::new(
            writer,
            flate2::Compression::new(level as u32),
        ))),
        CompressionFormat::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(writer, level).map_err(|e| {
                CompressionError::CodecCreation {
                    format: "zstd",
                    source: e,
                }
            })?;
            Ok(Encoder::Zstd(encoder))
        }
        CompressionFormat::Xz => Ok(Encoder::Xz(xz2::write::XzEncoder::new(
            writer,
            level as u32,
        ))),
    }
}

/// Create a decompressing reader for the given format
///
/// For `CompressionFormat::None`, returns the reader unchanged.
pub fn create_decoder<'a, R: Read + 'a>(
    reader: R,
    format: CompressionFormat,
) -> Result<Box<dyn Read + 'a>, CompressionError> {
    match format {
        CompressionFormat::None => Ok(Box::new(reader)),
        CompressionFormat::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        CompressionFormat::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        CompressionFormat::Zstd => {
            let decoder = zstd::Decoder::new(reader).map_err(|e| CompressionError::CodecCreation {
                format: "zstd",
                source: e,
            })?;
            Ok(Box::new(decoder))
        }
    }
}

/// Create a decompressing reader, detecting the format from the stream
///
/// Reads up to six bytes to identify the format, then replays them in
/// front of the rest of the stream. Returns the detected format as well.
pub fn create_decoder_auto<'a, R: Read + 'a>(
    mut reader: R,
) -> Result<(CompressionFormat, Box<dyn Read + 'a>), crate::Error> {
    let mut head = [0u8; 6];
    let mut filled = 0;
    while filled < head.len() {
        match reader.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let format = CompressionFormat::from_magic_bytes(&head[..filled]);
    let replay = io::Cursor::new(head[..filled].to_vec()).chain(reader);
    Ok((format, create_decoder(replay, format)?))
}
