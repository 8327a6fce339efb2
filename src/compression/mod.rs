// src/compression/mod.rs
//! Stream decompression for archives and image layers
//!
//! Archives and OCI layer blobs arrive as plain tar or tar wrapped in gzip,
//! xz or zstd. The format is sniffed from magic bytes, falling back to the
//! file extension.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use thiserror::Error;

/// Compression-related errors
#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("Failed to create {format} decoder: {source}")]
    DecoderCreation {
        format: &'static str,
        source: io::Error,
    },
}

/// Supported compression formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionFormat {
    /// No compression (raw tar)
    None,
    /// Gzip compression (.gz, .tgz)
    Gzip,
    /// XZ/LZMA compression (.xz)
    Xz,
    /// Zstandard compression (.zst)
    Zstd,
}

impl CompressionFormat {
    /// Detect compression format from file extension
    pub fn from_extension(path: &str) -> Self {
        if path.ends_with(".gz") || path.ends_with(".tgz") {
            Self::Gzip
        } else if path.ends_with(".xz") || path.ends_with(".txz") {
            Self::Xz
        } else if path.ends_with(".zst") || path.ends_with(".zstd") {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Detect compression format from magic bytes
    ///
    /// - Gzip: `1f 8b`
    /// - XZ: `fd 37 7a 58 5a 00`
    /// - Zstd: `28 b5 2f fd`
    pub fn from_magic_bytes(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if data.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
            Self::Xz
        } else if data.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }

    /// Sniff a file's format, falling back to its extension
    pub fn detect_file(path: &Path) -> io::Result<Self> {
        let mut magic = [0u8; 6];
        let mut file = File::open(path)?;
        let mut read = 0;
        while read < magic.len() {
            match file.read(&mut magic[read..])? {
                0 => break,
                n => read += n,
            }
        }
        match Self::from_magic_bytes(&magic[..read]) {
            Self::None => Ok(Self::from_extension(&path.to_string_lossy())),
            format => Ok(format),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Wrap `reader` in a decoder for `format`
pub fn create_decoder<'a, R: Read + 'a>(
    reader: R,
    format: CompressionFormat,
) -> Result<Box<dyn Read + 'a>, CompressionError> {
    match format {
        CompressionFormat::None => Ok(Box::new(reader)),
        CompressionFormat::Gzip => Ok(Box::new(flate2::read::GzDecoder::new(reader))),
        CompressionFormat::Xz => Ok(Box::new(xz2::read::XzDecoder::new(reader))),
        CompressionFormat::Zstd => {
            let decoder = zstd::Decoder::new(reader).map_err(|e| CompressionError::DecoderCreation {
                format: "zstd",
                source: e,
            })?;
            Ok(Box::new(decoder))
        }
    }
}

/// Open a possibly-compressed file as a decompressed stream
pub fn open_decoded(path: &Path) -> Result<Box<dyn Read>, CompressionError> {
    let open_err = |source| CompressionError::Open {
        path: path.display().to_string(),
        source,
    };
    let format = CompressionFormat::detect_file(path).map_err(open_err)?;
    let file = File::open(path).map_err(open_err)?;
    create_decoder(BufReader::new(file), format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(CompressionFormat::from_extension("rootfs.tar.gz"), CompressionFormat::Gzip);
        assert_eq!(CompressionFormat::from_extension("rootfs.tgz"), CompressionFormat::Gzip);
        assert_eq!(CompressionFormat::from_extension("rootfs.tar.xz"), CompressionFormat::Xz);
        assert_eq!(CompressionFormat::from_extension("rootfs.tar.zst"), CompressionFormat::Zstd);
        assert_eq!(CompressionFormat::from_extension("rootfs.tar"), CompressionFormat::None);
    }

    #[test]
    fn test_format_from_magic_bytes() {
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0x1f, 0x8b, 0x08, 0x00]),
            CompressionFormat::Gzip
        );
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]),
            CompressionFormat::Xz
        );
        assert_eq!(
            CompressionFormat::from_magic_bytes(&[0x28, 0xb5, 0x2f, 0xfd]),
            CompressionFormat::Zstd
        );
        assert_eq!(CompressionFormat::from_magic_bytes(&[0x1f]), CompressionFormat::None);
    }

    #[test]
    fn test_detect_ignores_misleading_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("layer.tar");
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"payload").unwrap();
        std::fs::write(&path, enc.finish().unwrap()).unwrap();

        assert_eq!(CompressionFormat::detect_file(&path).unwrap(), CompressionFormat::Gzip);

        let mut out = String::new();
        open_decoded(&path).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "payload");
    }

    #[test]
    fn test_zstd_round_trip_through_decoder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, zstd::encode_all(&b"zstd data"[..], 3).unwrap()).unwrap();

        let mut out = Vec::new();
        open_decoded(&path).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"zstd data");
    }
}
