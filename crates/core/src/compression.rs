//! Compression detection and streaming decompression.
//!
//! Format detection prefers magic bytes over the file extension; the
//! extension only disambiguates when magic is absent (e.g. a path that does
//! not exist yet on a create operation). Compound archives (`.tar.gz` and
//! friends) are rejected outright — rewriting a tar inside a compressed
//! stream is out of scope.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use xz2::read::XzDecoder;

use crate::error::{Result, RxError};

/// Bytes inspected by the text/binary classifier.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const ZSTD_MAGIC: &[u8] = &[0x28, 0xB5, 0x2F, 0xFD];
const XZ_MAGIC: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];
const BZ2_MAGIC: &[u8] = &[0x42, 0x5A, 0x68];

/// Extensions classified as compound (tar-in-compressed-stream) archives.
const COMPOUND_SUFFIXES: &[&str] = &[
    ".tar.gz", ".tgz", ".tar.xz", ".txz", ".tar.bz2", ".tbz", ".tbz2", ".tar.zst", ".tzst",
];

/// Single-file compression format of an input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionFormat {
    None,
    Gzip,
    Zstd,
    Xz,
    Bzip2,
}

impl CompressionFormat {
    pub fn is_compressed(self) -> bool {
        self != CompressionFormat::None
    }
}

impl std::fmt::Display for CompressionFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompressionFormat::None => "none",
            CompressionFormat::Gzip => "gzip",
            CompressionFormat::Zstd => "zstd",
            CompressionFormat::Xz => "xz",
            CompressionFormat::Bzip2 => "bzip2",
        };
        f.write_str(s)
    }
}

/// True when the path's name ends in one of the compound-archive suffixes.
pub fn is_compound_archive(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_ascii_lowercase(),
        None => return false,
    };
    COMPOUND_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}

fn format_from_magic(prefix: &[u8]) -> Option<CompressionFormat> {
    if prefix.starts_with(XZ_MAGIC) {
        Some(CompressionFormat::Xz)
    } else if prefix.starts_with(ZSTD_MAGIC) {
        Some(CompressionFormat::Zstd)
    } else if prefix.starts_with(BZ2_MAGIC) {
        Some(CompressionFormat::Bzip2)
    } else if prefix.starts_with(GZIP_MAGIC) {
        Some(CompressionFormat::Gzip)
    } else {
        None
    }
}

fn format_from_extension(path: &Path) -> CompressionFormat {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "gz" => CompressionFormat::Gzip,
        Some(ext) if ext == "zst" => CompressionFormat::Zstd,
        Some(ext) if ext == "xz" => CompressionFormat::Xz,
        Some(ext) if ext == "bz2" => CompressionFormat::Bzip2,
        _ => CompressionFormat::None,
    }
}

/// Detect a file's compression format. Magic bytes win; the extension is
/// consulted only when the file cannot be read or is shorter than any magic.
pub fn detect_compression(path: &Path) -> CompressionFormat {
    let mut prefix = [0u8; 6];
    let read = File::open(path).and_then(|mut f| {
        let mut filled = 0;
        while filled < prefix.len() {
            match f.read(&mut prefix[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    });
    match read {
        Ok(n) if n >= 2 => format_from_magic(&prefix[..n]).unwrap_or(CompressionFormat::None),
        _ => format_from_extension(path),
    }
}

/// Open `path` as a byte stream, transparently decompressing it. Callers read
/// plain bytes and are never exposed to the algorithm.
pub fn open_decompressed(path: &Path) -> Result<Box<dyn Read + Send>> {
    if is_compound_archive(path) {
        return Err(RxError::NotAProcessableFile {
            path: path.to_path_buf(),
            reason: "compound archive (tar inside compressed stream)".into(),
        });
    }
    let file = File::open(path)?;
    let reader: Box<dyn Read + Send> = match detect_compression(path) {
        CompressionFormat::None => Box::new(file),
        CompressionFormat::Gzip => Box::new(GzDecoder::new(file)),
        CompressionFormat::Bzip2 => Box::new(BzDecoder::new(file)),
        CompressionFormat::Xz => Box::new(XzDecoder::new(file)),
        CompressionFormat::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(file).map_err(|e| {
                tracing::warn!("zstd decoder init failed for {}: {e}", path.display());
                RxError::CompressionUnsupported { format: "zstd".into(), path: path.to_path_buf() }
            })?;
            Box::new(decoder)
        }
    };
    Ok(reader)
}

/// Uncompressed size a gzip member claims in its trailer. Gzip stores the
/// size modulo 2^32, so the value is only trustworthy for small inputs;
/// `None` means "unknown".
pub fn gzip_uncompressed_size(path: &Path) -> Result<Option<u64>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 18 {
        return Ok(None);
    }
    // A compressed stream larger than the ISIZE limit has certainly wrapped.
    if len >= u32::MAX as u64 {
        return Ok(None);
    }
    file.seek(SeekFrom::End(-4))?;
    let mut tail = [0u8; 4];
    file.read_exact(&mut tail)?;
    Ok(Some(u32::from_le_bytes(tail) as u64))
}

/// A file is binary iff its first 8 KiB contain a null byte. Compressed files
/// are never subjected to this test on their compressed bytes.
pub fn is_binary_file(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; BINARY_SNIFF_BYTES];
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(buf[..filled].contains(&0))
}

/// Decide whether a path can enter the scan pipeline. Directories and
/// compound archives are rejected; compressed files pass unconditionally;
/// plain files must pass the binary sniff.
pub fn check_processable(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)?;
    if meta.is_dir() {
        return Err(RxError::NotAProcessableFile {
            path: path.to_path_buf(),
            reason: "is a directory".into(),
        });
    }
    if is_compound_archive(path) {
        return Err(RxError::NotAProcessableFile {
            path: path.to_path_buf(),
            reason: "compound archive (tar inside compressed stream)".into(),
        });
    }
    if detect_compression(path).is_compressed() {
        return Ok(());
    }
    if is_binary_file(path)? {
        return Err(RxError::NotAProcessableFile {
            path: path.to_path_buf(),
            reason: "binary file".into(),
        });
    }
    Ok(())
}
