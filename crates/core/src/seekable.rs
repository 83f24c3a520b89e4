//! Seekable zstd container: independently decompressable frames followed by a
//! trailing seek table, enabling parallel decompression and random byte-range
//! access without touching the rest of the file.
//!
//! Layout:
//!
//! ```text
//! [frame 0][frame 1]…[frame N-1][skippable frame: seek table + footer]
//! ```
//!
//! The seek table lives inside a zstd skippable frame so ordinary zstd tools
//! ignore it. Per-frame entries are `compressed_size: u32, decompressed_size:
//! u32` (plus an optional `checksum: u32` signalled by footer flag bit 0).
//! The 9-byte little-endian footer is `magic: u32, num_frames: u32, flags: u8`.
//!
//! Frames are cut on line boundaries during creation, so the line-offset
//! index of a decompressed frame can be derived without cross-frame
//! bookkeeping.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::compression::{detect_compression, open_decompressed};
use crate::error::{Result, RxError};

/// Magic of the skippable frame wrapping the seek table (nibble 0xE).
pub const SKIPPABLE_MAGIC: u32 = 0x184D_2A5E;

/// Magic identifying the seek-table footer.
pub const FOOTER_MAGIC: u32 = 0x8F92_EAB1;

/// Target decompressed bytes per frame (4 MiB), giving roughly 20–60 MB of
/// text per frame at typical log compression ratios.
pub const DEFAULT_FRAME_SIZE_BYTES: u64 = 4 * 1024 * 1024;

/// Default zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

const FOOTER_LEN: u64 = 9;
const SKIPPABLE_HEADER_LEN: u64 = 8;

// ---------------------------------------------------------------------------
// Frame metadata
// ---------------------------------------------------------------------------

/// Location of one frame in both the compressed and decompressed streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub index: usize,
    pub compressed_offset: u64,
    pub compressed_size: u64,
    pub decompressed_offset: u64,
    pub decompressed_size: u64,
}

impl FrameInfo {
    pub fn compressed_end(&self) -> u64 {
        self.compressed_offset + self.compressed_size
    }

    pub fn decompressed_end(&self) -> u64 {
        self.decompressed_offset + self.decompressed_size
    }
}

/// Summary of a seekable zstd file.
#[derive(Clone, Debug)]
pub struct SeekableInfo {
    pub path: PathBuf,
    pub compressed_size: u64,
    pub decompressed_size: u64,
    pub frames: Vec<FrameInfo>,
}

impl SeekableInfo {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

// ---------------------------------------------------------------------------
// Detection and seek-table reading
// ---------------------------------------------------------------------------

/// True when `path` has a `.zst` extension and its trailing nine bytes carry
/// the seek-table footer magic. Any mismatch means "treat as a plain stream".
pub fn is_seekable_zstd(path: &Path) -> bool {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("zst") => {}
        _ => return false,
    }
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(_) => return false,
    };
    let len = match file.metadata() {
        Ok(m) => m.len(),
        Err(_) => return false,
    };
    if len < FOOTER_LEN {
        return false;
    }
    let mut footer = [0u8; FOOTER_LEN as usize];
    if file.seek(SeekFrom::End(-(FOOTER_LEN as i64))).is_err()
        || file.read_exact(&mut footer).is_err()
    {
        return false;
    }
    u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]) == FOOTER_MAGIC
}

/// Read and validate the seek table of a seekable zstd file.
///
/// The per-frame compressed sizes must sum (together with the skippable
/// frame) to the physical file size, otherwise the table is corrupt and the
/// caller should fall back to streaming decompression.
pub fn read_seek_table(path: &Path) -> Result<Vec<FrameInfo>> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if file_len < FOOTER_LEN {
        return Err(corrupt(path, "file shorter than footer"));
    }

    file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
    let mut footer = [0u8; FOOTER_LEN as usize];
    file.read_exact(&mut footer)?;

    let magic = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    if magic != FOOTER_MAGIC {
        return Err(corrupt(path, "footer magic mismatch"));
    }
    let num_frames = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]) as u64;
    let flags = footer[8];
    let has_checksums = flags & 0x01 != 0;
    let entry_size: u64 = if has_checksums { 12 } else { 8 };

    let table_size = num_frames * entry_size;
    let table_start = FOOTER_LEN + table_size;
    if table_start + SKIPPABLE_HEADER_LEN > file_len {
        return Err(corrupt(path, "seek table larger than file"));
    }
    file.seek(SeekFrom::End(-(table_start as i64)))?;
    let mut table = vec![0u8; table_size as usize];
    file.read_exact(&mut table)?;

    let mut frames = Vec::with_capacity(num_frames as usize);
    let mut compressed_offset = 0u64;
    let mut decompressed_offset = 0u64;
    for i in 0..num_frames as usize {
        let base = i * entry_size as usize;
        let compressed_size =
            u32::from_le_bytes([table[base], table[base + 1], table[base + 2], table[base + 3]])
                as u64;
        let decompressed_size = u32::from_le_bytes([
            table[base + 4],
            table[base + 5],
            table[base + 6],
            table[base + 7],
        ]) as u64;
        frames.push(FrameInfo {
            index: i,
            compressed_offset,
            compressed_size,
            decompressed_offset,
            decompressed_size,
        });
        compressed_offset += compressed_size;
        decompressed_offset += decompressed_size;
    }

    // Offset-sum invariant: frames + skippable header + table + footer must
    // account for every byte of the file.
    let expected = compressed_offset + SKIPPABLE_HEADER_LEN + table_size + FOOTER_LEN;
    if expected != file_len {
        return Err(corrupt(
            path,
            &format!("frame sizes sum to {expected} bytes, file is {file_len}"),
        ));
    }

    Ok(frames)
}

/// Full metadata for a seekable zstd file.
pub fn seekable_info(path: &Path) -> Result<SeekableInfo> {
    let frames = read_seek_table(path)?;
    let compressed_size = std::fs::metadata(path)?.len();
    let decompressed_size = frames.last().map(FrameInfo::decompressed_end).unwrap_or(0);
    Ok(SeekableInfo { path: path.to_path_buf(), compressed_size, decompressed_size, frames })
}

fn corrupt(path: &Path, detail: &str) -> RxError {
    RxError::SeekTableCorrupt { path: path.to_path_buf(), detail: detail.to_string() }
}

// ---------------------------------------------------------------------------
// Random access
// ---------------------------------------------------------------------------

/// Indices of frames whose decompressed ranges overlap `[start, end)`.
pub fn frames_for_range(frames: &[FrameInfo], start: u64, end: u64) -> Vec<usize> {
    // Binary search for the first overlapping frame, then walk forward.
    let first = frames.partition_point(|f| f.decompressed_end() <= start);
    frames[first..]
        .iter()
        .take_while(|f| f.decompressed_offset < end)
        .map(|f| f.index)
        .collect()
}

/// Frame containing the given decompressed offset.
pub fn frame_for_offset(frames: &[FrameInfo], offset: u64) -> Option<usize> {
    let idx = frames.partition_point(|f| f.decompressed_end() <= offset);
    frames.get(idx).filter(|f| f.decompressed_offset <= offset).map(|f| f.index)
}

/// Decompress a single frame. Each frame reads one contiguous slice of
/// compressed bytes and inflates independently.
pub fn decompress_frame(path: &Path, frames: &[FrameInfo], index: usize) -> Result<Vec<u8>> {
    let frame = frames.get(index).ok_or_else(|| {
        corrupt(path, &format!("frame index {index} out of range 0..{}", frames.len()))
    })?;
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(frame.compressed_offset))?;
    let mut compressed = vec![0u8; frame.compressed_size as usize];
    file.read_exact(&mut compressed)?;
    zstd::bulk::decompress(&compressed, frame.decompressed_size as usize)
        .map_err(|e| corrupt(path, &format!("frame {index} failed to decompress: {e}")))
}

/// Decompress the byte range `[start, start + length)` of the decompressed
/// stream, touching only the frames that overlap it.
pub fn decompress_range(
    path: &Path,
    frames: &[FrameInfo],
    start: u64,
    length: u64,
) -> Result<Vec<u8>> {
    let end = start.saturating_add(length);
    let needed = frames_for_range(frames, start, end);
    let mut out = Vec::with_capacity(length as usize);
    for index in needed {
        let frame = &frames[index];
        let data = decompress_frame(path, frames, index)?;
        let from = start.saturating_sub(frame.decompressed_offset) as usize;
        let to = ((end - frame.decompressed_offset).min(data.len() as u64)) as usize;
        out.extend_from_slice(&data[from..to]);
    }
    out.truncate(length as usize);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Options for [`create_seekable`].
#[derive(Clone, Copy, Debug)]
pub struct SeekableOptions {
    pub frame_size_bytes: u64,
    pub compression_level: i32,
}

impl Default for SeekableOptions {
    fn default() -> Self {
        SeekableOptions {
            frame_size_bytes: DEFAULT_FRAME_SIZE_BYTES,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

/// Create a seekable zstd file from `input`. An already-compressed input
/// (gzip, xz, bz2, plain zstd) is re-encoded from its decompressed stream.
///
/// Each frame holds whole lines: the chunk is extended to the next newline
/// (or EOF) before compression, so every frame except possibly the last ends
/// on a newline.
pub fn create_seekable(
    input: &Path,
    output: &Path,
    options: SeekableOptions,
) -> Result<SeekableInfo> {
    let output = ensure_zst_extension(output);
    let source: Box<dyn Read + Send> = if detect_compression(input).is_compressed() {
        tracing::info!("decompressing {} before seekable re-encode", input.display());
        open_decompressed(input)?
    } else {
        Box::new(File::open(input)?)
    };
    let mut reader = BufReader::with_capacity(1 << 20, source);
    let mut writer = BufWriter::new(File::create(&output)?);

    let mut frames: Vec<FrameInfo> = Vec::new();
    let mut compressed_offset = 0u64;
    let mut decompressed_offset = 0u64;
    let mut chunk: Vec<u8> = Vec::with_capacity(options.frame_size_bytes as usize + 4096);

    loop {
        chunk.clear();
        // Accumulate whole lines until the frame target is reached. A single
        // line longer than the target grows the frame rather than splitting.
        while (chunk.len() as u64) < options.frame_size_bytes {
            let before = chunk.len();
            reader.read_until(b'\n', &mut chunk)?;
            if chunk.len() == before {
                break; // EOF
            }
        }
        if chunk.is_empty() {
            break;
        }

        let compressed = zstd::bulk::compress(&chunk, options.compression_level)
            .map_err(RxError::Io)?;
        writer.write_all(&compressed)?;

        frames.push(FrameInfo {
            index: frames.len(),
            compressed_offset,
            compressed_size: compressed.len() as u64,
            decompressed_offset,
            decompressed_size: chunk.len() as u64,
        });
        compressed_offset += compressed.len() as u64;
        decompressed_offset += chunk.len() as u64;
    }

    write_seek_table(&mut writer, &frames)?;
    writer.flush()?;

    let compressed_size = std::fs::metadata(&output)?.len();
    Ok(SeekableInfo {
        path: output,
        compressed_size,
        decompressed_size: decompressed_offset,
        frames,
    })
}

/// Append the skippable frame holding seek-table entries plus footer.
fn write_seek_table<W: Write>(writer: &mut W, frames: &[FrameInfo]) -> Result<()> {
    let mut table = Vec::with_capacity(frames.len() * 8 + FOOTER_LEN as usize);
    for frame in frames {
        table.extend_from_slice(&(frame.compressed_size as u32).to_le_bytes());
        table.extend_from_slice(&(frame.decompressed_size as u32).to_le_bytes());
    }
    table.extend_from_slice(&FOOTER_MAGIC.to_le_bytes());
    table.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    table.push(0); // flags: no checksums

    writer.write_all(&SKIPPABLE_MAGIC.to_le_bytes())?;
    writer.write_all(&(table.len() as u32).to_le_bytes())?;
    writer.write_all(&table)?;
    Ok(())
}

fn ensure_zst_extension(path: &Path) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("zst") => path.to_path_buf(),
        _ => path.with_extension("zst"),
    }
}
