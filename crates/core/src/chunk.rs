//! Chunk planning: partition files into newline-aligned byte ranges and
//! allocate a bounded worker budget across many files.
//!
//! Snapping works on the file handle directly, not the index — the handle is
//! always available, the index may not be.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::config::{MAX_CHUNKS_PER_FILE, MIN_CHUNK_BYTES};
use crate::error::Result;

/// A newline-aligned half-open byte range `[start, end)` assigned to one
/// worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// A file together with the workers granted to it in the current batch.
/// Zero workers means "deferred to a later batch".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTask {
    pub path: PathBuf,
    pub size: u64,
    pub workers: usize,
}

// ---------------------------------------------------------------------------
// Per-file chunking
// ---------------------------------------------------------------------------

/// Compute newline-aligned starting offsets for a file.
///
/// Files at or below `min_chunk_bytes` get the single offset `[0]`; larger
/// files are divided evenly into `min(max_chunks, ceil(size / min_chunk))`
/// pieces whose starts are snapped forward to the byte after the next
/// newline.
pub fn chunk_offsets(
    path: &Path,
    file_size: u64,
    min_chunk_bytes: u64,
    max_chunks: usize,
) -> Result<Vec<u64>> {
    if file_size <= min_chunk_bytes || min_chunk_bytes == 0 {
        return Ok(vec![0]);
    }
    let wanted = file_size.div_ceil(min_chunk_bytes);
    let n_chunks = (wanted.min(max_chunks as u64)).max(1);

    let mut file = File::open(path)?;
    let mut offsets = vec![0u64];
    let stride = file_size / n_chunks;
    for i in 1..n_chunks {
        let proposed = i * stride;
        let snapped = snap_to_line_start(&mut file, proposed, file_size)?;
        // Degenerate line layouts can snap several proposals to one spot.
        if snapped < file_size && Some(&snapped) != offsets.last() {
            offsets.push(snapped);
        }
    }
    Ok(offsets)
}

/// If the byte *before* `proposed` ends a line, `proposed` already starts
/// one; otherwise read forward until a newline is consumed and return the
/// position just past it.
fn snap_to_line_start(file: &mut File, proposed: u64, file_size: u64) -> Result<u64> {
    if proposed == 0 {
        return Ok(0);
    }
    let mut pos = proposed;
    file.seek(SeekFrom::Start(proposed - 1))?;
    let mut probe = [0u8; 1];
    if file.read(&mut probe)? == 1 && probe[0] == b'\n' {
        return Ok(proposed);
    }
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(file_size);
        }
        if let Some(i) = buf[..n].iter().position(|b| *b == b'\n') {
            return Ok(pos + i as u64 + 1);
        }
        pos += n as u64;
    }
}

/// Pair up starting offsets into `[start, end)` chunks covering the file.
pub fn plan_chunks(path: &Path, file_size: u64, workers: usize) -> Result<Vec<Chunk>> {
    let max = workers.clamp(1, MAX_CHUNKS_PER_FILE);
    let offsets = chunk_offsets(path, file_size, MIN_CHUNK_BYTES, max)?;
    Ok(chunks_from_offsets(&offsets, file_size))
}

/// Build chunks from known starting offsets (also used for seekable zstd,
/// where frame boundaries are the offsets).
pub fn chunks_from_offsets(offsets: &[u64], total_size: u64) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(offsets.len());
    for (i, &start) in offsets.iter().enumerate() {
        let end = offsets.get(i + 1).copied().unwrap_or(total_size);
        if start < end {
            chunks.push(Chunk { index: chunks.len(), start, end });
        }
    }
    chunks
}

// ---------------------------------------------------------------------------
// Multi-file worker allocation
// ---------------------------------------------------------------------------

/// Allocate a global worker budget across files proportionally to their
/// potential chunk counts (`max(1, size / min_chunk)`), never exceeding the
/// budget. Every file gets at least one worker while the budget lasts; files
/// left at zero are handled in subsequent batches.
pub fn allocate_workers(files: &[(PathBuf, u64)], budget: usize) -> Vec<FileTask> {
    if files.is_empty() || budget == 0 {
        return files
            .iter()
            .map(|(path, size)| FileTask { path: path.clone(), size: *size, workers: 0 })
            .collect();
    }

    let potentials: Vec<u64> =
        files.iter().map(|(_, size)| (size / MIN_CHUNK_BYTES).max(1)).collect();
    let total_potential: u64 = potentials.iter().sum();

    let mut tasks = Vec::with_capacity(files.len());
    let mut allocated = 0usize;
    for (i, (path, size)) in files.iter().enumerate() {
        let remaining = budget - allocated;
        if remaining == 0 {
            tasks.push(FileTask { path: path.clone(), size: *size, workers: 0 });
            continue;
        }
        let workers = if i == files.len() - 1 {
            // Last file absorbs whatever the proportional split left over.
            remaining.min(potentials[i] as usize).max(1).min(remaining)
        } else {
            let share =
                (potentials[i] as f64 / total_potential as f64 * budget as f64) as usize;
            share.max(1).min(potentials[i] as usize).min(remaining)
        };
        allocated += workers;
        tasks.push(FileTask { path: path.clone(), size: *size, workers });
    }
    tasks
}

/// Split allocated tasks into batches that each fit the budget: the already
/// funded files first, then deferred files re-allocated budget-at-a-time.
pub fn batch_tasks(tasks: Vec<FileTask>, budget: usize) -> Vec<Vec<FileTask>> {
    let (funded, deferred): (Vec<_>, Vec<_>) = tasks.into_iter().partition(|t| t.workers > 0);
    let mut batches = Vec::new();
    if !funded.is_empty() {
        batches.push(funded);
    }
    let mut rest: Vec<(PathBuf, u64)> =
        deferred.into_iter().map(|t| (t.path, t.size)).collect();
    while !rest.is_empty() {
        let take = rest.len().min(budget.max(1));
        let slice: Vec<(PathBuf, u64)> = rest.drain(..take).collect();
        batches.push(allocate_workers(&slice, budget));
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn file_of_lines(dir: &Path, name: &str, line: &str, count: usize) -> (PathBuf, u64) {
        let path = dir.join(name);
        let mut data = Vec::new();
        for _ in 0..count {
            data.extend_from_slice(line.as_bytes());
            data.push(b'\n');
        }
        fs::write(&path, &data).unwrap();
        (path, data.len() as u64)
    }

    #[test]
    fn small_file_is_a_single_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let (path, size) = file_of_lines(dir.path(), "small.log", "abc", 100);
        let offsets = chunk_offsets(&path, size, MIN_CHUNK_BYTES, 8).unwrap();
        assert_eq!(offsets, vec![0]);
        let chunks = chunks_from_offsets(&offsets, size);
        assert_eq!(chunks, vec![Chunk { index: 0, start: 0, end: size }]);
    }

    #[test]
    fn offsets_are_newline_aligned_and_start_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (path, size) = file_of_lines(dir.path(), "aligned.log", &"x".repeat(99), 5_000);
        // 500 KB file, 100 KiB chunks -> 5 offsets.
        let offsets = chunk_offsets(&path, size, 100 * 1024, 16).unwrap();
        assert!(offsets.len() >= 4, "{offsets:?}");
        assert_eq!(offsets[0], 0);

        let data = fs::read(&path).unwrap();
        for &offset in &offsets[1..] {
            assert_eq!(data[offset as usize - 1], b'\n', "offset {offset} not aligned");
        }
        for pair in offsets.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn chunk_count_respects_cap() {
        let dir = tempfile::tempdir().unwrap();
        let (path, size) = file_of_lines(dir.path(), "capped.log", &"y".repeat(63), 16_384);
        // 1 MiB file with 64 KiB chunks wants 16, cap at 4.
        let offsets = chunk_offsets(&path, size, 64 * 1024, 4).unwrap();
        assert!(offsets.len() <= 4);
    }

    #[test]
    fn chunks_tile_the_file_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let (path, size) = file_of_lines(dir.path(), "tiled.log", &"z".repeat(80), 8_000);
        let offsets = chunk_offsets(&path, size, 64 * 1024, 8).unwrap();
        let chunks = chunks_from_offsets(&offsets, size);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks.last().unwrap().end, size);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn single_long_line_collapses_to_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oneline.log");
        let data = "q".repeat(512 * 1024);
        fs::write(&path, &data).unwrap();
        let offsets = chunk_offsets(&path, data.len() as u64, 64 * 1024, 8).unwrap();
        // No interior newline to snap to: everything lands on chunk 0.
        assert_eq!(offsets, vec![0]);
    }

    #[test]
    fn proportional_allocation_favors_large_files() {
        let small = MIN_CHUNK_BYTES / 4;
        let large = MIN_CHUNK_BYTES * 10;
        let files = vec![
            (PathBuf::from("s1.log"), small),
            (PathBuf::from("s2.log"), small),
            (PathBuf::from("s3.log"), small),
            (PathBuf::from("big.log"), large),
        ];
        let tasks = allocate_workers(&files, 20);
        let total: usize = tasks.iter().map(|t| t.workers).sum();
        assert!(total <= 20);
        assert!(tasks[..3].iter().all(|t| t.workers == 1));
        assert!(tasks[3].workers >= 5, "large file got {}", tasks[3].workers);
    }

    #[test]
    fn overflow_files_carry_zero_workers() {
        let files: Vec<(PathBuf, u64)> = (0..30)
            .map(|i| (PathBuf::from(format!("f{i}.log")), MIN_CHUNK_BYTES / 2))
            .collect();
        let tasks = allocate_workers(&files, 20);
        let funded = tasks.iter().filter(|t| t.workers > 0).count();
        let deferred = tasks.iter().filter(|t| t.workers == 0).count();
        assert_eq!(funded, 20);
        assert_eq!(deferred, 10);
        assert_eq!(tasks.iter().map(|t| t.workers).sum::<usize>(), 20);
    }

    #[test]
    fn batching_covers_every_file() {
        let files: Vec<(PathBuf, u64)> = (0..13)
            .map(|i| (PathBuf::from(format!("f{i}.log")), MIN_CHUNK_BYTES / 2))
            .collect();
        let tasks = allocate_workers(&files, 4);
        let batches = batch_tasks(tasks, 4);
        let mut seen = 0;
        for batch in &batches {
            assert!(batch.iter().map(|t| t.workers).sum::<usize>() <= 4);
            seen += batch.iter().filter(|t| t.workers > 0).count();
        }
        assert_eq!(seen, 13);
    }

    #[test]
    fn zero_budget_defers_everything() {
        let files = vec![(PathBuf::from("a.log"), MIN_CHUNK_BYTES)];
        let tasks = allocate_workers(&files, 0);
        assert_eq!(tasks[0].workers, 0);
    }
}
