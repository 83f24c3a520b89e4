//! Line-offset index: a sparse checkpoint table mapping line numbers to byte
//! offsets, plus file-wide line statistics, persisted per file under the
//! cache root.
//!
//! Checkpoints are placed roughly every `step` bytes (`threshold / 50`,
//! 1 MiB by default) and always point at the first byte of a line, so any
//! line's exact location is reachable by a binary search followed by a scan
//! of at most `step` bytes.
//!
//! Cache policy: without analysis only large files (≥ threshold) are cached,
//! with a line index only; with analysis every file is cached with full
//! statistics and, when requested, anomaly ranges. Invalidation is by
//! `(size, mtime)` plus the format version.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::analyze::{Analyzer, AnomalyRange};
use crate::compression::{detect_compression, open_decompressed};
use crate::config::{Config, FAST_PATH_BYTES};
use crate::error::{Result, RxError};
use crate::stats::{detect_line_ending, Reservoir, RunningStats};
use crate::types::{FileIdentity, LineEnding};

/// Cache format version; bump on any schema change. Records with a different
/// version are treated as misses.
pub const UNIFIED_INDEX_VERSION: u32 = 2;

/// Bytes sampled from the head of the file for line-ending detection.
const LINE_ENDING_SAMPLE_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Persisted record
// ---------------------------------------------------------------------------

/// Line-length statistics, exact where cheap (extrema, mean, stddev) and
/// reservoir-estimated for quantiles. Empty lines are excluded.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LineLengthStats {
    pub max: u64,
    pub avg: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
    pub stddev: f64,
    /// Line number of the longest line.
    pub max_line_number: u64,
    /// Byte offset of the longest line's start.
    pub max_byte_offset: u64,
}

/// The persisted per-file index record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnifiedFileIndex {
    pub version: u32,
    pub source_path: String,
    pub source_size_bytes: u64,
    pub source_modified_ms: u64,
    /// Strictly increasing `(line_number, byte_offset)` checkpoints, starting
    /// with `(1, 0)`. Every offset > 0 is the first byte of a line.
    pub line_index: Vec<(u64, u64)>,
    pub line_count: u64,
    pub empty_line_count: u64,
    /// `None` for index-only builds and the very-large-file fast path.
    #[serde(default)]
    pub line_stats: Option<LineLengthStats>,
    pub line_ending: LineEnding,
    #[serde(default)]
    pub anomalies: Vec<AnomalyRange>,
    /// Category -> count over `anomalies`.
    #[serde(default)]
    pub anomaly_summary: BTreeMap<String, u64>,
    pub analysis_performed: bool,
}

impl UnifiedFileIndex {
    pub fn identity(&self) -> FileIdentity {
        FileIdentity { size_bytes: self.source_size_bytes, modified_ms: self.source_modified_ms }
    }
}

/// Everything known about the line containing a queried byte offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineInfo {
    pub line_number: u64,
    pub line_start_offset: u64,
    /// Offset just past the line's terminator.
    pub line_end_offset: u64,
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// What to compute during a build.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuildOptions {
    /// Compute line-length statistics.
    pub analyze: bool,
    /// Run the anomaly-detection pipeline during the same pass.
    pub detect_anomalies: bool,
}

/// Build an index record in a single forward pass. Compressed inputs are
/// indexed over their decompressed stream.
pub fn build_index(path: &Path, config: &Config, options: BuildOptions) -> Result<UnifiedFileIndex> {
    let identity = FileIdentity::of(path)?;
    if identity.size_bytes >= FAST_PATH_BYTES && !detect_compression(path).is_compressed() {
        return build_fast_index(path, config, identity, options);
    }

    let source: Box<dyn Read + Send> = if detect_compression(path).is_compressed() {
        open_decompressed(path)?
    } else {
        Box::new(File::open(path)?)
    };
    let mut reader = BufReader::with_capacity(1 << 20, source);

    let step = config.index_step_bytes();
    let mut line_index: Vec<(u64, u64)> = vec![(1, 0)];
    let mut next_checkpoint = step;

    let mut current_offset = 0u64;
    let mut current_line = 0u64;
    let mut empty_line_count = 0u64;

    let mut running = RunningStats::new();
    let mut reservoir = Reservoir::new(config.sample_size_lines);
    let mut max_len = 0u64;
    let mut max_line_number = 0u64;
    let mut max_byte_offset = 0u64;

    let mut ending_sample: Vec<u8> = Vec::with_capacity(LINE_ENDING_SAMPLE_BYTES);

    let mut analyzer = if options.detect_anomalies {
        Some(Analyzer::with_defaults(path, config))
    } else {
        None
    };

    let mut line: Vec<u8> = Vec::new();
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        current_line += 1;
        let line_start = current_offset;

        if ending_sample.len() < LINE_ENDING_SAMPLE_BYTES {
            let room = LINE_ENDING_SAMPLE_BYTES - ending_sample.len();
            ending_sample.extend_from_slice(&line[..line.len().min(room)]);
        }

        let content = strip_terminator(&line);
        let content_len = content.len() as u64;
        if content.iter().any(|b| !b.is_ascii_whitespace()) {
            if options.analyze {
                running.push(content_len as f64);
                reservoir.offer(content_len);
            }
            if content_len > max_len {
                max_len = content_len;
                max_line_number = current_line;
                max_byte_offset = line_start;
            }
        } else {
            empty_line_count += 1;
        }

        if let Some(analyzer) = analyzer.as_mut() {
            analyzer.push_line(&String::from_utf8_lossy(content), current_line, line_start);
        }

        current_offset += n as u64;

        // Checkpoint the start of the *next* line. Skipped for a trailing
        // line without a terminator: a checkpoint must sit right after one.
        if current_offset >= next_checkpoint && line.last() == Some(&b'\n') {
            line_index.push((current_line + 1, current_offset));
            next_checkpoint = current_offset + step;
        }
    }

    let line_stats = if options.analyze && running.count() > 0 {
        Some(LineLengthStats {
            max: max_len,
            avg: running.mean(),
            median: reservoir.percentile(50.0),
            p95: reservoir.percentile(95.0),
            p99: reservoir.percentile(99.0),
            stddev: running.stddev(),
            max_line_number,
            max_byte_offset,
        })
    } else if options.analyze {
        Some(LineLengthStats::default())
    } else {
        None
    };

    let (anomalies, anomaly_summary) = match analyzer {
        Some(analyzer) => analyzer.finish(),
        None => (Vec::new(), BTreeMap::new()),
    };

    Ok(UnifiedFileIndex {
        version: UNIFIED_INDEX_VERSION,
        source_path: path.display().to_string(),
        source_size_bytes: identity.size_bytes,
        source_modified_ms: identity.modified_ms,
        line_index,
        line_count: current_line,
        empty_line_count,
        line_stats,
        line_ending: detect_line_ending(&ending_sample),
        anomalies,
        anomaly_summary,
        analysis_performed: options.analyze,
    })
}

/// Fast path for very large files (≥ 1 GiB): count `\n` in block reads, detect
/// the line ending from the head, skip statistics and the checkpoint table.
/// Anomalies, when requested, come from an engine prescan over the detectors'
/// advertised patterns instead of the streaming pass.
fn build_fast_index(
    path: &Path,
    _config: &Config,
    identity: FileIdentity,
    options: BuildOptions,
) -> Result<UnifiedFileIndex> {
    info!("fast-path index for {} ({} bytes)", path.display(), identity.size_bytes);
    let mut file = File::open(path)?;
    let mut head = vec![0u8; LINE_ENDING_SAMPLE_BYTES];
    let mut head_len = 0;
    while head_len < head.len() {
        match file.read(&mut head[head_len..])? {
            0 => break,
            n => head_len += n,
        }
    }
    let line_ending = detect_line_ending(&head[..head_len]);

    file.seek(SeekFrom::Start(0))?;
    let mut buf = vec![0u8; 1 << 20];
    let mut newline_count = 0u64;
    let mut last_byte = None;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        newline_count += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
        last_byte = Some(buf[n - 1]);
    }
    // A trailing run without a terminator is still a line.
    let line_count = match last_byte {
        None => 0,
        Some(b'\n') => newline_count,
        Some(_) => newline_count + 1,
    };

    let mut anomalies = Vec::new();
    let mut anomaly_summary = BTreeMap::new();
    if options.detect_anomalies {
        match crate::analyze::prescan_file(path, &crate::types::CancelToken::new()) {
            Ok(hits) => {
                anomalies = crate::analyze::prescan_to_ranges(&hits);
                for range in &anomalies {
                    *anomaly_summary
                        .entry(range.category.as_str().to_string())
                        .or_default() += 1;
                }
            }
            Err(e) => warn!("prescan unavailable for {}: {e}", path.display()),
        }
    }

    Ok(UnifiedFileIndex {
        version: UNIFIED_INDEX_VERSION,
        source_path: path.display().to_string(),
        source_size_bytes: identity.size_bytes,
        source_modified_ms: identity.modified_ms,
        line_index: vec![(1, 0)],
        line_count,
        empty_line_count: 0,
        line_stats: None,
        line_ending,
        anomalies,
        anomaly_summary,
        analysis_performed: false,
    })
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    if end > 0 && line[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && line[end - 1] == b'\r' {
        end -= 1;
    }
    &line[..end]
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Rightmost checkpoint with `line_number <= target`.
pub fn checkpoint_for_line(line_index: &[(u64, u64)], target: u64) -> (u64, u64) {
    if line_index.is_empty() {
        return (1, 0);
    }
    let idx = line_index.partition_point(|(line, _)| *line <= target);
    line_index[idx.saturating_sub(1)]
}

/// Rightmost checkpoint with `byte_offset <= target`.
pub fn checkpoint_for_offset(line_index: &[(u64, u64)], target: u64) -> (u64, u64) {
    if line_index.is_empty() {
        return (1, 0);
    }
    let idx = line_index.partition_point(|(_, offset)| *offset <= target);
    line_index[idx.saturating_sub(1)]
}

/// Exact byte offset of a line's start: binary-search the checkpoints, then
/// scan forward at most `step` bytes. `None` when the line is past EOF.
pub fn offset_for_line(
    path: &Path,
    index: &UnifiedFileIndex,
    target_line: u64,
) -> Result<Option<u64>> {
    if target_line == 0 {
        return Ok(None);
    }
    let (checkpoint_line, checkpoint_offset) = checkpoint_for_line(&index.line_index, target_line);
    let mut current_line = checkpoint_line;
    let mut current_offset = checkpoint_offset;
    let mut reader = reader_at(path, checkpoint_offset)?;
    let mut buf = Vec::new();
    loop {
        if current_line == target_line {
            return Ok(Some(current_offset));
        }
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        current_offset += n as u64;
        current_line += 1;
    }
}

/// Exact 1-based line number containing a byte offset.
pub fn line_for_offset(
    path: &Path,
    index: &UnifiedFileIndex,
    target_offset: u64,
) -> Result<Option<u64>> {
    let mut found = None;
    let map = line_info_for_offsets(path, index, &[target_offset])?;
    if let Some(info) = map.get(&target_offset) {
        found = Some(info.line_number);
    }
    Ok(found)
}

/// Batched line lookup: sort the offsets, position once at the earliest
/// applicable checkpoint, and walk forward emitting each line's info as its
/// offsets are crossed. One file pass regardless of N.
pub fn line_info_for_offsets(
    path: &Path,
    index: &UnifiedFileIndex,
    offsets: &[u64],
) -> Result<BTreeMap<u64, LineInfo>> {
    let mut results = BTreeMap::new();
    if offsets.is_empty() {
        return Ok(results);
    }
    let mut sorted: Vec<u64> = offsets.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let (start_line, start_offset) = checkpoint_for_offset(&index.line_index, sorted[0]);
    let mut reader = reader_at(path, start_offset)?;
    let mut current_line = start_line;
    let mut current_offset = start_offset;
    let mut pending = sorted.iter().copied().skip_while(|o| *o < start_offset).peekable();

    let mut buf = Vec::new();
    while pending.peek().is_some() {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf)?;
        if n == 0 {
            break;
        }
        let line_end = current_offset + n as u64;
        while let Some(&target) = pending.peek() {
            if target < line_end {
                results.insert(
                    target,
                    LineInfo {
                        line_number: current_line,
                        line_start_offset: current_offset,
                        line_end_offset: line_end,
                    },
                );
                pending.next();
            } else {
                break;
            }
        }
        current_offset = line_end;
        current_line += 1;
    }
    Ok(results)
}

fn reader_at(path: &Path, offset: u64) -> Result<BufReader<File>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    Ok(BufReader::with_capacity(1 << 16, file))
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Hex SHA-256 of a string, truncated to 16 characters.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// `<safe-basename>_<sha256(abs path)[:16]>` — unique but still greppable by
/// a human browsing the cache directory.
pub fn cache_key(source: &Path) -> String {
    let basename = source.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    let safe: String = basename
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    format!("{safe}_{}", short_hash(&source.display().to_string()))
}

/// Cache file path for a source file.
pub fn index_path(config: &Config, source: &Path) -> PathBuf {
    config.index_cache_dir().join(format!("{}.json", cache_key(source)))
}

/// A record is valid iff the source's current `(size, mtime)` matches and the
/// format version is current.
pub fn is_index_valid(source: &Path, index: &UnifiedFileIndex) -> bool {
    if index.version != UNIFIED_INDEX_VERSION {
        return false;
    }
    match FileIdentity::of(source) {
        Ok(current) => current == index.identity(),
        Err(_) => false,
    }
}

/// Rebuild rules: no record, invalid record, analysis requested but not
/// performed, or anomalies requested while the cached record has none (it may
/// predate anomaly detection being enabled).
pub fn needs_rebuild(
    source: &Path,
    index: Option<&UnifiedFileIndex>,
    options: BuildOptions,
) -> bool {
    let Some(index) = index else { return true };
    if !is_index_valid(source, index) {
        return true;
    }
    if options.analyze && !index.analysis_performed {
        return true;
    }
    if options.detect_anomalies && index.anomalies.is_empty() {
        return true;
    }
    false
}

/// Load the cached record for a source file; any problem is a miss.
pub fn load_index(config: &Config, source: &Path) -> Option<UnifiedFileIndex> {
    let path = index_path(config, source);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => {
            debug!("no cached index for {}", source.display());
            return None;
        }
    };
    let record: UnifiedFileIndex = match serde_json::from_str(&raw) {
        Ok(r) => r,
        Err(e) => {
            warn!("failed to parse index cache {}: {e}", path.display());
            return None;
        }
    };
    if record.version != UNIFIED_INDEX_VERSION {
        debug!("index cache version mismatch for {}", source.display());
        return None;
    }
    if !is_index_valid(source, &record) {
        debug!("index cache stale for {}", source.display());
        return None;
    }
    Some(record)
}

/// Persist a record. The write goes to a temp file in the cache directory and
/// is renamed into place; concurrent writers race benignly (last rename wins).
pub fn save_index(config: &Config, index: &UnifiedFileIndex) -> Result<()> {
    let dir = config.index_cache_dir();
    std::fs::create_dir_all(&dir).map_err(|e| RxError::CacheIo(e.to_string()))?;
    let target = index_path(config, Path::new(&index.source_path));

    // Compact encoding once the record gets big.
    let compact = index.anomalies.len() > 1_000 || index.line_index.len() > 10_000;
    let body = if compact {
        serde_json::to_string(index)
    } else {
        serde_json::to_string_pretty(index)
    }
    .map_err(|e| RxError::CacheIo(e.to_string()))?;

    let tmp = target.with_extension("json.tmp");
    std::fs::write(&tmp, &body).map_err(|e| RxError::CacheIo(e.to_string()))?;
    std::fs::rename(&tmp, &target).map_err(|e| RxError::CacheIo(e.to_string()))?;
    info!(
        "saved index for {} ({} bytes, {} checkpoints, {} anomalies)",
        index.source_path,
        body.len(),
        index.line_index.len(),
        index.anomalies.len()
    );
    Ok(())
}

pub fn delete_index(config: &Config, source: &Path) -> bool {
    let path = index_path(config, source);
    match std::fs::remove_file(&path) {
        Ok(()) => true,
        Err(_) => false,
    }
}

/// Remove every cached index; returns how many were deleted.
pub fn clear_indexes(config: &Config) -> usize {
    let dir = config.index_cache_dir();
    let mut removed = 0;
    if let Ok(entries) = std::fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json")
                && std::fs::remove_file(entry.path()).is_ok()
            {
                removed += 1;
            }
        }
    }
    removed
}

/// Should a freshly built record be persisted at all? Analysis builds always
/// are; plain builds only for large files.
pub fn should_persist(config: &Config, size: u64, options: BuildOptions) -> bool {
    options.analyze || config.is_large_file(size)
}

/// Load-or-rebuild entry point used by the drivers.
pub fn ensure_index(
    path: &Path,
    config: &Config,
    options: BuildOptions,
) -> Result<UnifiedFileIndex> {
    let cached = load_index(config, path);
    if !needs_rebuild(path, cached.as_ref(), options) {
        if let Some(cached) = cached {
            return Ok(cached);
        }
    }
    let built = build_index(path, config, options)?;
    if should_persist(config, built.source_size_bytes, options) {
        if let Err(e) = save_index(config, &built) {
            warn!("continuing without index cache: {e}");
        }
    }
    Ok(built)
}

/// Ensure indexes for many files on the rayon pool; results keep input
/// order, per-file failures stay per-file.
pub fn ensure_indexes(
    paths: &[PathBuf],
    config: &Config,
    options: BuildOptions,
) -> Vec<(PathBuf, Result<UnifiedFileIndex>)> {
    use rayon::prelude::*;
    paths
        .par_iter()
        .map(|path| (path.clone(), ensure_index(path, config, options)))
        .collect()
}

// ---------------------------------------------------------------------------
// In-process store
// ---------------------------------------------------------------------------

/// Memoized, identity-checked view of on-disk indexes shared between driver
/// workers.
pub struct IndexStore {
    config: Config,
    loaded: DashMap<PathBuf, Arc<UnifiedFileIndex>>,
}

impl IndexStore {
    pub fn new(config: Config) -> IndexStore {
        IndexStore { config, loaded: DashMap::new() }
    }

    /// Valid cached index for `path`, from memory or disk. `None` when absent
    /// or stale; never rebuilds.
    pub fn get(&self, path: &Path) -> Option<Arc<UnifiedFileIndex>> {
        if let Some(existing) = self.loaded.get(path) {
            if is_index_valid(path, &existing) {
                return Some(existing.clone());
            }
            drop(existing);
            self.loaded.remove(path);
        }
        let fresh = Arc::new(load_index(&self.config, path)?);
        self.loaded.insert(path.to_path_buf(), fresh.clone());
        Some(fresh)
    }

    pub fn insert(&self, path: &Path, index: UnifiedFileIndex) -> Arc<UnifiedFileIndex> {
        let arc = Arc::new(index);
        self.loaded.insert(path.to_path_buf(), arc.clone());
        arc
    }
}
