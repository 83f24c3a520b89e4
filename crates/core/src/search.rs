//! Parallel chunked search driver.
//!
//! Per file: consult the trace cache, plan newline-aligned chunks, stream one
//! regex-engine subprocess per chunk under a global semaphore, merge the
//! per-chunk event streams preserving byte order, enforce the global result
//! cap, enrich matches with absolute line numbers through the line-offset
//! index, and write the trace cache back when the scan was complete.
//!
//! Workers own their chunk buffers; results flow to a single merger over a
//! channel, so no shared mutable state crosses worker boundaries.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crossbeam_channel::unbounded;
use tracing::{debug, info, warn};

use crate::chunk::{allocate_workers, batch_tasks, plan_chunks, Chunk};
use crate::compression::{check_processable, detect_compression, open_decompressed};
use crate::config::Config;
use crate::engine::{scan_chunk, ChunkScan, EngineInvocation, LineEventData};
use crate::error::{Result, RxError};
use crate::index::{line_info_for_offsets, IndexStore};
use crate::seekable::{decompress_range, is_seekable_zstd, read_seek_table};
use crate::trace_cache;
use crate::types::{
    context_key, file_id, pattern_id, CancelToken, ContextLine, Match, SkippedFile, TraceOutcome,
};

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One search operation. Paths must already be sandbox-validated.
#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub paths: Vec<PathBuf>,
    pub patterns: Vec<String>,
    /// Raw engine pass-through flags (`-i`, `-w`, …).
    pub flags: Vec<String>,
    pub max_results: Option<usize>,
    pub before_context: usize,
    pub after_context: usize,
    pub use_index: bool,
    pub use_cache: bool,
    /// Walk directories recursively when a path is a directory.
    pub recursive: bool,
}

impl SearchRequest {
    pub fn new(paths: Vec<PathBuf>, patterns: Vec<String>) -> SearchRequest {
        SearchRequest {
            paths,
            patterns,
            flags: Vec::new(),
            max_results: None,
            before_context: 0,
            after_context: 0,
            use_index: true,
            use_cache: true,
            recursive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Subprocess semaphore
// ---------------------------------------------------------------------------

/// Counting semaphore bounding live engine subprocesses. Workers that cannot
/// dispatch block until a permit frees up.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(permits: usize) -> Semaphore {
        Semaphore { permits: Mutex::new(permits.max(1)), available: Condvar::new() }
    }

    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
        SemaphorePermit { semaphore: self }
    }
}

pub struct SemaphorePermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        let mut permits = self.semaphore.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.semaphore.available.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Local pattern compilation
// ---------------------------------------------------------------------------

/// Compile the pattern list with the `regex` crate, honoring the matching
/// flags, for pattern-index resolution and submatch extraction. A pattern the
/// local engine cannot express (e.g. PCRE lookarounds under `-P`) compiles to
/// `None` and is attributed by position instead.
pub fn compile_local_patterns(
    patterns: &[String],
    flags: &[String],
) -> Vec<Option<regex::Regex>> {
    let ignore_case = flags.iter().any(|f| f == "-i" || f == "--ignore-case")
        && !flags.iter().any(|f| f == "--case-sensitive");
    let fixed = flags.iter().any(|f| f == "-F");
    let whole_word = flags.iter().any(|f| f == "-w");
    let whole_line = flags.iter().any(|f| f == "-x");

    patterns
        .iter()
        .map(|raw| {
            let mut body =
                if fixed { regex::escape(raw) } else { raw.clone() };
            if whole_word {
                body = format!(r"\b(?:{body})\b");
            }
            if whole_line {
                body = format!(r"^(?:{body})$");
            }
            regex::RegexBuilder::new(&body)
                .case_insensitive(ignore_case)
                .build()
                .map_err(|e| {
                    debug!("pattern '{raw}' not locally compilable: {e}");
                    e
                })
                .ok()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub struct SearchDriver {
    config: Config,
    semaphore: Arc<Semaphore>,
    index_store: Arc<IndexStore>,
}

/// Per-chunk result flowing from a worker to the merger.
struct ChunkOutcome {
    chunk: Chunk,
    result: Result<ChunkScan>,
}

/// Accumulated state for one file before id assignment.
struct FileResults {
    matches: Vec<Match>,
    contexts: Vec<(String, Vec<ContextLine>)>,
    complete: bool,
}

impl SearchDriver {
    pub fn new(config: Config) -> SearchDriver {
        let semaphore = Arc::new(Semaphore::new(config.max_subprocesses));
        let index_store = Arc::new(IndexStore::new(config.clone()));
        SearchDriver { config, semaphore, index_store }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run a search to completion (or cancellation).
    pub fn run(&self, request: &SearchRequest, cancel: &CancelToken) -> Result<TraceOutcome> {
        let started = Instant::now();
        if request.patterns.is_empty() {
            return Err(RxError::RegexInvalid("no patterns given".into()));
        }

        let files = expand_paths(&request.paths, request.recursive)?;
        let local = compile_local_patterns(&request.patterns, &request.flags);

        let mut outcome = TraceOutcome::default();
        for (i, pattern) in request.patterns.iter().enumerate() {
            outcome.patterns.insert(pattern_id(i), pattern.clone());
        }

        // Stat everything up front; unreadable files are skips, not aborts.
        let mut sized: Vec<(PathBuf, u64)> = Vec::new();
        for path in &files {
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_file() => sized.push((path.clone(), meta.len())),
                Ok(_) => outcome
                    .skipped_files
                    .push(SkippedFile { path: path.clone(), reason: "not a regular file".into() }),
                Err(e) => outcome
                    .skipped_files
                    .push(SkippedFile { path: path.clone(), reason: e.to_string() }),
            }
        }
        for (i, (path, _)) in sized.iter().enumerate() {
            outcome.files.insert(file_id(i), path.display().to_string());
        }

        let produced = AtomicUsize::new(0);
        let stop_dispatch = AtomicBool::new(false);

        let batches =
            batch_tasks(allocate_workers(&sized, self.config.max_subprocesses), self.config.max_subprocesses);

        // File index -> results, so multi-batch completion keeps input order.
        let mut per_file: Vec<Option<FileResults>> = (0..sized.len()).map(|_| None).collect();

        for batch in batches {
            if cancel.is_canceled() {
                break;
            }
            let batch_results: Vec<(usize, Result<FileResults>)> = std::thread::scope(|scope| {
                let mut handles = Vec::new();
                for task in &batch {
                    if task.workers == 0 {
                        continue;
                    }
                    let file_index = sized
                        .iter()
                        .position(|(p, _)| p == &task.path)
                        .expect("task path came from sized list");
                    let request = request.clone();
                    let local = &local;
                    let produced = &produced;
                    let stop_dispatch = &stop_dispatch;
                    let task = task.clone();
                    let fid = file_id(file_index);
                    handles.push((file_index, scope.spawn(move || {
                        self.process_file(
                            &task.path,
                            &fid,
                            task.size,
                            task.workers,
                            &request,
                            local,
                            produced,
                            stop_dispatch,
                            cancel,
                        )
                    })));
                }
                handles
                    .into_iter()
                    .map(|(idx, handle)| {
                        (idx, handle.join().unwrap_or_else(|_| {
                            Err(RxError::ChunkFailure {
                                path: sized[idx].0.clone(),
                                index: 0,
                                cause: "worker thread panicked".into(),
                            })
                        }))
                    })
                    .collect()
            });

            for (file_index, result) in batch_results {
                match result {
                    Ok(results) => per_file[file_index] = Some(results),
                    Err(RxError::Canceled) => {
                        // Partial results stand; stop pulling further batches.
                        cancel.cancel();
                    }
                    Err(e) if e.is_file_local() => {
                        outcome.skipped_files.push(SkippedFile {
                            path: sized[file_index].0.clone(),
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Assemble in file order.
        for (i, slot) in per_file.into_iter().enumerate() {
            let Some(results) = slot else { continue };
            outcome.scanned_files.push(sized[i].0.clone());
            outcome.matches.extend(results.matches);
            for (key, lines) in results.contexts {
                outcome.context_lines.insert(key, lines);
            }
        }

        if let Some(cap) = request.max_results {
            if outcome.matches.len() > cap {
                outcome.matches.truncate(cap);
                outcome.truncated = true;
            }
        }
        if stop_dispatch.load(Ordering::SeqCst) {
            outcome.truncated = true;
        }

        outcome.time = started.elapsed().as_secs_f64();
        info!(
            "search finished: {} matches, {} files scanned, {} skipped in {:.3}s",
            outcome.matches.len(),
            outcome.scanned_files.len(),
            outcome.skipped_files.len(),
            outcome.time
        );
        Ok(outcome)
    }

    /// The per-file pipeline. Returns matches with ids already assigned.
    #[allow(clippy::too_many_arguments)]
    fn process_file(
        &self,
        path: &Path,
        fid: &str,
        size: u64,
        workers: usize,
        request: &SearchRequest,
        local: &[Option<regex::Regex>],
        produced: &AtomicUsize,
        stop_dispatch: &AtomicBool,
        cancel: &CancelToken,
    ) -> Result<FileResults> {
        check_processable(path)?;
        let compressed = detect_compression(path).is_compressed();
        let seekable = compressed && is_seekable_zstd(path);

        // Step 1: trace cache short-circuit. Only plain files — offsets in a
        // compressed file's cache would refer to the decompressed stream.
        if request.use_cache
            && !self.config.no_cache
            && !compressed
            && request.max_results.is_none()
            && self.config.is_large_file(size)
        {
            if let Some(record) =
                trace_cache::load_valid(&self.config, path, &request.patterns, &request.flags)
            {
                // Reconstruction reads line text through the index; a large
                // file without one gets indexed now rather than rescanned.
                let index = match self.index_store.get(path) {
                    Some(index) => Some(index),
                    None if !self.config.no_index => {
                        let built = crate::index::ensure_index(
                            path,
                            &self.config,
                            crate::index::BuildOptions::default(),
                        )?;
                        Some(self.index_store.insert(path, built))
                    }
                    None => None,
                };
                if let Some(index) = index {
                    let matches =
                        trace_cache::reconstruct_matches(path, &record, local, &index, fid)?;
                    produced.fetch_add(matches.len(), Ordering::SeqCst);
                    return Ok(FileResults { matches, contexts: Vec::new(), complete: true });
                }
            }
        }

        // Step 2: plan chunks.
        let chunks: Vec<Chunk> = if seekable {
            let frames = match read_seek_table(path) {
                Ok(frames) => frames,
                Err(RxError::SeekTableCorrupt { .. }) => {
                    warn!("seek table corrupt for {}; streaming instead", path.display());
                    Vec::new()
                }
                Err(e) => return Err(e),
            };
            if frames.is_empty() {
                vec![Chunk { index: 0, start: 0, end: u64::MAX }]
            } else {
                // Group frames into ~workers contiguous decompressed spans.
                let total = frames.last().map(|f| f.decompressed_end()).unwrap_or(0);
                let per_group = frames.len().div_ceil(workers.max(1));
                let mut chunks = Vec::new();
                for (i, group) in frames.chunks(per_group).enumerate() {
                    let start = group[0].decompressed_offset;
                    let end = group.last().map(|f| f.decompressed_end()).unwrap_or(total);
                    chunks.push(Chunk { index: i, start, end });
                }
                chunks
            }
        } else if compressed {
            // Non-seekable compressed input: one streaming pass.
            vec![Chunk { index: 0, start: 0, end: u64::MAX }]
        } else {
            plan_chunks(path, size, workers)?
        };

        let invocation = EngineInvocation {
            patterns: request.patterns.to_vec(),
            flags: request.flags.to_vec(),
            before_context: request.before_context,
            after_context: request.after_context,
        };

        // Step 3: dispatch chunk scans, results merged over a channel.
        let (tx, rx) = unbounded::<ChunkOutcome>();
        let chunk_count = chunks.len();
        std::thread::scope(|scope| {
            for chunk in &chunks {
                if stop_dispatch.load(Ordering::SeqCst) || cancel.is_canceled() {
                    // Dropping the sender side marks the chunk undelivered.
                    break;
                }
                let tx = tx.clone();
                let invocation = invocation.clone();
                let chunk = *chunk;
                let semaphore = self.semaphore.clone();
                scope.spawn(move || {
                    let _permit = semaphore.acquire();
                    let result = run_one_chunk(path, &invocation, chunk, seekable, cancel);
                    let _ = tx.send(ChunkOutcome { chunk, result });
                });
            }
            drop(tx);
            Ok::<(), RxError>(())
        })?;

        // Step 4: merge, preserving byte order via the chunk index.
        let mut outcomes: Vec<ChunkOutcome> = rx.into_iter().collect();
        outcomes.sort_by_key(|o| o.chunk.index);

        let mut failures = 0usize;
        let mut scans: Vec<(Chunk, ChunkScan)> = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(scan) => scans.push((outcome.chunk, scan)),
                Err(RxError::Canceled) => return Err(RxError::Canceled),
                Err(e @ RxError::RegexInvalid(_)) => return Err(e),
                Err(e) => {
                    warn!("{e}");
                    failures += 1;
                }
            }
        }
        let dispatched = scans.len() + failures;
        if scans.is_empty() && failures > 0 {
            return Err(RxError::FileSkipped { path: path.to_path_buf() });
        }
        let complete = failures == 0 && dispatched == chunk_count && !cancel.is_canceled();

        let mut results = self
            .merge_scans(path, fid, compressed, scans, local, request, produced, stop_dispatch)?;
        results.complete = complete;

        // Step 7: write back a trace cache record for complete, uncapped
        // scans of large plain files.
        if request.use_cache
            && !self.config.no_cache
            && !compressed
            && results.complete
            && trace_cache::is_cacheable(&self.config, size, request.max_results, true)
        {
            let rows: Vec<(usize, u64, Option<u64>)> = results
                .matches
                .iter()
                .filter_map(|m| {
                    crate::types::id_index(&m.pattern)
                        .map(|pi| (pi, m.offset, m.line_number))
                })
                .collect();
            match trace_cache::build_record(path, &request.patterns, &request.flags, &rows) {
                Some(record) => {
                    if let Err(e) = trace_cache::save_record(
                        &self.config,
                        path,
                        &request.patterns,
                        &request.flags,
                        &record,
                    ) {
                        warn!("continuing without trace cache: {e}");
                    }
                }
                None => debug!(
                    "not caching {}: absolute line numbers unresolved",
                    path.display()
                ),
            }
        }

        Ok(results)
    }

    /// Turn per-chunk raw scans into enriched, id-tagged matches.
    #[allow(clippy::too_many_arguments)]
    fn merge_scans(
        &self,
        path: &Path,
        fid: &str,
        compressed: bool,
        scans: Vec<(Chunk, ChunkScan)>,
        local: &[Option<regex::Regex>],
        request: &SearchRequest,
        produced: &AtomicUsize,
        stop_dispatch: &AtomicBool,
    ) -> Result<FileResults> {
        let single_chunk_at_zero = scans.len() == 1 && scans[0].0.start == 0;
        let mut matches: Vec<Match> = Vec::new();
        // (match position in `matches`) -> context lines for that match.
        let mut contexts: Vec<(usize, ContextLine)> = Vec::new();
        let mut seen: std::collections::HashSet<(usize, u64)> = std::collections::HashSet::new();

        for (chunk, scan) in &scans {
            let mut chunk_match_spans: Vec<(usize, usize)> = Vec::new(); // event -> [from, to)

            for event in &scan.matches {
                let from = matches.len();
                self.emit_matches(event, chunk, fid, local, &mut matches, &mut seen);
                chunk_match_spans.push((from, matches.len()));
            }

            for (anchor, event) in &scan.contexts {
                let Some(anchor) = anchor else { continue };
                let Some(&(from, to)) = chunk_match_spans.get(*anchor) else { continue };
                // Attach to every match emitted from the anchoring event.
                for match_pos in from..to {
                    contexts.push((
                        match_pos,
                        ContextLine {
                            line_number: event.line_number.unwrap_or(0),
                            line_text: event.line_text().to_string(),
                            absolute_offset: Some(chunk.start + event.absolute_offset),
                        },
                    ));
                }
            }
        }

        produced.fetch_add(matches.len(), Ordering::SeqCst);
        if let Some(cap) = request.max_results {
            if produced.load(Ordering::SeqCst) >= cap {
                stop_dispatch.store(true, Ordering::SeqCst);
            }
        }

        // Step 5: absolute line numbers via one batched index call.
        if single_chunk_at_zero {
            for m in &mut matches {
                m.line_number = Some(m.relative_line_number);
            }
        } else if request.use_index && !self.config.no_index && !compressed {
            if let Some(index) = self.index_store.get(path) {
                let offsets: Vec<u64> = matches.iter().map(|m| m.offset).collect();
                let infos = line_info_for_offsets(path, &index, &offsets)?;
                for m in &mut matches {
                    m.line_number = infos.get(&m.offset).map(|i| i.line_number);
                }
            }
        }

        // Group context lines per final match key.
        let mut grouped: Vec<(String, Vec<ContextLine>)> = Vec::new();
        for (match_pos, line) in contexts {
            let m = &matches[match_pos];
            let key = context_key(&m.pattern, &m.file, m.offset);
            match grouped.iter_mut().find(|(k, _)| k == &key) {
                Some((_, lines)) => lines.push(line),
                None => grouped.push((key, vec![line])),
            }
        }

        Ok(FileResults { matches, contexts: grouped, complete: true })
    }

    /// Resolve which patterns produced a match event and emit one [`Match`]
    /// per owning pattern. Seam rule: a line starting exactly at the chunk
    /// seam belongs to the later chunk, which is where the engine reports it
    /// (chunks are half-open), so dedup by `(pattern, offset)` is enough.
    fn emit_matches(
        &self,
        event: &LineEventData,
        chunk: &Chunk,
        fid: &str,
        local: &[Option<regex::Regex>],
        matches: &mut Vec<Match>,
        seen: &mut std::collections::HashSet<(usize, u64)>,
    ) {
        let absolute = chunk.start + event.absolute_offset;
        let line_text = event.line_text().to_string();
        let relative = event.line_number.unwrap_or(0);

        let mut owners: Vec<usize> = Vec::new();
        if local.len() == 1 {
            owners.push(0);
        } else {
            for (i, re) in local.iter().enumerate() {
                if let Some(re) = re {
                    if re.is_match(&line_text) {
                        owners.push(i);
                    }
                }
            }
            if owners.is_empty() {
                owners.push(0);
            }
        }

        for owner in owners {
            if !seen.insert((owner, absolute)) {
                continue;
            }
            let submatches = match local.get(owner).and_then(|r| r.as_ref()) {
                Some(re) if local.len() > 1 => re
                    .find_iter(&line_text)
                    .map(|m| crate::types::Submatch {
                        text: m.as_str().to_string(),
                        start: m.start(),
                        end: m.end(),
                    })
                    .collect(),
                _ => event.submatches(),
            };
            matches.push(Match {
                pattern: pattern_id(owner),
                file: fid.to_string(),
                offset: absolute,
                relative_line_number: relative,
                line_number: None,
                line_text: line_text.clone(),
                submatches,
            });
        }
    }

}

/// Scan one chunk by streaming its bytes into the engine.
fn run_one_chunk(
    path: &Path,
    invocation: &EngineInvocation,
    chunk: Chunk,
    seekable: bool,
    cancel: &CancelToken,
) -> Result<ChunkScan> {
    if seekable {
        let frames = read_seek_table(path)?;
        let bytes = decompress_range(path, &frames, chunk.start, chunk.end - chunk.start)?;
        scan_chunk(invocation, crate::engine::VecSource(bytes), chunk.index, path, cancel)
    } else if chunk.end == u64::MAX {
        // Whole-stream scan (non-seekable compressed input).
        let reader = open_decompressed(path)?;
        scan_chunk(invocation, reader, chunk.index, path, cancel)
    } else {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(chunk.start))?;
        let reader = file.take(chunk.end - chunk.start);
        scan_chunk(invocation, reader, chunk.index, path, cancel)
    }
}

// ---------------------------------------------------------------------------
// Path expansion
// ---------------------------------------------------------------------------

/// Expand validated paths: files pass through, directories expand to their
/// regular files (one level, or fully with `recursive`), input order stable.
pub fn expand_paths(paths: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for path in paths {
        let meta = std::fs::metadata(path)?;
        if meta.is_file() {
            out.push(path.clone());
            continue;
        }
        if !meta.is_dir() {
            continue;
        }
        let mut walker = ignore::WalkBuilder::new(path);
        walker.standard_filters(false).hidden(true).sort_by_file_path(|a, b| a.cmp(b));
        if !recursive {
            walker.max_depth(Some(1));
        }
        for entry in walker.build().flatten() {
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                out.push(entry.into_path());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::engine_available;
    use std::fs;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn driver_for(dir: &Path) -> SearchDriver {
        SearchDriver::new(Config { cache_dir: dir.join("cache"), ..Config::default() })
    }

    #[test]
    fn local_patterns_honor_flags() {
        let plain = compile_local_patterns(&strings(&["Err"]), &[]);
        assert!(plain[0].as_ref().unwrap().is_match("Err"));
        assert!(!plain[0].as_ref().unwrap().is_match("err"));

        let insensitive = compile_local_patterns(&strings(&["Err"]), &strings(&["-i"]));
        assert!(insensitive[0].as_ref().unwrap().is_match("eRR"));

        let fixed = compile_local_patterns(&strings(&["a.b"]), &strings(&["-F"]));
        assert!(fixed[0].as_ref().unwrap().is_match("a.b"));
        assert!(!fixed[0].as_ref().unwrap().is_match("axb"));

        let word = compile_local_patterns(&strings(&["err"]), &strings(&["-w"]));
        assert!(word[0].as_ref().unwrap().is_match("an err here"));
        assert!(!word[0].as_ref().unwrap().is_match("errs"));

        let line = compile_local_patterns(&strings(&["err"]), &strings(&["-x"]));
        assert!(line[0].as_ref().unwrap().is_match("err"));
        assert!(!line[0].as_ref().unwrap().is_match("err "));

        let broken = compile_local_patterns(&strings(&["(?<=look)behind"]), &[]);
        assert!(broken[0].is_none());
    }

    #[test]
    fn semaphore_bounds_concurrency() {
        let semaphore = Arc::new(Semaphore::new(2));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let semaphore = semaphore.clone();
                let live = live.clone();
                let peak = peak.clone();
                scope.spawn(move || {
                    let _permit = semaphore.acquire();
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    live.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn expand_keeps_files_and_lists_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.log"), "b\n").unwrap();
        fs::write(dir.path().join("a.log"), "a\n").unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("c.log"), "c\n").unwrap();

        let flat = expand_paths(&[dir.path().to_path_buf()], false).unwrap();
        let names: Vec<String> = flat
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.log", "b.log"]);

        let deep = expand_paths(&[dir.path().to_path_buf()], true).unwrap();
        assert_eq!(deep.len(), 3);
    }

    #[test]
    fn search_skips_binary_and_scans_text() {
        if !engine_available() {
            eprintln!("rg not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let text = dir.path().join("app.log");
        fs::write(&text, "ok line\nerr one\nfine\nerr two\n").unwrap();
        let binary = dir.path().join("core.bin");
        fs::write(&binary, b"\x00\x01\x02err\x00").unwrap();

        let driver = driver_for(dir.path());
        let request = SearchRequest::new(vec![text.clone(), binary.clone()], strings(&["err"]));
        let outcome = driver.run(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.matches.len(), 2);
        assert_eq!(outcome.matches[0].offset, 8);
        assert_eq!(outcome.matches[0].line_number, Some(2));
        assert_eq!(outcome.matches[0].line_text, "err one");
        assert_eq!(outcome.matches[1].line_number, Some(4));
        assert_eq!(outcome.scanned_files, vec![text]);
        assert_eq!(outcome.skipped_files.len(), 1);
        assert_eq!(outcome.skipped_files[0].path, binary);
    }

    #[test]
    fn search_caps_results_in_offset_order() {
        if !engine_available() {
            eprintln!("rg not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("many.log");
        let mut body = String::new();
        for i in 0..500 {
            if i % 2 == 1 {
                body.push_str(&format!("line {i} err\n"));
            } else {
                body.push_str(&format!("line {i}\n"));
            }
        }
        fs::write(&path, &body).unwrap();

        let driver = driver_for(dir.path());
        let mut request = SearchRequest::new(vec![path], strings(&["err"]));
        request.max_results = Some(10);
        let outcome = driver.run(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.matches.len(), 10);
        assert!(outcome.truncated);
        for pair in outcome.matches.windows(2) {
            assert!(pair[0].offset < pair[1].offset);
        }
    }

    #[test]
    fn multi_pattern_attribution() {
        if !engine_available() {
            eprintln!("rg not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.log");
        fs::write(&path, "an alpha line\na beta line\nboth alpha beta\n").unwrap();

        let driver = driver_for(dir.path());
        let request = SearchRequest::new(vec![path], strings(&["alpha", "beta"]));
        let outcome = driver.run(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.patterns.len(), 2);
        let p1: Vec<_> = outcome.matches.iter().filter(|m| m.pattern == "p1").collect();
        let p2: Vec<_> = outcome.matches.iter().filter(|m| m.pattern == "p2").collect();
        assert_eq!(p1.len(), 2, "alpha on lines 1 and 3");
        assert_eq!(p2.len(), 2, "beta on lines 2 and 3");
        // The shared line produced one match per owning pattern.
        let both: Vec<_> = outcome.matches.iter().filter(|m| m.line_text.contains("both")).collect();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn context_lines_attach_to_matches() {
        if !engine_available() {
            eprintln!("rg not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.log");
        fs::write(&path, "before1\nbefore2\nhit err\nafter1\nafter2\n").unwrap();

        let driver = driver_for(dir.path());
        let mut request = SearchRequest::new(vec![path], strings(&["err"]));
        request.before_context = 1;
        request.after_context = 1;
        let outcome = driver.run(&request, &CancelToken::new()).unwrap();

        assert_eq!(outcome.matches.len(), 1);
        let m = &outcome.matches[0];
        let key = context_key(&m.pattern, &m.file, m.offset);
        let lines = outcome.context_lines.get(&key).expect("context recorded");
        let texts: Vec<&str> = lines.iter().map(|l| l.line_text.as_str()).collect();
        assert!(texts.contains(&"before2"));
        assert!(texts.contains(&"after1"));
    }

    #[test]
    fn canceled_token_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.log");
        fs::write(&path, "err\n").unwrap();
        let driver = driver_for(dir.path());
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome =
            driver.run(&SearchRequest::new(vec![path], strings(&["err"])), &cancel).unwrap();
        assert!(outcome.matches.is_empty());
    }

    #[test]
    fn searches_gzip_stream() {
        if !engine_available() {
            eprintln!("rg not available; skipping");
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("z.gz");
        let mut enc =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        std::io::Write::write_all(&mut enc, b"nope\nerr inside gzip\nnope\n").unwrap();
        fs::write(&path, enc.finish().unwrap()).unwrap();

        let driver = driver_for(dir.path());
        let outcome = driver
            .run(&SearchRequest::new(vec![path], strings(&["err"])), &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.matches.len(), 1);
        assert_eq!(outcome.matches[0].line_text, "err inside gzip");
        // Single streaming chunk starting at zero: line numbers are absolute.
        assert_eq!(outcome.matches[0].line_number, Some(2));
    }
}
