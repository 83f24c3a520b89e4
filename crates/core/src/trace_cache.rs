//! Trace cache: persisted match lists for complete scans of large files,
//! keyed by file identity plus pattern set.
//!
//! Match bodies on disk are minimal — `(pattern_index, offset, line_number)` —
//! so the record size is bounded by match count, independent of line length.
//! Rich fields (`line_text`, `submatches`) are reconstructed on read: one
//! seek per match through the line-offset index, then the pattern re-applied
//! locally to the just-read line.
//!
//! Layout: `<cache_root>/trace_cache/<patterns_hash>/<path_hash>_<basename>.json`
//! with both hashes being 16-char SHA-256 prefixes. The basename is preserved
//! for human grepping.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::matching_flags;
use crate::error::{Result, RxError};
use crate::index::{line_info_for_offsets, short_hash, UnifiedFileIndex};
use crate::types::{now_ms, FileIdentity, Match, Submatch};

/// Record format version; mismatches are misses.
pub const TRACE_CACHE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// Minimal persisted body of one match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMatch {
    pub pattern_index: usize,
    /// Absolute byte offset of the matched line's start.
    pub offset: u64,
    /// Absolute 1-based line number. Records are only written once
    /// enrichment resolved every line number.
    pub line_number: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TraceCacheRecord {
    pub version: u32,
    pub source_path: String,
    pub source_size_bytes: u64,
    pub source_modified_ms: u64,
    /// The full pattern list, sorted.
    pub patterns: Vec<String>,
    pub patterns_hash: String,
    /// Matching-affecting flags only, sorted.
    pub matching_flags: Vec<String>,
    pub created_ms: u64,
    pub matches: Vec<CachedMatch>,
}

// ---------------------------------------------------------------------------
// Keys and paths
// ---------------------------------------------------------------------------

/// Hash over `{flags: sorted matching-only, patterns: sorted}`. Only the
/// matching-relevant flag subset enters the key.
pub fn patterns_hash(patterns: &[String], flags: &[String]) -> String {
    let mut sorted_patterns = patterns.to_vec();
    sorted_patterns.sort();
    let relevant = matching_flags(flags);
    let input = json!({ "flags": relevant, "patterns": sorted_patterns });
    short_hash(&input.to_string())
}

/// Cache file path for `(source, patterns, flags)`.
pub fn trace_cache_path(
    config: &Config,
    source: &Path,
    patterns: &[String],
    flags: &[String],
) -> PathBuf {
    let path_hash = short_hash(&source.display().to_string());
    let basename = source.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    config
        .trace_cache_dir()
        .join(patterns_hash(patterns, flags))
        .join(format!("{path_hash}_{basename}.json"))
}

// ---------------------------------------------------------------------------
// Load / save / validity
// ---------------------------------------------------------------------------

/// Load a record and check it against the source's current identity and the
/// requested pattern set. Any problem is a miss.
pub fn load_valid(
    config: &Config,
    source: &Path,
    patterns: &[String],
    flags: &[String],
) -> Option<TraceCacheRecord> {
    let path = trace_cache_path(config, source, patterns, flags);
    let raw = std::fs::read_to_string(&path).ok()?;
    let record: TraceCacheRecord = match serde_json::from_str(&raw) {
        Ok(r) => r,
        Err(e) => {
            warn!("unreadable trace cache {}: {e}", path.display());
            return None;
        }
    };
    if record.version != TRACE_CACHE_VERSION {
        debug!("trace cache version mismatch for {}", source.display());
        return None;
    }
    let identity = FileIdentity::of(source).ok()?;
    if identity.size_bytes != record.source_size_bytes
        || identity.modified_ms != record.source_modified_ms
    {
        debug!("trace cache stale for {}", source.display());
        return None;
    }
    if record.patterns_hash != patterns_hash(patterns, flags) {
        debug!("trace cache pattern mismatch for {}", source.display());
        return None;
    }
    info!("trace cache hit for {} ({} matches)", source.display(), record.matches.len());
    Some(record)
}

/// Build a record from enriched matches. Returns `None` when any match lacks
/// an absolute line number — such a scan is not cacheable.
pub fn build_record(
    source: &Path,
    patterns: &[String],
    flags: &[String],
    matches: &[(usize, u64, Option<u64>)],
) -> Option<TraceCacheRecord> {
    let identity = FileIdentity::of(source).ok()?;
    let mut cached = Vec::with_capacity(matches.len());
    for &(pattern_index, offset, line_number) in matches {
        cached.push(CachedMatch { pattern_index, offset, line_number: line_number? });
    }
    let mut sorted_patterns = patterns.to_vec();
    sorted_patterns.sort();
    Some(TraceCacheRecord {
        version: TRACE_CACHE_VERSION,
        source_path: source.display().to_string(),
        source_size_bytes: identity.size_bytes,
        source_modified_ms: identity.modified_ms,
        patterns: sorted_patterns,
        patterns_hash: patterns_hash(patterns, flags),
        matching_flags: matching_flags(flags),
        created_ms: now_ms(),
        matches: cached,
    })
}

/// Persist a record with the usual temp-file-and-rename dance.
pub fn save_record(
    config: &Config,
    source: &Path,
    patterns: &[String],
    flags: &[String],
    record: &TraceCacheRecord,
) -> Result<()> {
    let path = trace_cache_path(config, source, patterns, flags);
    let dir = path.parent().ok_or_else(|| RxError::CacheIo("no cache parent".into()))?;
    std::fs::create_dir_all(dir).map_err(|e| RxError::CacheIo(e.to_string()))?;
    let body = serde_json::to_string(record).map_err(|e| RxError::CacheIo(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &body).map_err(|e| RxError::CacheIo(e.to_string()))?;
    std::fs::rename(&tmp, &path).map_err(|e| RxError::CacheIo(e.to_string()))?;
    info!("trace cache saved to {}", path.display());
    Ok(())
}

pub fn delete_record(
    config: &Config,
    source: &Path,
    patterns: &[String],
    flags: &[String],
) -> bool {
    std::fs::remove_file(trace_cache_path(config, source, patterns, flags)).is_ok()
}

/// Remove the whole trace-cache tree; returns deleted record count.
pub fn clear_all(config: &Config) -> usize {
    let root = config.trace_cache_dir();
    let mut removed = 0;
    if let Ok(buckets) = std::fs::read_dir(&root) {
        for bucket in buckets.flatten() {
            if let Ok(entries) = std::fs::read_dir(bucket.path()) {
                for entry in entries.flatten() {
                    if std::fs::remove_file(entry.path()).is_ok() {
                        removed += 1;
                    }
                }
            }
            let _ = std::fs::remove_dir(bucket.path());
        }
    }
    removed
}

/// Eligibility: large file, no result cap, and the scan completed without any
/// subprocess failure.
pub fn is_cacheable(config: &Config, size: u64, max_results: Option<usize>, complete: bool) -> bool {
    config.is_large_file(size) && max_results.is_none() && complete
}

// ---------------------------------------------------------------------------
// Reconstruction
// ---------------------------------------------------------------------------

/// Rebuild rich matches from a cached record: read each line's text through
/// the index in one batched pass, then re-apply the owning pattern locally to
/// recover submatch positions.
pub fn reconstruct_matches(
    source: &Path,
    record: &TraceCacheRecord,
    local: &[Option<regex::Regex>],
    index: &UnifiedFileIndex,
    file_id: &str,
) -> Result<Vec<Match>> {
    let offsets: Vec<u64> = record.matches.iter().map(|m| m.offset).collect();
    let infos = line_info_for_offsets(source, index, &offsets)?;

    let mut file = std::fs::File::open(source)?;
    let mut out = Vec::with_capacity(record.matches.len());
    for cached in &record.matches {
        let line_text = match infos.get(&cached.offset) {
            Some(info) => {
                read_line_at(&mut file, info.line_start_offset, info.line_end_offset)?
            }
            None => String::new(),
        };
        let submatches = match local.get(cached.pattern_index).and_then(|r| r.as_ref()) {
            Some(re) => re
                .find_iter(&line_text)
                .map(|m| Submatch { text: m.as_str().to_string(), start: m.start(), end: m.end() })
                .collect(),
            None => Vec::new(),
        };
        out.push(Match {
            pattern: crate::types::pattern_id(cached.pattern_index),
            file: file_id.to_string(),
            offset: cached.offset,
            relative_line_number: cached.line_number,
            line_number: Some(cached.line_number),
            line_text,
            submatches,
        });
    }
    Ok(out)
}

fn read_line_at(file: &mut std::fs::File, start: u64, end: u64) -> Result<String> {
    use std::io::{Read, Seek, SeekFrom};
    file.seek(SeekFrom::Start(start))?;
    let mut buf = vec![0u8; (end - start) as usize];
    file.read_exact(&mut buf)?;
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Summary view of an existing cache record, for the CLI `cache info`
/// subcommand and the HTTP layer.
pub fn record_info(record: &TraceCacheRecord) -> BTreeMap<String, serde_json::Value> {
    let mut info = BTreeMap::new();
    info.insert("source_path".into(), json!(record.source_path));
    info.insert("source_size_bytes".into(), json!(record.source_size_bytes));
    info.insert("patterns".into(), json!(record.patterns));
    info.insert("patterns_hash".into(), json!(record.patterns_hash));
    info.insert("matching_flags".into(), json!(record.matching_flags));
    info.insert("match_count".into(), json!(record.matches.len()));
    info.insert("created_ms".into(), json!(record.created_ms));
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{build_index, BuildOptions};
    use std::fs;

    fn test_config(dir: &Path) -> Config {
        Config { cache_dir: dir.join("cache"), ..Config::default() }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn hash_ignores_pattern_order_and_cosmetic_flags() {
        let a = patterns_hash(&strings(&["foo", "bar"]), &strings(&["-i", "--color"]));
        let b = patterns_hash(&strings(&["bar", "foo"]), &strings(&["--heading", "-i"]));
        assert_eq!(a, b);

        let c = patterns_hash(&strings(&["foo", "bar"]), &strings(&["-w"]));
        assert_ne!(a, c);
        let d = patterns_hash(&strings(&["foo"]), &strings(&["-i"]));
        assert_ne!(a, d);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn cache_path_buckets_by_patterns_hash() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let source = dir.path().join("app.log");
        let path = trace_cache_path(&config, &source, &strings(&["err"]), &[]);
        let bucket = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(bucket, patterns_hash(&strings(&["err"]), &[]));
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with("_app.log.json"));
    }

    #[test]
    fn save_load_round_trip_and_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let source = dir.path().join("big.log");
        fs::write(&source, "alpha err one\nbeta\ngamma err two\n").unwrap();
        let patterns = strings(&["err"]);

        let record =
            build_record(&source, &patterns, &[], &[(0, 0, Some(1)), (0, 20, Some(3))]).unwrap();
        save_record(&config, &source, &patterns, &[], &record).unwrap();

        let loaded = load_valid(&config, &source, &patterns, &[]).unwrap();
        assert_eq!(loaded.matches.len(), 2);
        assert_eq!(loaded.matches[0], CachedMatch { pattern_index: 0, offset: 0, line_number: 1 });

        // Different patterns: no record in that bucket.
        assert!(load_valid(&config, &source, &strings(&["other"]), &[]).is_none());

        // Size change invalidates.
        let mut data = fs::read(&source).unwrap();
        data.push(b'x');
        fs::write(&source, data).unwrap();
        assert!(load_valid(&config, &source, &patterns, &[]).is_none());
    }

    #[test]
    fn unresolved_line_numbers_block_record_creation() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("x.log");
        fs::write(&source, "err\n").unwrap();
        assert!(build_record(&source, &strings(&["err"]), &[], &[(0, 0, None)]).is_none());
    }

    #[test]
    fn eligibility_rules() {
        let config = Config::default();
        let big = config.large_file_threshold;
        assert!(is_cacheable(&config, big, None, true));
        assert!(is_cacheable(&config, big + 1, None, true));
        assert!(!is_cacheable(&config, big - 1, None, true));
        assert!(!is_cacheable(&config, big, Some(10), true));
        assert!(!is_cacheable(&config, big, None, false));
    }

    #[test]
    fn reconstruction_restores_text_and_submatches() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let source = dir.path().join("r.log");
        fs::write(&source, "one err here\nclean line\nerr at start\n").unwrap();

        let index = build_index(&source, &config, BuildOptions::default()).unwrap();
        let patterns = strings(&["err"]);
        let record =
            build_record(&source, &patterns, &[], &[(0, 0, Some(1)), (0, 24, Some(3))]).unwrap();

        let local = vec![Some(regex::Regex::new("err").unwrap())];
        let matches = reconstruct_matches(&source, &record, &local, &index, "f1").unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].line_text, "one err here");
        assert_eq!(matches[0].submatches, vec![Submatch { text: "err".into(), start: 4, end: 7 }]);
        assert_eq!(matches[1].line_text, "err at start");
        assert_eq!(matches[1].submatches[0].start, 0);
        assert_eq!(matches[1].line_number, Some(3));
    }

    #[test]
    fn clear_all_removes_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let source = dir.path().join("c.log");
        fs::write(&source, "err\n").unwrap();
        let patterns = strings(&["err"]);
        let record = build_record(&source, &patterns, &[], &[(0, 0, Some(1))]).unwrap();
        save_record(&config, &source, &patterns, &[], &record).unwrap();
        assert_eq!(clear_all(&config), 1);
        assert_eq!(clear_all(&config), 0);
    }
}
