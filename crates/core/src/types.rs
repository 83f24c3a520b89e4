//! Core types shared across the rx engine: file identity, match results,
//! skip records, and the outcome envelope returned by the search driver.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::Result;

// ---------------------------------------------------------------------------
// File identity
// ---------------------------------------------------------------------------

/// A file is identified internally by `(size, mtime)`. Any cache entry keyed
/// on an identity becomes invalid the moment either component changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub size_bytes: u64,
    /// Modification time in whole milliseconds since the Unix epoch.
    pub modified_ms: u64,
}

impl FileIdentity {
    /// Stat `path` and capture its current identity.
    pub fn of(path: &Path) -> Result<FileIdentity> {
        let meta = std::fs::metadata(path)?;
        let modified_ms = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Ok(FileIdentity { size_bytes: meta.len(), modified_ms })
    }
}

/// Milliseconds since the Unix epoch, for `created_at`-style stamps.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Line endings
// ---------------------------------------------------------------------------

/// Detected line-terminator style of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LineEnding {
    #[serde(rename = "LF")]
    Lf,
    #[serde(rename = "CRLF")]
    CrLf,
    #[serde(rename = "CR")]
    Cr,
    #[serde(rename = "mixed")]
    Mixed,
}

impl std::fmt::Display for LineEnding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LineEnding::Lf => "LF",
            LineEnding::CrLf => "CRLF",
            LineEnding::Cr => "CR",
            LineEnding::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Match results
// ---------------------------------------------------------------------------

/// A matched span within a line. `start`/`end` are byte columns relative to
/// the line start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submatch {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// A non-matching line shown because before/after context was requested.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextLine {
    /// 1-based line number. Relative to the scanned range until a file's
    /// results are enriched, absolute afterwards.
    pub line_number: u64,
    pub line_text: String,
    /// Byte offset of this line's start within the file, when known.
    pub absolute_offset: Option<u64>,
}

/// A single match. Pattern and file are referenced through short opaque ids
/// (`p1`, `f2`, …) resolved via the lookup tables on [`TraceOutcome`], which
/// keeps the match list compact when patterns or paths are long.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Match {
    /// Pattern id (`p1`, `p2`, …).
    pub pattern: String,
    /// File id (`f1`, `f2`, …).
    pub file: String,
    /// Absolute byte offset of the matched line's first byte.
    pub offset: u64,
    /// 1-based line number relative to the scanned byte range.
    pub relative_line_number: u64,
    /// 1-based line number within the whole file; `None` when no valid
    /// line-offset index was available to resolve it.
    pub line_number: Option<u64>,
    /// The matched line, terminator stripped.
    pub line_text: String,
    pub submatches: Vec<Submatch>,
}

/// Why a file was skipped rather than scanned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Composite key for context-line groups: `"<pattern>:<file>:<offset>"`.
pub fn context_key(pattern_id: &str, file_id: &str, offset: u64) -> String {
    format!("{pattern_id}:{file_id}:{offset}")
}

/// Build the `p1`/`f1`-style id for a zero-based index.
pub fn pattern_id(index: usize) -> String {
    format!("p{}", index + 1)
}

pub fn file_id(index: usize) -> String {
    format!("f{}", index + 1)
}

/// Recover the zero-based index from a `p3`/`f3`-style id.
pub fn id_index(id: &str) -> Option<usize> {
    id.get(1..)?.parse::<usize>().ok().and_then(|n| n.checked_sub(1))
}

// ---------------------------------------------------------------------------
// Search outcome
// ---------------------------------------------------------------------------

/// The result envelope of one search operation across one or many files.
///
/// Within a file, matches are in ascending byte offset; across files, order
/// follows file-id assignment (stable with input order).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TraceOutcome {
    /// Pattern id -> pattern text.
    pub patterns: BTreeMap<String, String>,
    /// File id -> absolute path.
    pub files: BTreeMap<String, String>,
    pub matches: Vec<Match>,
    pub scanned_files: Vec<PathBuf>,
    pub skipped_files: Vec<SkippedFile>,
    /// Context lines grouped per match, keyed by [`context_key`]. Empty when
    /// no context was requested.
    pub context_lines: BTreeMap<String, Vec<ContextLine>>,
    /// True when the global `max_results` cap stopped the scan early.
    pub truncated: bool,
    /// Wall-clock duration of the operation in seconds.
    pub time: f64,
}

impl TraceOutcome {
    /// Resolve a match's pattern text.
    pub fn pattern_text(&self, m: &Match) -> Option<&str> {
        self.patterns.get(&m.pattern).map(String::as_str)
    }

    /// Resolve a match's file path.
    pub fn file_path(&self, m: &Match) -> Option<&str> {
        self.files.get(&m.file).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancel token. The driver checks it between events and signals
/// outstanding subprocesses when it trips; already-buffered events are
/// discarded. Timeouts behave exactly like a cancel.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(std::sync::atomic::Ordering::SeqCst)
    }
}
