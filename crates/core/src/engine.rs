//! External regex-engine protocol.
//!
//! The core depends only on a subprocess (`rg`) that can be invoked with a
//! pattern list and emits one JSON object per line on stdout. This module
//! owns the event model, the streaming parser, and the subprocess plumbing;
//! nothing else in the crate touches the engine binary, so tests can replay
//! recorded event streams instead.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::error::{Result, RxError};
use crate::types::{CancelToken, Submatch};

/// Engine binary name, resolved through `PATH`.
pub const ENGINE_BIN: &str = "rg";

/// Flags that change which bytes match. Only these participate in the trace
/// cache key; cosmetic flags are not hashed.
pub const MATCHING_FLAGS: &[&str] =
    &["-i", "--ignore-case", "--case-sensitive", "-w", "-x", "-F", "-P"];

/// The matching-affecting subset of `flags`, sorted for stable hashing.
pub fn matching_flags(flags: &[String]) -> Vec<String> {
    let mut relevant: Vec<String> =
        flags.iter().filter(|f| MATCHING_FLAGS.contains(&f.as_str())).cloned().collect();
    relevant.sort();
    relevant.dedup();
    relevant
}

// ---------------------------------------------------------------------------
// Event model (one JSON object per stdout line)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct PathText {
    pub text: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LinesText {
    pub text: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SubmatchWire {
    #[serde(rename = "match")]
    pub matched: LinesText,
    /// Byte column within the line where the submatch starts.
    pub start: usize,
    pub end: usize,
}

/// Payload shared by `match` and `context` events.
#[derive(Clone, Debug, Deserialize)]
pub struct LineEventData {
    pub path: Option<PathText>,
    pub lines: LinesText,
    /// 1-based line number within the scanned range.
    pub line_number: Option<u64>,
    /// Byte offset of the line start, relative to the start of the scan.
    pub absolute_offset: u64,
    #[serde(default)]
    pub submatches: Vec<SubmatchWire>,
}

impl LineEventData {
    /// Line content with the terminator stripped.
    pub fn line_text(&self) -> &str {
        self.lines.text.trim_end_matches(['\n', '\r'])
    }

    pub fn submatches(&self) -> Vec<Submatch> {
        self.submatches
            .iter()
            .map(|s| Submatch { text: s.matched.text.clone(), start: s.start, end: s.end })
            .collect()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BeginData {
    pub path: Option<PathText>,
}

/// Per-scan statistics carried by `end` events. Unknown sibling fields
/// (timings etc.) are ignored.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
pub struct EngineStats {
    #[serde(default)]
    pub bytes_searched: u64,
    #[serde(default)]
    pub matched_lines: u64,
    #[serde(default)]
    pub matches: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EndData {
    pub path: Option<PathText>,
    pub stats: Option<EngineStats>,
}

/// One parsed engine event. Unknown event types land on `Other` and are
/// treated as noise.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EngineEvent {
    Begin { data: BeginData },
    Match { data: LineEventData },
    Context { data: LineEventData },
    End { data: EndData },
    Summary { data: serde_json::Value },
    #[serde(other)]
    Other,
}

/// Parse one stdout line. A malformed line is an error — the driver fails
/// the owning chunk; blank lines are the caller's to skip.
pub fn parse_event(line: &str) -> std::result::Result<EngineEvent, serde_json::Error> {
    serde_json::from_str(line)
}

// ---------------------------------------------------------------------------
// Invocation
// ---------------------------------------------------------------------------

/// Everything needed to start one engine subprocess over a byte stream.
#[derive(Clone, Debug, Default)]
pub struct EngineInvocation {
    pub patterns: Vec<String>,
    /// Raw pass-through flags (e.g. `-i`, `-w`).
    pub flags: Vec<String>,
    pub before_context: usize,
    pub after_context: usize,
}

impl EngineInvocation {
    /// Engine command reading the scan bytes from stdin.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(ENGINE_BIN);
        cmd.arg("--json");
        for pattern in &self.patterns {
            cmd.arg("-e").arg(pattern);
        }
        for flag in &self.flags {
            cmd.arg(flag);
        }
        if self.before_context > 0 {
            cmd.arg("-B").arg(self.before_context.to_string());
        }
        if self.after_context > 0 {
            cmd.arg("-A").arg(self.after_context.to_string());
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }
}

/// Probe whether the engine binary is on `PATH`.
pub fn engine_available() -> bool {
    Command::new(ENGINE_BIN)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Chunk scanning
// ---------------------------------------------------------------------------

/// Raw results of scanning one chunk, offsets still chunk-relative.
#[derive(Clone, Debug, Default)]
pub struct ChunkScan {
    pub matches: Vec<LineEventData>,
    /// `(index into matches of the nearest preceding match, context line)`.
    pub contexts: Vec<(Option<usize>, LineEventData)>,
    pub stats: Option<EngineStats>,
}

/// Run the engine over `source`, streaming events as they arrive.
///
/// Context events attach to the nearest preceding match of the chunk.
/// Exit status 1 (scanned, nothing matched) is success; any other non-zero
/// status fails the chunk with stderr as the cause, except a pattern error,
/// which is fatal for the whole job.
pub fn scan_chunk<R: Read + Send>(
    invocation: &EngineInvocation,
    source: R,
    chunk_index: usize,
    path_for_errors: &std::path::Path,
    cancel: &CancelToken,
) -> Result<ChunkScan> {
    let mut child = invocation.command().spawn().map_err(|e| RxError::ChunkFailure {
        path: path_for_errors.to_path_buf(),
        index: chunk_index,
        cause: format!("failed to spawn {ENGINE_BIN}: {e}"),
    })?;

    let mut stdin = child.stdin.take().expect("stdin was piped");
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let scan_result = std::thread::scope(|scope| {
        // Feed the byte range on a separate thread; the engine may exit
        // early (e.g. binary detection), so a broken pipe is not an error.
        scope.spawn(move || {
            let mut source = source;
            let _ = std::io::copy(&mut source, &mut stdin);
        });

        let mut scan = ChunkScan::default();
        let mut malformed: Option<String> = None;
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            if cancel.is_canceled() {
                let _ = child.kill();
                return Err(RxError::Canceled);
            }
            let line = line.map_err(|e| RxError::ChunkFailure {
                path: path_for_errors.to_path_buf(),
                index: chunk_index,
                cause: format!("engine stdout read failed: {e}"),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_event(&line) {
                Ok(EngineEvent::Match { data }) => scan.matches.push(data),
                Ok(EngineEvent::Context { data }) => {
                    let anchor = scan.matches.len().checked_sub(1);
                    scan.contexts.push((anchor, data));
                }
                Ok(EngineEvent::End { data }) => scan.stats = data.stats,
                Ok(_) => {}
                Err(e) => {
                    // Drain the stream but remember the first malformed line.
                    if malformed.is_none() {
                        malformed = Some(format!("malformed engine event: {e}"));
                    }
                }
            }
        }
        match malformed {
            Some(cause) => Err(RxError::ChunkFailure {
                path: path_for_errors.to_path_buf(),
                index: chunk_index,
                cause,
            }),
            None => Ok(scan),
        }
    });

    let status = child.wait().map_err(RxError::Io)?;
    let scan = scan_result?;

    if !status.success() && status.code() != Some(1) {
        let mut err_text = String::new();
        let _ = stderr.read_to_string(&mut err_text);
        let err_text = err_text.trim().to_string();
        if err_text.contains("regex parse error") || err_text.contains("error parsing pattern") {
            return Err(RxError::RegexInvalid(err_text));
        }
        return Err(RxError::ChunkFailure {
            path: path_for_errors.to_path_buf(),
            index: chunk_index,
            cause: if err_text.is_empty() {
                format!("engine exited with {status}")
            } else {
                err_text
            },
        });
    }
    Ok(scan)
}

/// Write-side helper for drivers that stream a computed byte range (e.g. a
/// decompressed frame span) instead of a file slice.
pub struct VecSource(pub Vec<u8>);

impl Read for VecSource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = buf.len().min(self.0.len());
        buf[..n].copy_from_slice(&self.0[..n]);
        self.0.drain(..n);
        Ok(n)
    }
}
