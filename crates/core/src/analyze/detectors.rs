//! The anomaly detector library.
//!
//! Detectors are value types holding their tunables; the registry is an
//! explicit constructor list read by everything that enumerates detectors.
//! Each detector decides per line, may merge multi-line ranges through
//! `should_merge_with_previous`, and can advertise prescan regexes so the
//! external engine can find candidate lines at full I/O speed.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{LineContext, Window};

/// Closed category set. Every range carries exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Error,
    Warning,
    Traceback,
    Format,
    Security,
    Timing,
    Multiline,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Error => "error",
            Category::Warning => "warning",
            Category::Traceback => "traceback",
            Category::Format => "format",
            Category::Security => "security",
            Category::Timing => "timing",
            Category::Multiline => "multiline",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Category::Error => "error and failure keywords",
            Category::Warning => "warning keywords",
            Category::Traceback => "stack traces and panics",
            Category::Format => "lines deviating from the dominant format",
            Category::Security => "likely secrets or tokens",
            Category::Timing => "unusual gaps between timestamps",
            Category::Multiline => "multi-line blocks (indented dumps)",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-line anomaly detector contract.
pub trait Detector: Send {
    fn name(&self) -> &'static str;
    fn category(&self) -> Category;

    /// Severity in `[0, 1]` when the line is anomalous.
    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64>;

    /// Extend the detector's open range over `ctx`'s line.
    fn should_merge_with_previous(&self, _ctx: &LineContext<'_>, _prev_severity: f64) -> bool {
        false
    }

    /// Human description for a merged range.
    fn describe(&self, lines: &[String]) -> String;

    /// `(pattern, severity)` pairs the engine can prescan with. Detectors
    /// without prescan patterns run only in the streaming pass.
    fn prescan_patterns(&self) -> Vec<(String, f64)> {
        Vec::new()
    }

    /// Advertised severity range, for the detector catalog.
    fn severity_range(&self) -> (f64, f64);
}

fn first_line_snippet(lines: &[String]) -> String {
    let first = lines.first().map(String::as_str).unwrap_or("");
    let mut snippet: String = first.trim().chars().take(80).collect();
    if first.trim().chars().count() > 80 {
        snippet.push('…');
    }
    snippet
}

// ---------------------------------------------------------------------------
// traceback
// ---------------------------------------------------------------------------

/// Python/Java/Go/Rust/Node stack traces, merged until continuation breaks.
pub struct TracebackDetector {
    starts: Vec<(Regex, f64)>,
    continuations: Vec<Regex>,
}

impl Default for TracebackDetector {
    fn default() -> Self {
        let starts = vec![
            (Regex::new(r"^Traceback \(most recent call last\):").unwrap(), 0.9),
            (Regex::new(r"^thread '[^']+' panicked at").unwrap(), 0.9),
            (Regex::new(r"^panic:").unwrap(), 0.9),
            (Regex::new(r"^goroutine \d+ \[").unwrap(), 0.85),
            (Regex::new(r"^(?:[\w$]+\.)+[\w$]*(?:Exception|Error)(?::|$)").unwrap(), 0.85),
        ];
        let continuations = vec![
            Regex::new(r#"^\s+File ""#).unwrap(),
            Regex::new(r"^\s+at\s\S").unwrap(),
            Regex::new(r"^\tat\s").unwrap(),
            Regex::new(r"^\s+\.\.\.\s*\d*").unwrap(),
            Regex::new(r"^\s+Caused by:").unwrap(),
            Regex::new(r"^Caused by:").unwrap(),
            Regex::new(r"^\s{2,}\S").unwrap(),
            Regex::new(r"^\w+(?:Error|Exception)\b").unwrap(),
            Regex::new(r"^created by ").unwrap(),
        ];
        TracebackDetector { starts, continuations }
    }
}

impl Detector for TracebackDetector {
    fn name(&self) -> &'static str {
        "traceback"
    }

    fn category(&self) -> Category {
        Category::Traceback
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        self.starts.iter().find(|(re, _)| re.is_match(ctx.line)).map(|(_, sev)| *sev)
    }

    fn should_merge_with_previous(&self, ctx: &LineContext<'_>, _prev: f64) -> bool {
        !ctx.line.is_empty() && self.continuations.iter().any(|re| re.is_match(ctx.line))
    }

    fn describe(&self, lines: &[String]) -> String {
        format!("Stack traceback ({} lines)", lines.len())
    }

    fn prescan_patterns(&self) -> Vec<(String, f64)> {
        vec![
            (r"^Traceback \(most recent call last\):".into(), 0.9),
            (r"^thread '[^']+' panicked at".into(), 0.9),
            (r"^panic:".into(), 0.9),
        ]
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.85, 0.9)
    }
}

// ---------------------------------------------------------------------------
// error_keyword / warning_keyword
// ---------------------------------------------------------------------------

/// ERROR/FATAL/CRITICAL/PANIC/Exception tokens, word-bounded.
pub struct ErrorKeywordDetector {
    pattern: Regex,
}

impl Default for ErrorKeywordDetector {
    fn default() -> Self {
        ErrorKeywordDetector {
            pattern: Regex::new(r"\b(ERROR|FATAL|CRITICAL|PANIC|Exception)\b").unwrap(),
        }
    }
}

impl ErrorKeywordDetector {
    fn severity_for(keyword: &str) -> f64 {
        match keyword {
            "FATAL" | "CRITICAL" | "PANIC" => 0.95,
            "ERROR" => 0.8,
            _ => 0.7, // Exception
        }
    }
}

impl Detector for ErrorKeywordDetector {
    fn name(&self) -> &'static str {
        "error_keyword"
    }

    fn category(&self) -> Category {
        Category::Error
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        self.pattern
            .captures_iter(ctx.line)
            .map(|c| Self::severity_for(c.get(1).map(|m| m.as_str()).unwrap_or("")))
            .fold(None, |acc: Option<f64>, sev| Some(acc.map_or(sev, |a| a.max(sev))))
    }

    fn should_merge_with_previous(&self, ctx: &LineContext<'_>, _prev: f64) -> bool {
        // Consecutive keyword lines form one range.
        self.pattern.is_match(ctx.line)
    }

    fn describe(&self, lines: &[String]) -> String {
        format!("Error keyword: {}", first_line_snippet(lines))
    }

    fn prescan_patterns(&self) -> Vec<(String, f64)> {
        vec![(r"\b(ERROR|FATAL|CRITICAL|PANIC|Exception)\b".into(), 0.8)]
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.7, 0.95)
    }
}

/// WARN/WARNING tokens.
pub struct WarningKeywordDetector {
    pattern: Regex,
}

impl Default for WarningKeywordDetector {
    fn default() -> Self {
        WarningKeywordDetector { pattern: Regex::new(r"\b(?:WARN|WARNING)\b").unwrap() }
    }
}

impl Detector for WarningKeywordDetector {
    fn name(&self) -> &'static str {
        "warning_keyword"
    }

    fn category(&self) -> Category {
        Category::Warning
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        self.pattern.is_match(ctx.line).then_some(0.45)
    }

    fn should_merge_with_previous(&self, ctx: &LineContext<'_>, _prev: f64) -> bool {
        self.pattern.is_match(ctx.line)
    }

    fn describe(&self, lines: &[String]) -> String {
        format!("Warning keyword: {}", first_line_snippet(lines))
    }

    fn prescan_patterns(&self) -> Vec<(String, f64)> {
        vec![(r"\b(?:WARN|WARNING)\b".into(), 0.45)]
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.45, 0.45)
    }
}

// ---------------------------------------------------------------------------
// line_length_spike
// ---------------------------------------------------------------------------

/// Lines whose length deviates more than `z_threshold` standard deviations
/// from the running mean. Severity scales with the z-score.
pub struct LineLengthSpikeDetector {
    pub min_len: usize,
    pub z_threshold: f64,
    pub warmup_lines: u64,
}

impl Default for LineLengthSpikeDetector {
    fn default() -> Self {
        LineLengthSpikeDetector { min_len: 200, z_threshold: 3.0, warmup_lines: 50 }
    }
}

impl Detector for LineLengthSpikeDetector {
    fn name(&self) -> &'static str {
        "line_length_spike"
    }

    fn category(&self) -> Category {
        Category::Format
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        if ctx.number <= self.warmup_lines || ctx.stddev_len <= f64::EPSILON {
            return None;
        }
        let len = ctx.line.len();
        if len < self.min_len {
            return None;
        }
        let z = (len as f64 - ctx.mean_len).abs() / ctx.stddev_len;
        if z > self.z_threshold {
            Some((0.3 + z / 20.0).min(0.9))
        } else {
            None
        }
    }

    fn describe(&self, lines: &[String]) -> String {
        let max = lines.iter().map(String::len).max().unwrap_or(0);
        format!("Line length spike ({max} chars)")
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.3, 0.9)
    }
}

// ---------------------------------------------------------------------------
// indentation_block
// ---------------------------------------------------------------------------

/// Runs of indented, non-trivial lines (dumps, wrapped payloads). Fires once
/// the run reaches `min_lines` and merges for as long as it continues.
pub struct IndentationBlockDetector {
    pub min_lines: usize,
    pub min_len: usize,
    consecutive: usize,
}

impl Default for IndentationBlockDetector {
    fn default() -> Self {
        IndentationBlockDetector { min_lines: 5, min_len: 40, consecutive: 0 }
    }
}

impl IndentationBlockDetector {
    fn qualifies(&self, line: &str) -> bool {
        line.starts_with([' ', '\t']) && line.trim().len() >= self.min_len
    }
}

impl Detector for IndentationBlockDetector {
    fn name(&self) -> &'static str {
        "indentation_block"
    }

    fn category(&self) -> Category {
        Category::Multiline
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        if self.qualifies(ctx.line) {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        (self.consecutive == self.min_lines).then_some(0.35)
    }

    fn should_merge_with_previous(&self, ctx: &LineContext<'_>, _prev: f64) -> bool {
        self.qualifies(ctx.line)
    }

    fn describe(&self, lines: &[String]) -> String {
        format!("Indented block ({} lines)", lines.len())
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.35, 0.35)
    }
}

// ---------------------------------------------------------------------------
// json_dump
// ---------------------------------------------------------------------------

/// Substantial multi-line JSON structures embedded in logs. Single-line or
/// small structures are not flagged.
pub struct JsonDumpDetector {
    starts: Vec<Regex>,
    pub min_len: usize,
    pub min_window_lines: usize,
}

impl Default for JsonDumpDetector {
    fn default() -> Self {
        JsonDumpDetector {
            starts: vec![
                Regex::new(r"^\s*\{").unwrap(),
                Regex::new(r":\s*\{").unwrap(),
                Regex::new(r"^\s*\[").unwrap(),
                Regex::new(r":\s*\[").unwrap(),
            ],
            min_len: 100,
            min_window_lines: 10,
        }
    }
}

impl JsonDumpDetector {
    fn json_like_lines(window: &Window, current: &str) -> usize {
        let looks_json = |line: &str| {
            let trimmed = line.trim();
            !trimmed.is_empty()
                && trimmed.chars().any(|c| matches!(c, '{' | '}' | '[' | ']' | '"' | ',' | ':'))
        };
        window.iter().filter(|l| looks_json(l)).count() + usize::from(looks_json(current))
    }
}

impl Detector for JsonDumpDetector {
    fn name(&self) -> &'static str {
        "json_dump"
    }

    fn category(&self) -> Category {
        Category::Format
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        let line = ctx.line.trim_end();
        if line.len() < self.min_len {
            return None;
        }
        if !self.starts.iter().any(|re| re.is_match(line)) {
            return None;
        }
        if !(line.contains("\":") || line.contains("': ")) {
            return None;
        }
        if Self::json_like_lines(ctx.window, line) < self.min_window_lines {
            return None;
        }
        Some(match line.len() {
            l if l > 500 => 0.4,
            l if l > 200 => 0.35,
            _ => 0.3,
        })
    }

    fn should_merge_with_previous(&self, ctx: &LineContext<'_>, _prev: f64) -> bool {
        let trimmed = ctx.line.trim_start();
        !trimmed.is_empty()
            && (trimmed.starts_with('"')
                || trimmed.starts_with('{')
                || trimmed.starts_with('}')
                || trimmed.starts_with('[')
                || trimmed.starts_with(']')
                || trimmed.starts_with(','))
    }

    fn describe(&self, lines: &[String]) -> String {
        let chars: usize = lines.iter().map(String::len).sum();
        format!("Embedded JSON ({chars} chars, {} lines)", lines.len())
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.3, 0.4)
    }
}

// ---------------------------------------------------------------------------
// high_entropy
// ---------------------------------------------------------------------------

/// Shannon entropy of the non-whitespace portion of a line above a threshold:
/// likely secrets, tokens, or compressed/encoded payloads.
pub struct HighEntropyDetector {
    pub min_len: usize,
    pub entropy_threshold: f64,
}

impl Default for HighEntropyDetector {
    fn default() -> Self {
        HighEntropyDetector { min_len: 48, entropy_threshold: 4.7 }
    }
}

/// Shannon entropy in bits per byte.
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in bytes {
        counts[b as usize] += 1;
    }
    let total = bytes.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

impl Detector for HighEntropyDetector {
    fn name(&self) -> &'static str {
        "high_entropy"
    }

    fn category(&self) -> Category {
        Category::Security
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        let condensed: Vec<u8> =
            ctx.line.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
        if condensed.len() < self.min_len {
            return None;
        }
        let entropy = shannon_entropy(&condensed);
        if entropy > self.entropy_threshold {
            Some((0.4 + (entropy - self.entropy_threshold) * 0.3).min(0.9))
        } else {
            None
        }
    }

    fn describe(&self, lines: &[String]) -> String {
        format!("High-entropy content, possible secret or token: {}", first_line_snippet(lines))
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.4, 0.9)
    }
}

// ---------------------------------------------------------------------------
// timestamp_gap
// ---------------------------------------------------------------------------

/// Gaps between consecutive parseable timestamps far above the running
/// median inter-line gap.
pub struct TimestampGapDetector {
    pub factor: f64,
    pub min_gap_secs: i64,
    previous: Option<NaiveDateTime>,
    gaps: Vec<i64>,
    last_gap_secs: i64,
}

impl Default for TimestampGapDetector {
    fn default() -> Self {
        TimestampGapDetector {
            factor: 10.0,
            min_gap_secs: 60,
            previous: None,
            gaps: Vec::new(),
            last_gap_secs: 0,
        }
    }
}

/// Parse an ISO8601 or syslog timestamp from the start of a line.
pub fn parse_line_timestamp(line: &str) -> Option<NaiveDateTime> {
    let head: String = line.chars().take(32).collect();
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        for len in [26, 23, 19] {
            if let Some(prefix) = head.get(..len) {
                if let Ok(ts) = NaiveDateTime::parse_from_str(prefix, format) {
                    return Some(ts);
                }
            }
        }
    }
    // Syslog style "Dec 10 07:49:50" carries no year; differences still work.
    if let Some(prefix) = head.get(..15) {
        if let Ok(ts) =
            NaiveDateTime::parse_from_str(&format!("2000 {prefix}"), "%Y %b %e %H:%M:%S")
        {
            return Some(ts);
        }
    }
    None
}

impl Detector for TimestampGapDetector {
    fn name(&self) -> &'static str {
        "timestamp_gap"
    }

    fn category(&self) -> Category {
        Category::Timing
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        let ts = parse_line_timestamp(ctx.line)?;
        let previous = self.previous.replace(ts);
        let previous = previous?;
        let gap = (ts - previous).num_seconds();
        if gap < 0 {
            // Clock went backwards (rotation, mixed sources); reset history.
            self.gaps.clear();
            return None;
        }
        self.last_gap_secs = gap;

        let median = median_of(&self.gaps);
        if self.gaps.len() < 1_000 {
            self.gaps.push(gap);
        }
        if self.gaps.len() < 20 {
            return None;
        }
        let threshold = (median * self.factor).max(self.min_gap_secs as f64);
        if (gap as f64) > threshold {
            let ratio = gap as f64 / threshold.max(1.0);
            Some((0.3 + ratio / 20.0).min(0.8))
        } else {
            None
        }
    }

    fn describe(&self, _lines: &[String]) -> String {
        format!("Timestamp gap of {}s", self.last_gap_secs)
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.3, 0.8)
    }
}

fn median_of(values: &[i64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}

// ---------------------------------------------------------------------------
// format_deviation
// ---------------------------------------------------------------------------

/// Statistical deviation from the discovered line shape: learns the dominant
/// first-token class over a warmup window, then flags lines that open
/// differently.
pub struct FormatDeviationDetector {
    pub warmup_lines: u64,
    pub dominance: f64,
    counts: [u64; 4],
    total: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LineShape {
    Timestamp,
    Level,
    Bracketed,
    Other,
}

impl Default for FormatDeviationDetector {
    fn default() -> Self {
        FormatDeviationDetector { warmup_lines: 200, dominance: 0.8, counts: [0; 4], total: 0 }
    }
}

impl FormatDeviationDetector {
    fn shape_of(line: &str) -> LineShape {
        if parse_line_timestamp(line).is_some() {
            LineShape::Timestamp
        } else if line.starts_with('[') {
            LineShape::Bracketed
        } else {
            let first = line.split_whitespace().next().unwrap_or("");
            if matches!(first, "DEBUG" | "INFO" | "WARN" | "WARNING" | "ERROR" | "TRACE") {
                LineShape::Level
            } else {
                LineShape::Other
            }
        }
    }

    fn dominant(&self) -> Option<(usize, f64)> {
        if self.total == 0 {
            return None;
        }
        let (idx, &count) =
            self.counts.iter().enumerate().max_by_key(|(_, &c)| c)?;
        Some((idx, count as f64 / self.total as f64))
    }
}

impl Detector for FormatDeviationDetector {
    fn name(&self) -> &'static str {
        "format_deviation"
    }

    fn category(&self) -> Category {
        Category::Format
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        if ctx.line.trim().is_empty() {
            return None;
        }
        let shape = Self::shape_of(ctx.line);
        let shape_index = shape as usize;

        if ctx.number <= self.warmup_lines {
            self.counts[shape_index] += 1;
            self.total += 1;
            return None;
        }
        let (dominant_index, fraction) = self.dominant()?;
        if fraction >= self.dominance
            && shape_index != dominant_index
            && !ctx.line.starts_with([' ', '\t'])
        {
            Some(0.3)
        } else {
            None
        }
    }

    fn describe(&self, lines: &[String]) -> String {
        format!("Format deviation: {}", first_line_snippet(lines))
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.3, 0.3)
    }
}

// ---------------------------------------------------------------------------
// prefix_deviation
// ---------------------------------------------------------------------------

/// Lines whose prefix does not match the mined template regex. Constructed
/// only when the prefix extractor produced one. Indented lines are likely
/// continuations and get a reduced severity.
pub struct PrefixDeviationDetector {
    regex: Regex,
    pub coverage: f64,
}

impl PrefixDeviationDetector {
    pub fn new(regex: Regex, coverage: f64) -> PrefixDeviationDetector {
        PrefixDeviationDetector { regex, coverage }
    }
}

impl Detector for PrefixDeviationDetector {
    fn name(&self) -> &'static str {
        "prefix_deviation"
    }

    fn category(&self) -> Category {
        Category::Format
    }

    fn check_line(&mut self, ctx: &LineContext<'_>) -> Option<f64> {
        if ctx.line.trim().is_empty() || self.regex.is_match(ctx.line) {
            return None;
        }
        if ctx.line.starts_with([' ', '\t']) {
            Some(0.25)
        } else {
            Some(0.5)
        }
    }

    fn should_merge_with_previous(&self, ctx: &LineContext<'_>, _prev: f64) -> bool {
        !ctx.line.trim().is_empty() && !self.regex.is_match(ctx.line)
    }

    fn describe(&self, lines: &[String]) -> String {
        format!("Prefix deviation over {} line(s)", lines.len())
    }

    fn severity_range(&self) -> (f64, f64) {
        (0.25, 0.5)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Catalog row for detector enumeration endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct DetectorInfo {
    pub name: &'static str,
    pub category: Category,
    pub severity_min: f64,
    pub severity_max: f64,
    pub has_prescan: bool,
}

/// The standard detector set, in registration order.
pub fn default_detectors() -> Vec<Box<dyn Detector>> {
    vec![
        Box::new(TracebackDetector::default()),
        Box::new(ErrorKeywordDetector::default()),
        Box::new(WarningKeywordDetector::default()),
        Box::new(LineLengthSpikeDetector::default()),
        Box::new(IndentationBlockDetector::default()),
        Box::new(TimestampGapDetector::default()),
        Box::new(HighEntropyDetector::default()),
        Box::new(JsonDumpDetector::default()),
        Box::new(FormatDeviationDetector::default()),
    ]
}

/// Static catalog of the standard detectors.
pub fn detector_catalog() -> Vec<DetectorInfo> {
    default_detectors()
        .into_iter()
        .map(|d| {
            let (severity_min, severity_max) = d.severity_range();
            DetectorInfo {
                name: d.name(),
                category: d.category(),
                severity_min,
                severity_max,
                has_prescan: !d.prescan_patterns().is_empty(),
            }
        })
        .collect()
}

/// Category of a detector by registry name, for prescan reconstruction.
pub fn category_for_detector(name: &str) -> Option<Category> {
    detector_catalog().into_iter().find(|d| d.name == name).map(|d| d.category)
}

/// All categories with their descriptions and member detectors.
pub fn category_catalog() -> Vec<(Category, &'static str, Vec<&'static str>)> {
    let catalog = detector_catalog();
    [
        Category::Error,
        Category::Warning,
        Category::Traceback,
        Category::Format,
        Category::Security,
        Category::Timing,
        Category::Multiline,
    ]
    .into_iter()
    .map(|category| {
        let members: Vec<&'static str> =
            catalog.iter().filter(|d| d.category == category).map(|d| d.name).collect();
        (category, category.description(), members)
    })
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::Window;

    fn ctx<'a>(line: &'a str, number: u64, window: &'a Window) -> LineContext<'a> {
        LineContext { line, number, offset: 0, window, mean_len: 40.0, stddev_len: 5.0 }
    }

    #[test]
    fn traceback_start_and_continuation() {
        let mut det = TracebackDetector::default();
        let w = Window::new(8);
        assert!(det.check_line(&ctx("Traceback (most recent call last):", 1, &w)).is_some());
        assert!(det.check_line(&ctx("thread 'main' panicked at src/main.rs:4", 1, &w)).is_some());
        assert!(det.check_line(&ctx("panic: runtime error", 1, &w)).is_some());
        assert!(det.check_line(&ctx("2024-01-01 INFO fine", 1, &w)).is_none());

        assert!(det.should_merge_with_previous(&ctx("  File \"/app/main.py\", line 4", 2, &w), 0.9));
        assert!(det.should_merge_with_previous(&ctx("\tat com.foo.Bar.run(Bar.java:10)", 2, &w), 0.9));
        assert!(det.should_merge_with_previous(&ctx("ValueError: bad input", 2, &w), 0.9));
        assert!(!det.should_merge_with_previous(&ctx("2024-01-01 INFO next request", 2, &w), 0.9));
    }

    #[test]
    fn error_keyword_severities_ordered() {
        let mut det = ErrorKeywordDetector::default();
        let w = Window::new(8);
        let fatal = det.check_line(&ctx("FATAL: disk gone", 1, &w)).unwrap();
        let error = det.check_line(&ctx("ERROR: timeout", 1, &w)).unwrap();
        let exc = det.check_line(&ctx("caught Exception in handler", 1, &w)).unwrap();
        assert!(fatal > error && error > exc);
        assert!(det.check_line(&ctx("errors were recorded", 1, &w)).is_none(), "word boundary");
        // The strongest keyword on the line wins.
        let both = det.check_line(&ctx("ERROR then FATAL", 1, &w)).unwrap();
        assert_eq!(both, fatal);
    }

    #[test]
    fn warning_keyword_fires() {
        let mut det = WarningKeywordDetector::default();
        let w = Window::new(8);
        assert_eq!(det.check_line(&ctx("WARN low disk", 1, &w)), Some(0.45));
        assert!(det.check_line(&ctx("forewarned is forearmed", 1, &w)).is_none());
    }

    #[test]
    fn line_length_spike_uses_z_score() {
        let mut det = LineLengthSpikeDetector::default();
        let w = Window::new(8);
        let long = "x".repeat(400);
        // Within warmup: never fires.
        assert!(det.check_line(&ctx(&long, 10, &w)).is_none());
        // After warmup, 400 chars vs mean 40 / stddev 5 is a huge spike.
        assert!(det.check_line(&ctx(&long, 100, &w)).is_some());
        // Short lines never fire regardless of z.
        assert!(det.check_line(&ctx("short", 100, &w)).is_none());
    }

    #[test]
    fn indentation_block_counts_consecutive() {
        let mut det = IndentationBlockDetector::default();
        let w = Window::new(8);
        let indented = format!("    {}", "y".repeat(60));
        for i in 1..5 {
            assert!(det.check_line(&ctx(&indented, i, &w)).is_none());
        }
        assert!(det.check_line(&ctx(&indented, 5, &w)).is_some());
        // Continues merging while indented, resets on a flush-left line.
        assert!(det.should_merge_with_previous(&ctx(&indented, 6, &w), 0.35));
        assert!(det.check_line(&ctx("flush left", 7, &w)).is_none());
        assert!(!det.should_merge_with_previous(&ctx("flush left", 7, &w), 0.35));
    }

    #[test]
    fn json_dump_requires_multiline_context() {
        let mut det = JsonDumpDetector::default();
        let json_line = format!("{{\"key\": \"{}\", \"other\": 1}}", "v".repeat(100));

        // Sparse window: not enough JSON-like surroundings.
        let empty = Window::new(16);
        assert!(det.check_line(&ctx(&json_line, 1, &empty)).is_none());

        let mut dense = Window::new(16);
        for _ in 0..12 {
            dense.push("  \"field\": \"value\",".to_string());
        }
        assert!(det.check_line(&ctx(&json_line, 13, &dense)).is_some());
        assert!(det.should_merge_with_previous(&ctx("  \"k\": 1,", 14, &dense), 0.3));
        assert!(!det.should_merge_with_previous(&ctx("plain text line", 15, &dense), 0.3));
    }

    #[test]
    fn high_entropy_flags_tokens_not_prose() {
        let mut det = HighEntropyDetector::default();
        let w = Window::new(8);
        let token = "token=9fXk2LqP8vRw3TzY6bNd1GhJ5mCs7AeU4iQo0WxEr2tYu8PzLk3N";
        assert!(det.check_line(&ctx(token, 1, &w)).is_some());
        let prose = "the quick brown fox jumps over the lazy dog again and again";
        assert!(det.check_line(&ctx(prose, 1, &w)).is_none());
    }

    #[test]
    fn entropy_extremes() {
        assert_eq!(shannon_entropy(b""), 0.0);
        assert_eq!(shannon_entropy(b"aaaa"), 0.0);
        let all: Vec<u8> = (0..=255).collect();
        assert!((shannon_entropy(&all) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn timestamp_parsing_formats() {
        assert!(parse_line_timestamp("2025-12-10T07:49:50.123 service up").is_some());
        assert!(parse_line_timestamp("2025-12-10 07:49:50 service up").is_some());
        assert!(parse_line_timestamp("Dec 10 07:49:50 host daemon[123]: hi").is_some());
        assert!(parse_line_timestamp("no timestamp here").is_none());
    }

    #[test]
    fn timestamp_gap_flags_outliers() {
        let mut det = TimestampGapDetector::default();
        let w = Window::new(8);
        // Steady one-second cadence to build gap history.
        for i in 0..30u64 {
            let line = format!("2024-01-01 10:00:{:02} INFO tick", i % 60);
            det.check_line(&ctx(&line, i + 1, &w));
        }
        // A ten-minute hole.
        let hole = "2024-01-01 10:10:30 INFO after outage";
        assert!(det.check_line(&ctx(hole, 31, &w)).is_some());
        // Back to cadence: quiet again.
        let next = "2024-01-01 10:10:31 INFO tick";
        assert!(det.check_line(&ctx(next, 32, &w)).is_none());
    }

    #[test]
    fn format_deviation_learns_dominant_shape() {
        let mut det = FormatDeviationDetector::default();
        let w = Window::new(8);
        for i in 1..=200u64 {
            let line = format!("2024-01-01 10:00:00 INFO event {i}");
            assert!(det.check_line(&ctx(&line, i, &w)).is_none());
        }
        assert!(det.check_line(&ctx("free-form interloper", 201, &w)).is_some());
        assert!(det
            .check_line(&ctx("2024-01-01 10:00:01 INFO conformant", 202, &w))
            .is_none());
        // Indented lines are continuations, not deviations.
        assert!(det.check_line(&ctx("    wrapped payload", 203, &w)).is_none());
    }

    #[test]
    fn prefix_deviation_reduced_for_indented() {
        let re = Regex::new(r"^\d{4}-\d{2}-\d{2}").unwrap();
        let mut det = PrefixDeviationDetector::new(re, 0.95);
        let w = Window::new(8);
        assert!(det.check_line(&ctx("2024-01-01 ok", 1, &w)).is_none());
        assert_eq!(det.check_line(&ctx("rogue line", 2, &w)), Some(0.5));
        assert_eq!(det.check_line(&ctx("  continuation", 3, &w)), Some(0.25));
    }

    #[test]
    fn registry_is_complete() {
        let catalog = detector_catalog();
        assert_eq!(catalog.len(), 9);
        let names: Vec<&str> = catalog.iter().map(|d| d.name).collect();
        for expected in [
            "traceback",
            "error_keyword",
            "warning_keyword",
            "line_length_spike",
            "indentation_block",
            "timestamp_gap",
            "high_entropy",
            "json_dump",
            "format_deviation",
        ] {
            assert!(names.contains(&expected), "{expected} missing");
        }
        for info in &catalog {
            assert!(info.severity_min <= info.severity_max);
            assert!(info.severity_min >= 0.0 && info.severity_max <= 1.0);
        }
        assert_eq!(category_for_detector("traceback"), Some(Category::Traceback));
        assert_eq!(category_for_detector("nope"), None);

        let categories = category_catalog();
        assert_eq!(categories.len(), 7);
        let with_members = categories.iter().filter(|(_, _, m)| !m.is_empty()).count();
        assert!(with_members >= 5);
    }
}
