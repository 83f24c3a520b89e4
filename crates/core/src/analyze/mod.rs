//! Anomaly detection: a fixed library of line detectors composed over a
//! single forward pass with a bounded sliding window, producing merged
//! anomaly ranges.
//!
//! The streaming pass feeds every configured detector's `check_line`; a
//! detector that keeps firing (or whose merge rule holds) extends its open
//! range, anything else closes it. Ranges land in a severity-bounded heap so
//! pathological files cannot exhaust memory. A prescan path lets the external
//! regex engine find candidate lines at full I/O speed when anomaly
//! detection is the only goal on a very large file.

pub mod detectors;
pub mod prefix;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Config, DETECTOR_WINDOW_LINES};
use crate::engine::{scan_chunk, EngineInvocation};
use crate::error::Result;
use crate::stats::RunningStats;
use crate::types::CancelToken;

pub use detectors::{
    category_catalog, category_for_detector, default_detectors, detector_catalog, Category,
    Detector, DetectorInfo, PrefixDeviationDetector,
};
pub use prefix::{PrefixExtractor, PrefixPattern};

/// Hard cap on retained ranges per file.
const DEFAULT_ANOMALY_CAPACITY: usize = 10_000;

// ---------------------------------------------------------------------------
// Ranges
// ---------------------------------------------------------------------------

/// A contiguous line span flagged by a detector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRange {
    pub start_line: u64,
    pub end_line: u64,
    pub start_offset: u64,
    pub end_offset: u64,
    /// In `[0, 1]`.
    pub severity: f64,
    pub category: Category,
    pub description: String,
    pub detector: String,
}

// ---------------------------------------------------------------------------
// Sliding window
// ---------------------------------------------------------------------------

/// Ring buffer of the previous W lines, owned by the streaming pass.
#[derive(Clone, Debug)]
pub struct Window {
    ring: VecDeque<String>,
    capacity: usize,
}

impl Window {
    pub fn new(capacity: usize) -> Window {
        Window { ring: VecDeque::with_capacity(capacity), capacity: capacity.max(1) }
    }

    pub fn push(&mut self, line: String) {
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(line);
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.ring.iter()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Everything a detector sees for one line.
pub struct LineContext<'a> {
    /// Current line, terminator stripped.
    pub line: &'a str,
    /// 1-based line number.
    pub number: u64,
    /// Byte offset of the line's first byte.
    pub offset: u64,
    /// The previous W lines.
    pub window: &'a Window,
    /// Running mean of non-empty line lengths, previous lines only.
    pub mean_len: f64,
    pub stddev_len: f64,
}

// ---------------------------------------------------------------------------
// Bounded heap
// ---------------------------------------------------------------------------

/// Min-heap by severity with a fixed capacity: once full, a new range below
/// the current minimum is rejected outright.
pub struct BoundedAnomalyHeap {
    heap: std::collections::BinaryHeap<std::cmp::Reverse<HeapEntry>>,
    capacity: usize,
}

struct HeapEntry(AnomalyRange);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.severity == other.0.severity
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.severity.total_cmp(&other.0.severity)
    }
}

impl BoundedAnomalyHeap {
    pub fn new(capacity: usize) -> BoundedAnomalyHeap {
        BoundedAnomalyHeap {
            heap: std::collections::BinaryHeap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, range: AnomalyRange) {
        if self.heap.len() < self.capacity {
            self.heap.push(std::cmp::Reverse(HeapEntry(range)));
            return;
        }
        if let Some(min) = self.heap.peek() {
            if range.severity > min.0 .0.severity {
                self.heap.pop();
                self.heap.push(std::cmp::Reverse(HeapEntry(range)));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn into_sorted(self) -> Vec<AnomalyRange> {
        let mut ranges: Vec<AnomalyRange> =
            self.heap.into_iter().map(|e| e.0 .0).collect();
        ranges.sort_by_key(|r| (r.start_offset, r.detector.clone()));
        ranges
    }
}

// ---------------------------------------------------------------------------
// Streaming analyzer
// ---------------------------------------------------------------------------

struct OpenRange {
    start_line: u64,
    end_line: u64,
    start_offset: u64,
    end_offset: u64,
    severity: f64,
    lines: Vec<String>,
}

/// Single-pass anomaly pipeline over a stream of lines.
pub struct Analyzer {
    detectors: Vec<Box<dyn Detector>>,
    open: Vec<Option<OpenRange>>,
    window: Window,
    lengths: RunningStats,
    heap: BoundedAnomalyHeap,
}

impl Analyzer {
    pub fn new(detectors: Vec<Box<dyn Detector>>, window_lines: usize) -> Analyzer {
        let open = detectors.iter().map(|_| None).collect();
        Analyzer {
            detectors,
            open,
            window: Window::new(window_lines),
            lengths: RunningStats::new(),
            heap: BoundedAnomalyHeap::new(DEFAULT_ANOMALY_CAPACITY),
        }
    }

    /// The standard registry, plus the prefix-deviation detector when the
    /// extractor mines a usable template from the file.
    pub fn with_defaults(path: &Path, _config: &Config) -> Analyzer {
        let mut detectors = default_detectors();
        if let Some(pattern) = PrefixExtractor::default().extract_from_file(path) {
            match regex::Regex::new(&pattern.regex) {
                Ok(re) => {
                    debug!(
                        "prefix template for {}: '{}' ({:.0}% coverage)",
                        path.display(),
                        pattern.pattern,
                        pattern.coverage * 100.0
                    );
                    detectors
                        .push(Box::new(PrefixDeviationDetector::new(re, pattern.coverage)));
                }
                Err(e) => debug!("unusable prefix regex for {}: {e}", path.display()),
            }
        }
        Analyzer::new(detectors, DETECTOR_WINDOW_LINES)
    }

    /// Feed one line (terminator already stripped).
    pub fn push_line(&mut self, line: &str, number: u64, offset: u64) {
        let ctx = LineContext {
            line,
            number,
            offset,
            window: &self.window,
            mean_len: self.lengths.mean(),
            stddev_len: self.lengths.stddev(),
        };

        for (i, detector) in self.detectors.iter_mut().enumerate() {
            let severity = detector.check_line(&ctx);
            let line_end = offset + line.len() as u64;
            match (self.open[i].take(), severity) {
                (Some(mut range), Some(sev)) => {
                    if detector.should_merge_with_previous(&ctx, range.severity) {
                        range.end_line = number;
                        range.end_offset = line_end;
                        range.severity = range.severity.max(sev);
                        range.lines.push(line.to_string());
                        self.open[i] = Some(range);
                    } else {
                        close_range(&mut self.heap, detector.as_ref(), range);
                        self.open[i] = Some(OpenRange {
                            start_line: number,
                            end_line: number,
                            start_offset: offset,
                            end_offset: line_end,
                            severity: sev,
                            lines: vec![line.to_string()],
                        });
                    }
                }
                (Some(mut range), None) => {
                    if detector.should_merge_with_previous(&ctx, range.severity) {
                        range.end_line = number;
                        range.end_offset = line_end;
                        range.lines.push(line.to_string());
                        self.open[i] = Some(range);
                    } else {
                        close_range(&mut self.heap, detector.as_ref(), range);
                    }
                }
                (None, Some(sev)) => {
                    self.open[i] = Some(OpenRange {
                        start_line: number,
                        end_line: number,
                        start_offset: offset,
                        end_offset: line_end,
                        severity: sev,
                        lines: vec![line.to_string()],
                    });
                }
                (None, None) => {}
            }
        }

        if !line.trim().is_empty() {
            self.lengths.push(line.len() as f64);
        }
        self.window.push(line.to_string());
    }

    /// Close open ranges, deduplicate, and summarize per category.
    pub fn finish(mut self) -> (Vec<AnomalyRange>, BTreeMap<String, u64>) {
        for (i, open) in self.open.iter_mut().enumerate() {
            if let Some(range) = open.take() {
                close_range(&mut self.heap, self.detectors[i].as_ref(), range);
            }
        }
        let ranges = dedup_coincident(self.heap.into_sorted());
        let mut summary: BTreeMap<String, u64> = BTreeMap::new();
        for range in &ranges {
            *summary.entry(range.category.as_str().to_string()).or_default() += 1;
        }
        (ranges, summary)
    }
}

fn close_range(heap: &mut BoundedAnomalyHeap, detector: &dyn Detector, range: OpenRange) {
    heap.push(AnomalyRange {
        start_line: range.start_line,
        end_line: range.end_line,
        start_offset: range.start_offset,
        end_offset: range.end_offset,
        severity: range.severity,
        category: detector.category(),
        description: detector.describe(&range.lines),
        detector: detector.name().to_string(),
    });
}

/// Ranges exactly coincident across detectors collapse to the one with the
/// highest severity; ties break toward the lexicographically smaller
/// detector name.
fn dedup_coincident(mut ranges: Vec<AnomalyRange>) -> Vec<AnomalyRange> {
    ranges.sort_by(|a, b| {
        (a.start_offset, a.end_offset, a.start_line, a.end_line)
            .cmp(&(b.start_offset, b.end_offset, b.start_line, b.end_line))
            .then(b.severity.total_cmp(&a.severity))
            .then(a.detector.cmp(&b.detector))
    });
    ranges.dedup_by(|next, kept| {
        kept.start_offset == next.start_offset
            && kept.end_offset == next.end_offset
            && kept.start_line == next.start_line
            && kept.end_line == next.end_line
    });
    ranges.sort_by(|a, b| {
        a.start_offset.cmp(&b.start_offset).then(a.detector.cmp(&b.detector))
    });
    ranges
}

// ---------------------------------------------------------------------------
// Whole-file helpers
// ---------------------------------------------------------------------------

/// Run the streaming pipeline over a whole file. Used by callers that want
/// anomalies without an index build.
pub fn analyze_file(path: &Path, config: &Config) -> Result<(Vec<AnomalyRange>, BTreeMap<String, u64>)> {
    use std::io::BufRead;
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(1 << 20, file);
    let mut analyzer = Analyzer::with_defaults(path, config);

    let mut line: Vec<u8> = Vec::new();
    let mut number = 0u64;
    let mut offset = 0u64;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        number += 1;
        let mut end = line.len();
        if end > 0 && line[end - 1] == b'\n' {
            end -= 1;
        }
        if end > 0 && line[end - 1] == b'\r' {
            end -= 1;
        }
        analyzer.push_line(&String::from_utf8_lossy(&line[..end]), number, offset);
        offset += n as u64;
    }
    Ok(analyzer.finish())
}

/// Analyze many files with a bounded rayon pool; results keep input order.
pub fn analyze_paths(
    paths: &[PathBuf],
    config: &Config,
) -> Vec<(PathBuf, Result<(Vec<AnomalyRange>, BTreeMap<String, u64>)>)> {
    paths
        .par_iter()
        .map(|path| (path.clone(), analyze_file(path, config)))
        .collect()
}

// ---------------------------------------------------------------------------
// Prescan
// ---------------------------------------------------------------------------

/// One engine-located candidate line.
#[derive(Clone, Debug)]
pub struct PrescanHit {
    pub detector: String,
    pub severity: f64,
    /// 1-based line number within the scanned file.
    pub line_number: Option<u64>,
    pub offset: u64,
    pub line_text: String,
}

/// Run the engine once over `path` with the union of every detector's
/// prescan patterns, attributing each hit back to its detector by local
/// re-match. Fast filter for anomaly-only scans of very large files.
pub fn prescan_file(path: &Path, cancel: &CancelToken) -> Result<Vec<PrescanHit>> {
    let mut advertised: Vec<(String, String, f64)> = Vec::new(); // (detector, pattern, severity)
    for detector in default_detectors() {
        for (pattern, severity) in detector.prescan_patterns() {
            advertised.push((detector.name().to_string(), pattern, severity));
        }
    }
    if advertised.is_empty() {
        return Ok(Vec::new());
    }

    let invocation = EngineInvocation {
        patterns: advertised.iter().map(|(_, p, _)| p.clone()).collect(),
        flags: Vec::new(),
        before_context: 0,
        after_context: 0,
    };
    let compiled: Vec<regex::Regex> = advertised
        .iter()
        .filter_map(|(_, p, _)| regex::Regex::new(p).ok())
        .collect();

    let file = std::fs::File::open(path)?;
    let scan = scan_chunk(&invocation, file, 0, path, cancel)?;

    let mut hits = Vec::with_capacity(scan.matches.len());
    for event in &scan.matches {
        let text = event.line_text();
        // First advertised pattern that matches owns the hit.
        let owner = compiled
            .iter()
            .position(|re| re.is_match(text))
            .map(|i| (advertised[i].0.clone(), advertised[i].2))
            .unwrap_or_else(|| (advertised[0].0.clone(), advertised[0].2));
        hits.push(PrescanHit {
            detector: owner.0,
            severity: owner.1,
            line_number: event.line_number,
            offset: event.absolute_offset,
            line_text: text.to_string(),
        });
    }
    Ok(hits)
}

/// Convert prescan hits into single-line anomaly ranges. Line numbers may be
/// absent when the scan ran over a byte range; the consumer reconciles them
/// against the index afterwards in one batched call.
pub fn prescan_to_ranges(hits: &[PrescanHit]) -> Vec<AnomalyRange> {
    hits.iter()
        .map(|hit| AnomalyRange {
            start_line: hit.line_number.unwrap_or(0),
            end_line: hit.line_number.unwrap_or(0),
            start_offset: hit.offset,
            end_offset: hit.offset + hit.line_text.len() as u64,
            severity: hit.severity,
            category: category_for_detector(&hit.detector).unwrap_or(Category::Error),
            description: format!("Prescan hit: {}", hit.line_text.chars().take(80).collect::<String>()),
            detector: hit.detector.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_pipeline(content: &str) -> (Vec<AnomalyRange>, BTreeMap<String, u64>) {
        let mut analyzer = Analyzer::new(default_detectors(), DETECTOR_WINDOW_LINES);
        let mut offset = 0u64;
        for (i, line) in content.lines().enumerate() {
            analyzer.push_line(line, i as u64 + 1, offset);
            offset += line.len() as u64 + 1;
        }
        analyzer.finish()
    }

    const ERROR_LOG: &str = "\
2024-01-01 10:00:00 INFO: Application started
2024-01-01 10:00:01 INFO: Processing request
2024-01-01 10:00:02 ERROR: Failed to connect to database
2024-01-01 10:00:03 INFO: Retrying connection
2024-01-01 10:00:04 FATAL: Database connection timeout
2024-01-01 10:00:05 INFO: Shutting down
Traceback (most recent call last):
  File \"/app/main.py\", line 42, in connect
    db.connect()
  File \"/app/db.py\", line 10, in connect
    raise ConnectionError(\"timeout\")
ConnectionError: timeout
2024-01-01 10:00:06 INFO: Cleanup complete
";

    #[test]
    fn finds_errors_and_merged_traceback() {
        let (ranges, summary) = run_pipeline(ERROR_LOG);
        assert!(!ranges.is_empty());

        let categories: Vec<Category> = ranges.iter().map(|r| r.category).collect();
        assert!(categories.contains(&Category::Error));
        assert!(categories.contains(&Category::Traceback));

        let tb = ranges.iter().find(|r| r.detector == "traceback").unwrap();
        assert_eq!(tb.start_line, 7);
        assert!(tb.end_line >= 11, "traceback merged through its frames: {tb:?}");
        assert!(tb.description.contains("lines"));

        // Summary counts agree with the ranges themselves.
        for (category, count) in &summary {
            let actual =
                ranges.iter().filter(|r| r.category.as_str() == category).count() as u64;
            assert_eq!(*count, actual);
        }
    }

    #[test]
    fn clean_file_yields_nothing() {
        let clean = "\
2024-01-01 10:00:00 INFO: Application started
2024-01-01 10:00:01 INFO: Processing request
2024-01-01 10:00:02 INFO: Request completed
2024-01-01 10:00:03 INFO: Shutting down
";
        let (ranges, summary) = run_pipeline(clean);
        assert!(ranges.is_empty(), "{ranges:?}");
        assert!(summary.is_empty());
    }

    #[test]
    fn ranges_are_ordered_and_well_formed() {
        let (ranges, _) = run_pipeline(ERROR_LOG);
        for range in &ranges {
            assert!(range.start_line <= range.end_line);
            assert!(range.start_offset <= range.end_offset);
            assert!(range.severity > 0.0 && range.severity <= 1.0);
            assert!(!range.detector.is_empty());
        }
        for pair in ranges.windows(2) {
            assert!(pair[0].start_offset <= pair[1].start_offset);
        }
    }

    #[test]
    fn adjacent_error_lines_merge() {
        let log = "\
ok
ERROR: first failure
ERROR: second failure
ok
";
        let (ranges, _) = run_pipeline(log);
        let errors: Vec<&AnomalyRange> =
            ranges.iter().filter(|r| r.detector == "error_keyword").collect();
        assert_eq!(errors.len(), 1, "consecutive error lines form one range: {errors:?}");
        assert_eq!(errors[0].start_line, 2);
        assert_eq!(errors[0].end_line, 3);
    }

    #[test]
    fn heap_keeps_highest_severity_when_full() {
        let mut heap = BoundedAnomalyHeap::new(3);
        for (i, severity) in [0.2, 0.9, 0.4, 0.8, 0.1].into_iter().enumerate() {
            heap.push(AnomalyRange {
                start_line: i as u64 + 1,
                end_line: i as u64 + 1,
                start_offset: i as u64 * 10,
                end_offset: i as u64 * 10 + 5,
                severity,
                category: Category::Error,
                description: String::new(),
                detector: "error_keyword".into(),
            });
        }
        let kept = heap.into_sorted();
        assert_eq!(kept.len(), 3);
        let mut severities: Vec<f64> = kept.iter().map(|r| r.severity).collect();
        severities.sort_by(f64::total_cmp);
        assert_eq!(severities, vec![0.4, 0.8, 0.9]);
    }

    #[test]
    fn coincident_ranges_keep_highest_severity() {
        let mk = |detector: &str, severity: f64| AnomalyRange {
            start_line: 5,
            end_line: 5,
            start_offset: 100,
            end_offset: 150,
            severity,
            category: Category::Error,
            description: String::new(),
            detector: detector.into(),
        };
        let deduped = dedup_coincident(vec![mk("b_det", 0.5), mk("a_det", 0.9)]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].detector, "a_det");

        // Severity tie: lexicographically smaller detector name wins.
        let tied = dedup_coincident(vec![mk("z_det", 0.7), mk("a_det", 0.7)]);
        assert_eq!(tied.len(), 1);
        assert_eq!(tied[0].detector, "a_det");
    }

    #[test]
    fn window_is_bounded() {
        let mut window = Window::new(3);
        for i in 0..10 {
            window.push(format!("line {i}"));
        }
        assert_eq!(window.len(), 3);
        let lines: Vec<&String> = window.iter().collect();
        assert_eq!(lines[0], "line 7");
        assert_eq!(lines[2], "line 9");
    }

    #[test]
    fn analyze_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, ERROR_LOG).unwrap();
        let config = Config::default();
        let (ranges, summary) = analyze_file(&path, &config).unwrap();
        assert!(!ranges.is_empty());
        assert_eq!(
            summary.values().sum::<u64>(),
            ranges.len() as u64,
            "summary total equals range count"
        );
    }

    #[test]
    fn analyze_paths_keeps_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.log");
        let b = dir.path().join("b.log");
        std::fs::write(&a, "INFO fine\n").unwrap();
        std::fs::write(&b, ERROR_LOG).unwrap();
        let config = Config::default();
        let results = analyze_paths(&[a.clone(), b.clone()], &config);
        assert_eq!(results[0].0, a);
        assert_eq!(results[1].0, b);
        assert!(results[0].1.as_ref().unwrap().0.is_empty());
        assert!(!results[1].1.as_ref().unwrap().0.is_empty());
    }

    #[test]
    fn prescan_ranges_carry_detector_categories() {
        let hits = vec![PrescanHit {
            detector: "error_keyword".into(),
            severity: 0.8,
            line_number: Some(3),
            offset: 120,
            line_text: "ERROR: boom".into(),
        }];
        let ranges = prescan_to_ranges(&hits);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].category, Category::Error);
        assert_eq!(ranges[0].start_line, 3);
        assert_eq!(ranges[0].start_offset, 120);
    }
}
