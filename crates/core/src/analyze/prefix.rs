//! Prefix-pattern extraction: mine the dominant log-line prefix template
//! from a sample and emit a regex that matches it.
//!
//! Lines are masked (timestamps, ids, levels, numbers become tags), clustered
//! with a fixed-depth template tree, and the most frequent prefix tuple of at
//! most eight tokens that covers ≥ 90% of lines (50% fallback) becomes the
//! template. `prefix_deviation` consumes the emitted regex.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

/// A mined prefix template.
#[derive(Clone, Debug, Serialize)]
pub struct PrefixPattern {
    /// Masked token form, e.g. `"<DATE> <TIME> <LEVEL>"`.
    pub pattern: String,
    /// Anchored regex matching the prefix.
    pub regex: String,
    /// Fraction of sampled lines covered, `0.0..=1.0`.
    pub coverage: f64,
    /// Approximate prefix length in characters (median over the sample).
    pub prefix_length: usize,
    pub token_count: usize,
}

/// Masking rules in priority order; earlier rules win on overlap.
fn masking_rules() -> Vec<(Regex, &'static str)> {
    [
        (r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:[.,]\d{3,6})?Z?", "<DATETIME>"),
        (r"\d{4}-\d{2}-\d{2}", "<DATE>"),
        (r"\d{2}:\d{2}:\d{2}(?:[.,]\d{3,6})?Z?", "<TIME>"),
        (r"\b[A-Z][a-z]{2}\s+\d{1,2}\b", "<SYSDATE>"),
        (r"\[\d+\]", "<NUM_ID>"),
        (r"\[[\w.-]+\]", "<COMPONENT>"),
        (r"\b(?:DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL|FATAL|TRACE)\b", "<LEVEL>"),
        (r"\b[0-9A-Fa-f]{8,}\b", "<HEX>"),
        (r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b", "<IP>"),
        (r"\b\d+\b", "<NUM>"),
    ]
    .into_iter()
    .map(|(pattern, tag)| (Regex::new(pattern).expect("static masking regex"), tag))
    .collect()
}

/// Tag -> source character class, for regex emission.
fn tag_regex(tag: &str) -> Option<&'static str> {
    Some(match tag {
        "<DATETIME>" => r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:[.,]\d{3,6})?Z?",
        "<DATE>" => r"\d{4}-\d{2}-\d{2}",
        "<TIME>" => r"\d{2}:\d{2}:\d{2}(?:[.,]\d{3,6})?Z?",
        "<SYSDATE>" => r"[A-Z][a-z]{2}\s+\d{1,2}",
        "<NUM_ID>" => r"\[\d+\]",
        "<COMPONENT>" => r"\[[\w.-]+\]",
        "<LEVEL>" => r"(?:DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL|FATAL|TRACE)",
        "<HEX>" => r"[0-9A-Fa-f]{8,}",
        "<IP>" => r"\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}",
        "<NUM>" => r"\d+",
        "<*>" => r"\S+",
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Template tree clustering
// ---------------------------------------------------------------------------

/// One cluster of masked lines sharing a template. Token positions that
/// disagree degrade to the `<*>` wildcard.
struct Cluster {
    template: Vec<String>,
    size: u64,
}

/// Fixed-depth template miner: lines are routed by token count and their
/// first tokens (up to the tree depth), then matched against the bucket's
/// clusters by positional similarity.
struct TemplateTree {
    /// `(token_count, routing prefix)` -> cluster indices.
    buckets: HashMap<(usize, String), Vec<usize>>,
    clusters: Vec<Cluster>,
    similarity_threshold: f64,
    depth: usize,
}

impl TemplateTree {
    fn new(similarity_threshold: f64, depth: usize) -> TemplateTree {
        TemplateTree {
            buckets: HashMap::new(),
            clusters: Vec::new(),
            similarity_threshold,
            depth: depth.max(1),
        }
    }

    fn route(&self, tokens: &[String]) -> (usize, String) {
        let routing: Vec<&str> = tokens
            .iter()
            .take(self.depth.saturating_sub(2).max(1))
            .map(|t| if t.contains(|c: char| c.is_ascii_digit()) { "<*>" } else { t.as_str() })
            .collect();
        (tokens.len(), routing.join(" "))
    }

    fn add(&mut self, tokens: Vec<String>) {
        let key = self.route(&tokens);
        let bucket = self.buckets.entry(key).or_default();

        let mut best: Option<(usize, f64)> = None;
        for &idx in bucket.iter() {
            let sim = similarity(&self.clusters[idx].template, &tokens);
            if best.map(|(_, s)| sim > s).unwrap_or(true) {
                best = Some((idx, sim));
            }
        }
        match best {
            Some((idx, sim)) if sim >= self.similarity_threshold => {
                let cluster = &mut self.clusters[idx];
                for (slot, token) in cluster.template.iter_mut().zip(tokens.iter()) {
                    if slot != token {
                        *slot = "<*>".to_string();
                    }
                }
                cluster.size += 1;
            }
            _ => {
                let idx = self.clusters.len();
                self.clusters.push(Cluster { template: tokens, size: 1 });
                bucket.push(idx);
            }
        }
    }
}

/// Fraction of aligned token positions that agree.
fn similarity(template: &[String], tokens: &[String]) -> f64 {
    if template.is_empty() || template.len() != tokens.len() {
        return 0.0;
    }
    let agree = template
        .iter()
        .zip(tokens.iter())
        .filter(|(a, b)| a == b || a.as_str() == "<*>")
        .count();
    agree as f64 / template.len() as f64
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub struct PrefixExtractor {
    rules: Vec<(Regex, &'static str)>,
    pub similarity_threshold: f64,
    pub coverage_threshold: f64,
    pub fallback_coverage: f64,
    pub max_prefix_tokens: usize,
    pub sample_lines: usize,
    pub skip_ratio: f64,
}

impl Default for PrefixExtractor {
    fn default() -> Self {
        PrefixExtractor {
            rules: masking_rules(),
            similarity_threshold: 0.3,
            coverage_threshold: 0.90,
            fallback_coverage: 0.50,
            max_prefix_tokens: 8,
            sample_lines: 1_000,
            skip_ratio: 0.05,
        }
    }
}

impl PrefixExtractor {
    /// Replace recognized tokens with their tags, in rule priority order.
    pub fn mask(&self, line: &str) -> String {
        let mut masked = line.to_string();
        for (regex, tag) in &self.rules {
            masked = regex.replace_all(&masked, *tag).into_owned();
        }
        masked
    }

    /// Mine the dominant prefix from sample lines.
    pub fn extract_from_lines(&self, lines: &[String]) -> Option<PrefixPattern> {
        if lines.is_empty() {
            return None;
        }

        let mut tree = TemplateTree::new(self.similarity_threshold, 4);
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let masked = self.mask(line);
            let tokens: Vec<String> = masked.split_whitespace().map(String::from).collect();
            if !tokens.is_empty() {
                tree.add(tokens);
            }
        }
        if tree.clusters.is_empty() {
            return None;
        }
        let total: u64 = tree.clusters.iter().map(|c| c.size).sum();

        // Weighted counts of the first <= K tokens of every template.
        let mut prefix_counts: HashMap<Vec<String>, u64> = HashMap::new();
        for cluster in &tree.clusters {
            let prefix: Vec<String> =
                cluster.template.iter().take(self.max_prefix_tokens).cloned().collect();
            *prefix_counts.entry(prefix).or_default() += cluster.size;
        }

        // Longest prefix length whose most frequent tuple clears coverage.
        let mut best: Option<(Vec<String>, f64)> = None;
        for prefix_len in (1..=self.max_prefix_tokens).rev() {
            let mut shortened: HashMap<Vec<String>, u64> = HashMap::new();
            for (prefix, count) in &prefix_counts {
                let short: Vec<String> = prefix.iter().take(prefix_len).cloned().collect();
                *shortened.entry(short).or_default() += count;
            }
            let (top, count) =
                shortened.into_iter().max_by_key(|(_, count)| *count)?;
            let coverage = count as f64 / total as f64;
            if coverage >= self.coverage_threshold {
                let longer = best.as_ref().map(|(b, _)| top.len() > b.len()).unwrap_or(true);
                if longer {
                    best = Some((top, coverage));
                }
            }
        }

        // Fallback: the single most frequent full prefix at >= 50%.
        if best.is_none() {
            let (top, count) =
                prefix_counts.into_iter().max_by_key(|(_, count)| *count)?;
            let coverage = count as f64 / total as f64;
            if coverage >= self.fallback_coverage {
                best = Some((top, coverage));
            } else {
                debug!("no dominant prefix; best coverage {:.1}%", coverage * 100.0);
                return None;
            }
        }

        let (tokens, coverage) = best?;
        let regex = prefix_to_regex(&tokens);
        let prefix_length = estimate_prefix_length(lines, &regex);
        Some(PrefixPattern {
            pattern: tokens.join(" "),
            regex,
            coverage,
            prefix_length,
            token_count: tokens.len(),
        })
    }

    /// Sample lines from a file, skipping the first `skip_ratio` of it —
    /// boot-time logs often differ in format.
    pub fn sample_file(&self, path: &Path) -> Vec<String> {
        let Ok(file) = std::fs::File::open(path) else { return Vec::new() };
        let Ok(meta) = file.metadata() else { return Vec::new() };
        let skip = (meta.len() as f64 * self.skip_ratio) as u64;

        let mut reader = BufReader::new(file);
        if skip > 0 {
            if reader.seek(SeekFrom::Start(skip)).is_err() {
                return Vec::new();
            }
            // Discard the partial line the seek landed in.
            let mut partial = Vec::new();
            let _ = reader.read_until(b'\n', &mut partial);
        }

        let mut lines = Vec::with_capacity(self.sample_lines);
        let mut raw = Vec::new();
        for _ in 0..self.sample_lines * 2 {
            raw.clear();
            match reader.read_until(b'\n', &mut raw) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim_end_matches(['\n', '\r']);
            if !text.trim().is_empty() {
                lines.push(text.to_string());
                if lines.len() >= self.sample_lines {
                    break;
                }
            }
        }
        lines
    }

    pub fn extract_from_file(&self, path: &Path) -> Option<PrefixPattern> {
        let lines = self.sample_file(path);
        self.extract_from_lines(&lines)
    }
}

/// Convert masked tokens to an anchored regex, `\s+` between tokens. Tokens
/// may embed tags (`daemon<NUM_ID>:`); literal text is escaped around them.
fn prefix_to_regex(tokens: &[String]) -> String {
    let mut parts = vec!["^".to_string()];
    for (i, token) in tokens.iter().enumerate() {
        parts.push(convert_token(token));
        if i + 1 < tokens.len() {
            parts.push(r"\s+".to_string());
        }
    }
    parts.concat()
}

fn convert_token(token: &str) -> String {
    if let Some(class) = tag_regex(token) {
        return class.to_string();
    }
    let tag_finder = Regex::new(r"<[A-Z_*]+>").expect("static tag regex");
    let mut out = String::new();
    let mut last = 0;
    for found in tag_finder.find_iter(token) {
        if found.start() > last {
            out.push_str(&regex::escape(&token[last..found.start()]));
        }
        out.push_str(tag_regex(found.as_str()).unwrap_or(r"\S+"));
        last = found.end();
    }
    if last < token.len() {
        out.push_str(&regex::escape(&token[last..]));
    }
    if out.is_empty() {
        regex::escape(token)
    } else {
        out
    }
}

/// Median match length of the emitted regex over the first 100 sample lines.
fn estimate_prefix_length(lines: &[String], regex: &str) -> usize {
    let Ok(re) = Regex::new(regex) else { return 0 };
    let mut lengths: Vec<usize> = lines
        .iter()
        .take(100)
        .filter_map(|line| re.find(line).filter(|m| m.start() == 0).map(|m| m.end()))
        .collect();
    if lengths.is_empty() {
        return 0;
    }
    lengths.sort_unstable();
    lengths[lengths.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_log(count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                format!(
                    "2024-03-0{} 10:00:{:02} INFO [svc-{}] request {} handled",
                    i % 9 + 1,
                    i % 60,
                    i % 4,
                    i
                )
            })
            .collect()
    }

    #[test]
    fn masking_priority_order() {
        let ex = PrefixExtractor::default();
        assert_eq!(
            ex.mask("2024-03-01T10:00:00.123Z INFO start"),
            "<DATETIME> <LEVEL> start"
        );
        assert_eq!(ex.mask("2024-03-01 10:00:00 ok"), "<DATE> <TIME> ok");
        assert_eq!(ex.mask("Dec 10 up"), "<SYSDATE> up");
        assert_eq!(ex.mask("[12345] [my-comp.service]"), "<NUM_ID> <COMPONENT>");
        assert_eq!(ex.mask("deadbeef01 10.0.0.1 x 42"), "<HEX> <IP> x <NUM>");
    }

    #[test]
    fn uniform_log_yields_high_coverage_prefix() {
        let ex = PrefixExtractor::default();
        let pattern = ex.extract_from_lines(&sample_log(500)).expect("dominant prefix");
        assert!(pattern.coverage >= 0.9, "coverage {}", pattern.coverage);
        assert!(pattern.pattern.starts_with("<DATE> <TIME> <LEVEL>"), "{}", pattern.pattern);
        assert!(pattern.regex.starts_with('^'));
        assert!(pattern.token_count >= 3);
        assert!(pattern.prefix_length > 10);

        // The emitted regex matches conformant lines and rejects others.
        let re = Regex::new(&pattern.regex).unwrap();
        assert!(re.is_match("2024-03-05 10:00:33 INFO [svc-1] request 9 handled"));
        assert!(!re.is_match("free-form chatter with no prefix"));
    }

    #[test]
    fn mixed_formats_fall_back_or_abstain() {
        let ex = PrefixExtractor::default();
        // Three wildly different shapes, none dominant.
        let mut lines = Vec::new();
        for i in 0..40 {
            lines.push(format!("alpha shape number {i} with tail"));
            lines.push(format!("{{\"json\": {i}, \"shape\": true}}"));
            lines.push(format!("<{i}> angled shape trailing words here"));
        }
        assert!(ex.extract_from_lines(&lines).is_none());
    }

    #[test]
    fn fallback_threshold_accepts_weak_majority() {
        let ex = PrefixExtractor::default();
        let mut lines = sample_log(60);
        for i in 0..40 {
            lines.push(format!("unstructured {i} noise {} tail", i * 7));
        }
        // 60% structured: below 0.9, above the 0.5 fallback.
        let pattern = ex.extract_from_lines(&lines).expect("fallback prefix");
        assert!(pattern.coverage >= 0.5 && pattern.coverage < 0.9);
    }

    #[test]
    fn empty_input_abstains() {
        let ex = PrefixExtractor::default();
        assert!(ex.extract_from_lines(&[]).is_none());
        assert!(ex.extract_from_lines(&["   ".to_string(), String::new()]).is_none());
    }

    #[test]
    fn embedded_tags_convert_with_escaped_literals() {
        let converted = convert_token("daemon<NUM_ID>:");
        assert_eq!(converted, r"daemon\[\d+\]:");
        let re = Regex::new(&converted).unwrap();
        assert!(re.is_match("daemon[123]:"));
        assert!(!re.is_match("daemon[abc]:"));
    }

    #[test]
    fn sampling_skips_file_head() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boot.log");
        let mut content = String::new();
        for i in 0..200 {
            content.push_str(&format!("BOOT noise {i}\n"));
        }
        for i in 0..2_000 {
            content.push_str(&format!("2024-03-01 10:00:00 INFO steady {i}\n"));
        }
        std::fs::write(&path, &content).unwrap();

        let ex = PrefixExtractor::default();
        let lines = ex.sample_file(&path);
        assert!(!lines.is_empty());
        // 5% skip lands past the boot noise for this layout.
        assert!(lines[0].starts_with("2024-03-01"), "{}", lines[0]);

        let pattern = ex.extract_from_file(&path).expect("prefix from steady section");
        assert!(pattern.pattern.contains("<DATE>"));
    }

    #[test]
    fn similarity_is_positional() {
        let t = |s: &str| s.split(' ').map(String::from).collect::<Vec<_>>();
        assert_eq!(similarity(&t("a b c"), &t("a b c")), 1.0);
        assert!((similarity(&t("a b c"), &t("a b d")) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(similarity(&t("a <*> c"), &t("a anything c")), 1.0);
        assert_eq!(similarity(&t("a b"), &t("a b c")), 0.0, "length mismatch");
    }
}
