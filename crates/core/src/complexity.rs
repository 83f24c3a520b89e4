//! Static complexity scoring for regex patterns.
//!
//! Flags structures known to cause catastrophic backtracking (ReDoS) before
//! a pattern is handed to the engine: nested quantifiers, stacked greedy
//! wildcards, overlapping alternations, backreferences. The score is a
//! heuristic — categories and relative ordering matter, exact numbers are
//! tunables.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;

/// Severity bucket for a scored pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    VerySimple,
    Simple,
    Moderate,
    Complex,
    VeryComplex,
    Dangerous,
}

impl ComplexityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ComplexityLevel::VerySimple => "very_simple",
            ComplexityLevel::Simple => "simple",
            ComplexityLevel::Moderate => "moderate",
            ComplexityLevel::Complex => "complex",
            ComplexityLevel::VeryComplex => "very_complex",
            ComplexityLevel::Dangerous => "dangerous",
        }
    }
}

/// Scored analysis of one pattern.
#[derive(Clone, Debug, Serialize)]
pub struct Complexity {
    pub score: f64,
    pub level: ComplexityLevel,
    pub risk: &'static str,
    pub warnings: Vec<String>,
    /// Score contribution per component.
    pub details: BTreeMap<&'static str, f64>,
    pub pattern_length: usize,
}

fn count(haystack: &str, pattern: &str) -> usize {
    Regex::new(pattern).map(|re| re.find_iter(haystack).count()).unwrap_or(0)
}

/// Score a pattern. Never fails: an unparsable pattern still gets a score
/// from its surface syntax.
pub fn analyze_pattern(pattern: &str) -> Complexity {
    let mut score = 0.0f64;
    let mut warnings: Vec<String> = Vec::new();
    let mut details: BTreeMap<&'static str, f64> = BTreeMap::new();

    // Nested quantifiers: (a+)+, (a*){2,}, (a|b)+ — exponential blowup.
    let nested = count(pattern, r"\([^)]*[+*{][^)]*\)[+*{]")
        + count(pattern, r"\([^)]*\|[^)]*\)[+*{]");
    if nested > 0 {
        let points = nested as f64 * 50.0;
        score += points;
        details.insert("nested_quantifiers", points);
        warnings.push(format!("Found {nested} nested quantifier(s) - CRITICAL ReDoS risk"));
    }

    // Stacked greedy quantifiers: adjacent pairs and repeated .* / .+.
    let adjacent = count(pattern, r"[.+*]\s*[.+*]");
    let dot_stars = pattern.matches(".*").count();
    let dot_plus = pattern.matches(".+").count();
    let mut greedy_points = 0.0;
    let mut greedy_parts: Vec<String> = Vec::new();
    if adjacent > 0 {
        greedy_points += adjacent as f64 * 25.0;
        greedy_parts.push(format!("{adjacent} adjacent greedy quantifier(s)"));
    }
    if dot_stars >= 2 {
        greedy_points += (dot_stars - 1) as f64 * 30.0;
        greedy_parts.push(format!("{dot_stars} .* pattern(s)"));
    }
    if dot_plus >= 2 {
        greedy_points += (dot_plus - 1) as f64 * 25.0;
        greedy_parts.push(format!("{dot_plus} .+ pattern(s)"));
    }
    if greedy_points > 0.0 {
        score += greedy_points;
        details.insert("greedy_sequences", greedy_points);
        warnings
            .push(format!("Found {} - CRITICAL backtracking risk", greedy_parts.join(", ")));
    }

    // Overlapping quantified alternations: (a|ab)+.
    let overlapping = count(pattern, r"\([^)]*\|[^)]+\)[+*]");
    if overlapping > 0 && nested == 0 {
        let points = overlapping as f64 * 30.0;
        score += points;
        details.insert("overlapping_groups", points);
        warnings.push(format!(
            "Found {overlapping} potentially overlapping quantified group(s)"
        ));
    }

    // Lookarounds: engine-dependent, always a rescan cost.
    let lookarounds = count(pattern, r"\(\?[=!<]");
    if lookarounds > 0 {
        let points = lookarounds as f64 * 15.0;
        score += points;
        details.insert("lookarounds", points);
    }

    // Backreferences: matching becomes NP-complete.
    let backrefs = count(pattern, r"\\[1-9]\d*");
    if backrefs > 0 {
        let points = backrefs as f64 * 20.0;
        score += points;
        details.insert("backreferences", points);
        warnings.push(format!("Found {backrefs} backreference(s) - NP-complete matching"));
    }

    // Alternation breadth.
    let pipes = pattern.matches('|').count();
    if pipes > 0 {
        let nested_alt = count(pattern, r"\([^)]*\|[^)]*\)[^)]*\|");
        let points = pipes as f64 * 5.0 + nested_alt as f64 * 10.0;
        score += points;
        details.insert("alternation", points);
        if nested_alt > 0 {
            warnings.push("Found nested alternation - increases backtracking".into());
        }
    }

    // Cheap constructs.
    let char_classes = count(pattern, r"\[[^\]]+\]") + count(pattern, r"\[\^[^\]]+\]");
    if char_classes > 0 {
        details.insert("character_classes", char_classes as f64);
        score += char_classes as f64;
    }
    let quantifiers = count(pattern, r"[^\\][+*?]|\{\d+,?\d*\}");
    let lazy = count(pattern, r"[+*?]\?");
    let quant_points = quantifiers as f64 * 3.0 + lazy as f64 * 2.0;
    if quant_points > 0.0 {
        details.insert("quantifiers", quant_points);
        score += quant_points;
    }
    let anchors = count(pattern, r"[\^$]|\\[bBAGzZ]");
    if anchors > 0 {
        details.insert("anchors", anchors as f64);
        score += anchors as f64;
    }
    let specials = count(pattern, r"[\\()\[\]{}|+*?.^$]");
    let literals = pattern.chars().count().saturating_sub(specials) as f64 * 0.1;
    details.insert("literals", (literals * 10.0).round() / 10.0);
    score += literals;

    // Star height multiplier for group nesting depth.
    let mut depth = 0i32;
    let mut max_depth = 0i32;
    for c in pattern.chars() {
        match c {
            '(' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ')' => depth -= 1,
            _ => {}
        }
    }
    if max_depth > 1 {
        let multiplier = 1.5f64.powi(max_depth - 1);
        score *= multiplier;
        details.insert("star_height_multiplier", (multiplier * 100.0).round() / 100.0);
        details.insert("star_height_depth", max_depth as f64);
        if max_depth >= 3 {
            warnings
                .push(format!("Deep nesting (depth {max_depth}) - complexity multiplier applied"));
        }
    }

    // Length multiplier for very long patterns.
    let len = pattern.chars().count();
    if len > 20 {
        let multiplier = (len as f64).ln() / 10.0;
        score *= multiplier;
        details.insert("length_multiplier", (multiplier * 100.0).round() / 100.0);
    }

    let score = (score * 10.0).round() / 10.0;
    let (level, risk) = match score {
        s if s <= 10.0 => {
            (ComplexityLevel::VerySimple, "Very low - essentially substring search")
        }
        s if s <= 30.0 => (ComplexityLevel::Simple, "Low - basic pattern matching"),
        s if s <= 60.0 => {
            (ComplexityLevel::Moderate, "Medium - reasonable performance expected")
        }
        s if s <= 100.0 => {
            (ComplexityLevel::Complex, "High - monitor performance on large files")
        }
        s if s <= 200.0 => {
            (ComplexityLevel::VeryComplex, "Very high - significant performance impact likely")
        }
        _ => (ComplexityLevel::Dangerous, "CRITICAL - ReDoS risk, catastrophic backtracking likely"),
    };
    if level == ComplexityLevel::Dangerous {
        warnings.push("DANGER: This pattern may cause catastrophic backtracking!".into());
    }

    Complexity { score, level, risk, warnings, details, pattern_length: len }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_is_very_simple() {
        let c = analyze_pattern("hello");
        assert_eq!(c.level, ComplexityLevel::VerySimple);
        assert!(c.score <= 10.0);
        assert!(c.warnings.is_empty());
    }

    #[test]
    fn anchored_class_stays_simple() {
        let c = analyze_pattern("^[a-z]+$");
        assert!(matches!(c.level, ComplexityLevel::VerySimple | ComplexityLevel::Simple));
        assert!(c.details.contains_key("character_classes"));
        assert!(c.details.contains_key("anchors"));
    }

    #[test]
    fn nested_quantifiers_are_critical() {
        let c = analyze_pattern("(a+)+");
        assert!(c.score >= 50.0);
        assert!(c.details.contains_key("nested_quantifiers"));
        assert!(c.warnings.iter().any(|w| w.contains("nested quantifier")));
    }

    #[test]
    fn stacked_wildcards_flagged() {
        let c = analyze_pattern(".*.*");
        assert!(c.score >= 25.0);
        assert!(c.details.contains_key("greedy_sequences"));
        assert!(c.warnings.iter().any(|w| w.contains("backtracking")));
    }

    #[test]
    fn overlapping_alternation_flagged() {
        let c = analyze_pattern("(a|ab)+");
        assert!(c.score >= 30.0);
        assert!(
            c.details.contains_key("overlapping_groups")
                || c.details.contains_key("nested_quantifiers")
        );
    }

    #[test]
    fn backreferences_flagged() {
        let c = analyze_pattern(r"(\w+) \1");
        assert!(c.details.contains_key("backreferences"));
        assert!(c.warnings.iter().any(|w| w.contains("backreference")));
    }

    #[test]
    fn ordering_is_monotone_with_danger() {
        let simple = analyze_pattern("error");
        let moderate = analyze_pattern(r"\w+@\w+\.\w+");
        let nasty = analyze_pattern("((a+)+b)+c.*.*");
        assert!(simple.score < moderate.score);
        assert!(moderate.score < nasty.score);
        assert!(matches!(
            nasty.level,
            ComplexityLevel::VeryComplex | ComplexityLevel::Dangerous
        ));
    }

    #[test]
    fn levels_cover_score_bands() {
        for (pattern, max) in [("x", 10.0), ("^x$", 30.0)] {
            let c = analyze_pattern(pattern);
            assert!(c.score <= max, "{pattern} scored {}", c.score);
        }
    }
}
