//! Streaming statistics for line lengths.
//!
//! Files can exceed memory, so exact values (count, extrema, mean, stddev)
//! are maintained without sampling while quantiles (median, p95, p99) come
//! from a fixed-capacity uniform reservoir. Totals and extrema drive
//! correctness; quantiles only feed anomaly thresholds where ±1% is fine.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::types::LineEnding;

// ---------------------------------------------------------------------------
// Welford running mean / stddev
// ---------------------------------------------------------------------------

/// Numerically stable running mean and standard deviation.
#[derive(Clone, Debug, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> RunningStats {
        RunningStats::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample standard deviation; 0 for fewer than two observations.
    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

// ---------------------------------------------------------------------------
// Reservoir sampling
// ---------------------------------------------------------------------------

/// Fixed-capacity uniform random sample maintained streaming (algorithm R).
#[derive(Clone, Debug)]
pub struct Reservoir {
    capacity: usize,
    seen: u64,
    values: Vec<u64>,
    rng: SmallRng,
}

impl Reservoir {
    pub fn new(capacity: usize) -> Reservoir {
        Reservoir {
            capacity: capacity.max(1),
            seen: 0,
            values: Vec::new(),
            rng: SmallRng::seed_from_u64(0x5eed_1e55),
        }
    }

    pub fn offer(&mut self, value: u64) {
        self.seen += 1;
        if self.values.len() < self.capacity {
            self.values.push(value);
        } else {
            let slot = self.rng.gen_range(0..self.seen);
            if (slot as usize) < self.capacity {
                self.values[slot as usize] = value;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every offered value is still present (no sampling happened).
    pub fn is_exact(&self) -> bool {
        self.seen as usize <= self.capacity
    }

    /// Percentile with linear interpolation over the sampled values.
    pub fn percentile(&self, p: f64) -> f64 {
        let mut sorted = self.values.clone();
        sorted.sort_unstable();
        percentile_of_sorted(&sorted, p)
    }
}

/// `p` in percent over an ascending slice, interpolating between ranks.
pub fn percentile_of_sorted(sorted: &[u64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let k = (n - 1) as f64 * p / 100.0;
    let floor = k.floor() as usize;
    let ceil = if floor + 1 < n { floor + 1 } else { floor };
    sorted[floor] as f64 + (k - floor as f64) * (sorted[ceil] as f64 - sorted[floor] as f64)
}

// ---------------------------------------------------------------------------
// Line-ending detection
// ---------------------------------------------------------------------------

/// Count `\r\n`, bare `\r`, and bare `\n` over a sample (the first 64 KiB in
/// practice). One style present reports that style, several report `mixed`,
/// none defaults to LF.
pub fn detect_line_ending(sample: &[u8]) -> LineEnding {
    let mut crlf = 0u64;
    let mut cr = 0u64;
    let mut lf = 0u64;
    let mut i = 0;
    while i < sample.len() {
        match sample[i] {
            b'\r' => {
                if sample.get(i + 1) == Some(&b'\n') {
                    crlf += 1;
                    i += 2;
                    continue;
                }
                cr += 1;
            }
            b'\n' => lf += 1,
            _ => {}
        }
        i += 1;
    }
    let styles = [(crlf, LineEnding::CrLf), (lf, LineEnding::Lf), (cr, LineEnding::Cr)];
    let present: Vec<LineEnding> =
        styles.iter().filter(|(n, _)| *n > 0).map(|(_, e)| *e).collect();
    match present.as_slice() {
        [] => LineEnding::Lf,
        [only] => *only,
        _ => LineEnding::Mixed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn welford_matches_direct_computation() {
        let values = [3.0, 7.0, 7.0, 19.0];
        let mut stats = RunningStats::new();
        for v in values {
            stats.push(v);
        }
        assert_eq!(stats.count(), 4);
        assert!((stats.mean() - 9.0).abs() < 1e-9);
        // Sample stddev of [3,7,7,19] = sqrt(((−6)²+(−2)²+(−2)²+10²)/3)
        let expected = (144.0f64 / 3.0).sqrt();
        assert!((stats.stddev() - expected).abs() < 1e-9);
    }

    #[test]
    fn welford_degenerate_cases() {
        let mut stats = RunningStats::new();
        assert_eq!(stats.mean(), 0.0);
        assert_eq!(stats.stddev(), 0.0);
        stats.push(5.0);
        assert_eq!(stats.mean(), 5.0);
        assert_eq!(stats.stddev(), 0.0);
    }

    #[test]
    fn reservoir_is_exact_under_capacity() {
        let mut r = Reservoir::new(100);
        for v in 0..50u64 {
            r.offer(v);
        }
        assert!(r.is_exact());
        assert_eq!(r.len(), 50);
        assert!((r.percentile(50.0) - 24.5).abs() < 1e-9);
    }

    #[test]
    fn reservoir_caps_memory_and_stays_plausible() {
        let mut r = Reservoir::new(1_000);
        for v in 0..100_000u64 {
            r.offer(v);
        }
        assert!(!r.is_exact());
        assert_eq!(r.len(), 1_000);
        // Uniform input: the sampled median should land near the true median.
        let median = r.percentile(50.0);
        assert!(median > 30_000.0 && median < 70_000.0, "median {median}");
    }

    #[test]
    fn percentile_interpolates() {
        let sorted = [10u64, 20, 30, 40];
        assert_eq!(percentile_of_sorted(&sorted, 0.0), 10.0);
        assert_eq!(percentile_of_sorted(&sorted, 100.0), 40.0);
        assert_eq!(percentile_of_sorted(&sorted, 50.0), 25.0);
        assert_eq!(percentile_of_sorted(&[], 50.0), 0.0);
    }

    #[test]
    fn line_ending_styles() {
        assert_eq!(detect_line_ending(b"a\nb\n"), LineEnding::Lf);
        assert_eq!(detect_line_ending(b"a\r\nb\r\n"), LineEnding::CrLf);
        assert_eq!(detect_line_ending(b"a\rb\r"), LineEnding::Cr);
        assert_eq!(detect_line_ending(b"a\r\nb\n"), LineEnding::Mixed);
        assert_eq!(detect_line_ending(b"no terminator"), LineEnding::Lf);
        assert_eq!(detect_line_ending(b""), LineEnding::Lf);
    }
}
