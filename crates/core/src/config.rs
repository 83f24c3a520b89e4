//! Runtime configuration for the rx core.
//!
//! The environment is snapshotted exactly once, at [`Config::from_env`];
//! changing a variable afterwards has no effect on a constructed subsystem.
//! Every subsystem takes a `&Config` (or a clone) at construction instead of
//! reading globals.

use std::path::{Path, PathBuf};

/// Default threshold above which files are considered "large" (MiB): large
/// files get a persistent line-offset index and are eligible for the trace
/// cache.
pub const DEFAULT_LARGE_FILE_MB: u64 = 50;

/// Default reservoir capacity for line-length quantile estimation.
pub const DEFAULT_SAMPLE_SIZE_LINES: usize = 1_000_000;

/// Minimum bytes of file per search chunk. Files below this run as a single
/// chunk.
pub const MIN_CHUNK_BYTES: u64 = 20 * 1024 * 1024;

/// Upper bound on chunks for a single file regardless of size.
pub const MAX_CHUNKS_PER_FILE: usize = 32;

/// Sliding-window length (previous lines) handed to anomaly detectors.
pub const DETECTOR_WINDOW_LINES: usize = 32;

/// Files at or above this size take the fast indexing path: line count and
/// line ending only, no statistics.
pub const FAST_PATH_BYTES: u64 = 1024 * 1024 * 1024;

/// Snapshot of all environment-driven settings.
#[derive(Clone, Debug)]
pub struct Config {
    /// Threshold in bytes for indexing and trace caching (`RX_LARGE_FILE_MB`).
    pub large_file_threshold: u64,
    /// Reservoir capacity for quantiles (`RX_SAMPLE_SIZE_LINES`).
    pub sample_size_lines: usize,
    /// Root directory holding `indexes/` and `trace_cache/` (`RX_CACHE_DIR`).
    pub cache_dir: PathBuf,
    /// Allowed search roots (`RX_SEARCH_ROOTS`, OS path separator joined).
    pub search_roots: Vec<PathBuf>,
    /// Disable the trace cache (`RX_NO_CACHE`).
    pub no_cache: bool,
    /// Disable the line-offset index (`RX_NO_INDEX`).
    pub no_index: bool,
    /// Cap on concurrently live regex-engine subprocesses
    /// (`RX_MAX_SUBPROCESSES`, default = CPU count).
    pub max_subprocesses: usize,
}

impl Config {
    /// Capture the environment once.
    pub fn from_env() -> Self {
        let large_file_threshold = env_u64("RX_LARGE_FILE_MB")
            .filter(|mb| *mb > 0)
            .unwrap_or(DEFAULT_LARGE_FILE_MB)
            * 1024
            * 1024;

        let sample_size_lines = env_u64("RX_SAMPLE_SIZE_LINES")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_SAMPLE_SIZE_LINES);

        let cache_dir = std::env::var_os("RX_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_cache_dir);

        let search_roots = std::env::var_os("RX_SEARCH_ROOTS")
            .map(|raw| std::env::split_paths(&raw).collect::<Vec<_>>())
            .filter(|roots| !roots.is_empty())
            .unwrap_or_default();

        let max_subprocesses = env_u64("RX_MAX_SUBPROCESSES")
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or_else(num_cpus::get);

        Config {
            large_file_threshold,
            sample_size_lines,
            cache_dir,
            search_roots,
            no_cache: env_flag("RX_NO_CACHE"),
            no_index: env_flag("RX_NO_INDEX"),
            max_subprocesses,
        }
    }

    /// Checkpoint spacing for the line-offset index: `threshold / 50`
    /// (1 MiB at the default threshold).
    pub fn index_step_bytes(&self) -> u64 {
        (self.large_file_threshold / 50).max(1)
    }

    /// Directory for persisted line-offset indexes.
    pub fn index_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("indexes")
    }

    /// Directory for persisted trace caches.
    pub fn trace_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("trace_cache")
    }

    /// True when `size` qualifies the file for indexing and trace caching.
    pub fn is_large_file(&self, size: u64) -> bool {
        size >= self.large_file_threshold
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            large_file_threshold: DEFAULT_LARGE_FILE_MB * 1024 * 1024,
            sample_size_lines: DEFAULT_SAMPLE_SIZE_LINES,
            cache_dir: default_cache_dir(),
            search_roots: Vec::new(),
            no_cache: false,
            no_index: false,
            max_subprocesses: num_cpus::get(),
        }
    }
}

/// `$XDG_CACHE_HOME/rx` or `~/.cache/rx`; relative `.rx-cache` as a last
/// resort when no home directory is discoverable.
fn default_cache_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME") {
        let base = PathBuf::from(xdg);
        if base.is_absolute() {
            return base.join("rx");
        }
    }
    if let Some(home) = std::env::var_os("HOME") {
        return Path::new(&home).join(".cache").join("rx");
    }
    PathBuf::from(".rx-cache")
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
