//! rx CLI — search, analyse, index, and compress log files from the
//! terminal. Calls `rx-core` directly with no server overhead.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use rx_core::analyze::{category_catalog, detector_catalog};
use rx_core::complexity::analyze_pattern;
use rx_core::index::{
    build_index, clear_indexes, delete_index, ensure_index, ensure_indexes,
    line_info_for_offsets, load_index, BuildOptions,
};
use rx_core::sandbox::Sandbox;
use rx_core::search::{expand_paths, SearchDriver, SearchRequest};
use rx_core::seekable::{create_seekable, seekable_info, SeekableOptions};
use rx_core::trace_cache;
use rx_core::types::CancelToken;
use rx_core::{Config, RxError, TraceOutcome};

/// rx — fast regex search and analysis for large log files.
#[derive(Parser)]
#[command(name = "rx", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Search files or directories for regex patterns
    Search {
        /// Files or directories to search
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Regex pattern (repeatable)
        #[arg(short = 'e', long = "regexp", required = true)]
        patterns: Vec<String>,

        /// Case-insensitive matching
        #[arg(short = 'i', long)]
        ignore_case: bool,

        /// Match whole words only
        #[arg(short = 'w', long)]
        word: bool,

        /// Treat patterns as fixed strings
        #[arg(short = 'F', long)]
        fixed: bool,

        /// Match whole lines only
        #[arg(short = 'x', long)]
        line: bool,

        /// Maximum number of results across all files and patterns
        #[arg(long)]
        max_results: Option<usize>,

        /// Context lines before each match
        #[arg(short = 'B', long)]
        before: Option<usize>,

        /// Context lines after each match
        #[arg(short = 'A', long)]
        after: Option<usize>,

        /// Context lines both before and after
        #[arg(short = 'C', long)]
        context: Option<usize>,

        /// Recurse into directories
        #[arg(short = 'r', long)]
        recursive: bool,

        /// Skip the line-offset index (absolute line numbers may be absent)
        #[arg(long)]
        no_index: bool,

        /// Skip the trace cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Analyse files: line statistics and anomaly detection
    Analyse {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Run anomaly detectors
        #[arg(long)]
        anomalies: bool,

        /// Recurse into directories
        #[arg(short = 'r', long)]
        recursive: bool,
    },
    /// Build, inspect, or delete the line-offset index of a file
    Index {
        path: PathBuf,

        /// Include line statistics and anomaly detection in the build
        #[arg(long)]
        analyze: bool,

        /// Show the cached index instead of building
        #[arg(long)]
        info: bool,

        /// Delete the cached index
        #[arg(long)]
        delete: bool,
    },
    /// Re-encode a file as seekable zstd
    Compress {
        input: PathBuf,

        /// Output path (default: input with .zst appended)
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Target decompressed frame size in MiB
        #[arg(long, default_value = "4")]
        frame_size_mb: u64,

        /// zstd compression level
        #[arg(long, default_value = "3")]
        level: i32,

        /// Show the seek table of an existing seekable file instead
        #[arg(long)]
        info: bool,
    },
    /// Score a regex pattern for ReDoS risk, or list detectors
    Check {
        /// Pattern to score
        pattern: Option<String>,

        /// List registered anomaly detectors and categories
        #[arg(long)]
        detectors: bool,
    },
    /// Show context lines around byte offsets of a file
    Samples {
        path: PathBuf,

        /// Byte offsets to sample
        #[arg(required = true)]
        offsets: Vec<u64>,

        /// Context lines before and after each offset
        #[arg(short = 'C', long, default_value = "3")]
        context: u64,
    },
    /// Inspect or clear the on-disk caches
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show cache locations and entry counts
    Info,
    /// Remove cached indexes and/or trace records
    Clear {
        /// Only the line-offset indexes
        #[arg(long)]
        indexes: bool,
        /// Only the trace caches
        #[arg(long)]
        traces: bool,
    },
}

// ---------------------------------------------------------------------------
// Config file (~/.config/rx/config.toml)
// ---------------------------------------------------------------------------

/// Optional TOML overrides: search roots and cache directory. Environment
/// variables always win.
fn apply_config_file(config: &mut Config) {
    let Some(home) = std::env::var_os("HOME") else { return };
    let path = Path::new(&home).join(".config").join("rx").join("config.toml");
    let Ok(raw) = std::fs::read_to_string(&path) else { return };
    let Ok(value) = raw.parse::<toml::Table>() else {
        tracing::warn!("ignoring unparsable {}", path.display());
        return;
    };
    if config.search_roots.is_empty() {
        if let Some(roots) = value.get("search_roots").and_then(|v| v.as_array()) {
            config.search_roots =
                roots.iter().filter_map(|v| v.as_str()).map(PathBuf::from).collect();
        }
    }
    if std::env::var_os("RX_CACHE_DIR").is_none() {
        if let Some(dir) = value.get("cache_dir").and_then(|v| v.as_str()) {
            config.cache_dir = PathBuf::from(dir);
        }
    }
}

/// Resolve user paths: through the sandbox when roots are configured,
/// plain canonicalization otherwise.
fn resolve_paths(config: &Config, paths: &[PathBuf]) -> Result<Vec<PathBuf>, RxError> {
    if config.search_roots.is_empty() {
        paths.iter().map(|p| p.canonicalize().map_err(RxError::Io)).collect()
    } else {
        Sandbox::from_config(config)?.validate_all(paths)
    }
}

// ---------------------------------------------------------------------------
// Output helpers
// ---------------------------------------------------------------------------

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(body) => println!("{body}"),
        Err(e) => eprintln!("error: failed to serialize output: {e}"),
    }
}

fn print_outcome(outcome: &TraceOutcome) {
    if outcome.patterns.len() == 1 {
        let pattern = outcome.patterns.values().next().map(String::as_str).unwrap_or("");
        println!("Pattern: {pattern}");
    } else {
        println!("Patterns ({}):", outcome.patterns.len());
        for (id, pattern) in &outcome.patterns {
            println!("  {id}: {pattern}");
        }
    }
    println!("Time: {:.3}s", outcome.time);
    println!("Files scanned: {}", outcome.scanned_files.len());
    if !outcome.skipped_files.is_empty() {
        println!("Files skipped: {}", outcome.skipped_files.len());
        for skip in &outcome.skipped_files {
            println!("  {}: {}", skip.path.display(), skip.reason);
        }
    }
    println!(
        "Matches: {}{}",
        outcome.matches.len(),
        if outcome.truncated { " (capped)" } else { "" }
    );
    for m in &outcome.matches {
        let path = outcome.file_path(m).unwrap_or("?");
        let line =
            m.line_number.map(|n| n.to_string()).unwrap_or_else(|| "?".to_string());
        println!("  {path}:{line}:{}  {}", m.offset, m.line_text);
        let key = rx_core::types::context_key(&m.pattern, &m.file, m.offset);
        if let Some(context) = outcome.context_lines.get(&key) {
            for ctx in context {
                println!("    | {}", ctx.line_text);
            }
        }
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn print_index_summary(index: &rx_core::index::UnifiedFileIndex) {
    println!("{}", index.source_path);
    println!(
        "  {} ({} lines, {} empty), line ending {}",
        human_size(index.source_size_bytes),
        index.line_count,
        index.empty_line_count,
        index.line_ending,
    );
    if let Some(stats) = &index.line_stats {
        println!(
            "  line length: max={} (line {}) avg={:.1} median={:.1} p95={:.1} p99={:.1} stddev={:.1}",
            stats.max,
            stats.max_line_number,
            stats.avg,
            stats.median,
            stats.p95,
            stats.p99,
            stats.stddev,
        );
    }
    println!("  checkpoints: {}", index.line_index.len());
    if index.analysis_performed && !index.anomalies.is_empty() {
        println!("  anomalies: {}", index.anomalies.len());
        for (category, count) in &index.anomaly_summary {
            println!("    {category}: {count}");
        }
        for anomaly in index.anomalies.iter().take(20) {
            println!(
                "    [{:.2}] {} lines {}-{}: {}",
                anomaly.severity,
                anomaly.detector,
                anomaly.start_line,
                anomaly.end_line,
                anomaly.description,
            );
        }
        if index.anomalies.len() > 20 {
            println!("    ... and {} more", index.anomalies.len() - 20);
        }
    }
}

/// Read a single line's text by number through the index.
fn read_line(
    path: &Path,
    index: &rx_core::index::UnifiedFileIndex,
    line_no: u64,
) -> Result<Option<String>, RxError> {
    use std::io::{BufRead, BufReader, Seek, SeekFrom};
    let Some(offset) = rx_core::index::offset_for_line(path, index, line_no)? else {
        return Ok(None);
    };
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.flatten().count()).unwrap_or(0)
}

fn count_tree(dir: &Path) -> usize {
    let mut total = 0;
    if let Ok(buckets) = std::fs::read_dir(dir) {
        for bucket in buckets.flatten() {
            total += count_files(&bucket.path());
        }
    }
    total
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rx=warn".parse().expect("static directive")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    apply_config_file(&mut config);

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, config: Config) -> Result<(), RxError> {
    match cli.command {
        Commands::Search {
            paths,
            patterns,
            ignore_case,
            word,
            fixed,
            line,
            max_results,
            before,
            after,
            context,
            recursive,
            no_index,
            no_cache,
        } => {
            let resolved = resolve_paths(&config, &paths)?;
            let mut flags = Vec::new();
            if ignore_case {
                flags.push("-i".to_string());
            }
            if word {
                flags.push("-w".to_string());
            }
            if fixed {
                flags.push("-F".to_string());
            }
            if line {
                flags.push("-x".to_string());
            }
            let request = SearchRequest {
                paths: resolved,
                patterns,
                flags,
                max_results,
                before_context: before.or(context).unwrap_or(0),
                after_context: after.or(context).unwrap_or(0),
                use_index: !no_index,
                use_cache: !no_cache,
                recursive,
            };
            let driver = SearchDriver::new(config);
            let outcome = driver.run(&request, &CancelToken::new())?;
            if cli.json {
                print_json(&outcome);
            } else {
                print_outcome(&outcome);
            }
            Ok(())
        }

        Commands::Analyse { paths, anomalies, recursive } => {
            let resolved = resolve_paths(&config, &paths)?;
            let files = expand_paths(&resolved, recursive)?;
            let options = BuildOptions { analyze: true, detect_anomalies: anomalies };
            let mut reports = Vec::new();
            for (file, result) in ensure_indexes(&files, &config, options) {
                match result {
                    Ok(index) => reports.push(index),
                    Err(e) if e.is_file_local() => {
                        eprintln!("skipped {}: {e}", file.display());
                    }
                    Err(e) => return Err(e),
                }
            }
            if cli.json {
                print_json(&reports);
            } else {
                for index in &reports {
                    print_index_summary(index);
                }
            }
            Ok(())
        }

        Commands::Index { path, analyze, info, delete } => {
            let resolved = resolve_paths(&config, &[path])?.remove(0);
            if delete {
                let removed = delete_index(&config, &resolved);
                println!("{}", if removed { "deleted" } else { "no cached index" });
                return Ok(());
            }
            if info {
                match load_index(&config, &resolved) {
                    Some(index) if cli.json => print_json(&index),
                    Some(index) => print_index_summary(&index),
                    None => println!("no valid cached index for {}", resolved.display()),
                }
                return Ok(());
            }
            let options = BuildOptions { analyze, detect_anomalies: analyze };
            let index = ensure_index(&resolved, &config, options)?;
            if cli.json {
                print_json(&index);
            } else {
                print_index_summary(&index);
            }
            Ok(())
        }

        Commands::Compress { input, output, frame_size_mb, level, info } => {
            let resolved = resolve_paths(&config, &[input])?.remove(0);
            if info {
                let details = seekable_info(&resolved)?;
                if cli.json {
                    #[derive(serde::Serialize)]
                    struct FrameRow {
                        index: usize,
                        compressed_offset: u64,
                        compressed_size: u64,
                        decompressed_offset: u64,
                        decompressed_size: u64,
                    }
                    let rows: Vec<FrameRow> = details
                        .frames
                        .iter()
                        .map(|f| FrameRow {
                            index: f.index,
                            compressed_offset: f.compressed_offset,
                            compressed_size: f.compressed_size,
                            decompressed_offset: f.decompressed_offset,
                            decompressed_size: f.decompressed_size,
                        })
                        .collect();
                    print_json(&rows);
                } else {
                    println!(
                        "{}: {} frames, {} compressed, {} decompressed",
                        details.path.display(),
                        details.frame_count(),
                        human_size(details.compressed_size),
                        human_size(details.decompressed_size),
                    );
                }
                return Ok(());
            }
            let target = output.unwrap_or_else(|| {
                let mut name = resolved.as_os_str().to_os_string();
                name.push(".zst");
                PathBuf::from(name)
            });
            let options = SeekableOptions {
                frame_size_bytes: frame_size_mb.max(1) * 1024 * 1024,
                compression_level: level,
            };
            let created = create_seekable(&resolved, &target, options)?;
            println!(
                "{} -> {} ({} frames, {} -> {})",
                resolved.display(),
                created.path.display(),
                created.frame_count(),
                human_size(created.decompressed_size),
                human_size(created.compressed_size),
            );
            Ok(())
        }

        Commands::Check { pattern, detectors } => {
            if detectors {
                let catalog = detector_catalog();
                if cli.json {
                    print_json(&catalog);
                } else {
                    println!("Detectors:");
                    for d in &catalog {
                        println!(
                            "  {:20} {:10} severity {:.2}-{:.2}{}",
                            d.name,
                            d.category.as_str(),
                            d.severity_min,
                            d.severity_max,
                            if d.has_prescan { "  (prescan)" } else { "" },
                        );
                    }
                    println!();
                    println!("Categories:");
                    for (category, description, members) in category_catalog() {
                        println!(
                            "  {:10} {description} [{}]",
                            category.as_str(),
                            members.join(", ")
                        );
                    }
                }
                return Ok(());
            }
            let Some(pattern) = pattern else {
                return Err(RxError::RegexInvalid("no pattern given to check".into()));
            };
            let report = analyze_pattern(&pattern);
            if cli.json {
                print_json(&report);
            } else {
                println!("Pattern: {pattern}");
                println!("Score: {:.1}", report.score);
                println!("Level: {}", report.level.as_str());
                println!("Risk: {}", report.risk);
                for warning in &report.warnings {
                    println!("  - {warning}");
                }
            }
            Ok(())
        }

        Commands::Samples { path, offsets, context } => {
            let resolved = resolve_paths(&config, &[path])?.remove(0);
            let index = build_index(&resolved, &config, BuildOptions::default())?;
            let infos = line_info_for_offsets(&resolved, &index, &offsets)?;
            for offset in &offsets {
                println!("=== offset {offset} ===");
                let Some(info) = infos.get(offset) else {
                    println!("  (past end of file)");
                    continue;
                };
                let first = info.line_number.saturating_sub(context).max(1);
                let last = info.line_number + context;
                for line_no in first..=last {
                    match read_line(&resolved, &index, line_no)? {
                        Some(text) => {
                            let marker = if line_no == info.line_number { ">" } else { " " };
                            println!("{marker} {line_no}: {text}");
                        }
                        None => break,
                    }
                }
            }
            Ok(())
        }

        Commands::Cache { action } => match action {
            CacheAction::Info => {
                let index_dir = config.index_cache_dir();
                let trace_dir = config.trace_cache_dir();
                println!(
                    "Index cache: {} ({} entries)",
                    index_dir.display(),
                    count_files(&index_dir)
                );
                println!(
                    "Trace cache: {} ({} entries)",
                    trace_dir.display(),
                    count_tree(&trace_dir)
                );
                Ok(())
            }
            CacheAction::Clear { indexes, traces } => {
                let both = !indexes && !traces;
                if indexes || both {
                    println!("removed {} index record(s)", clear_indexes(&config));
                }
                if traces || both {
                    println!("removed {} trace record(s)", trace_cache::clear_all(&config));
                }
                Ok(())
            }
        },
    }
}
