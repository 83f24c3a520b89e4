//! rx HTTP API — scan, analyse, index, and compress endpoints over a
//! submit-and-poll task store.
//!
//! Heavy operations dispatch to worker threads and return a `request_id`
//! immediately; fast endpoints (`/health`, `/v1/detectors`,
//! `/v1/complexity`) answer inline and stay responsive regardless of scan
//! load. Every user-supplied path goes through the sandbox before any
//! filesystem access.

pub mod tasks;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use rx_core::analyze::{category_catalog, detector_catalog};
use rx_core::complexity::analyze_pattern;
use rx_core::engine::engine_available;
use rx_core::index::{ensure_index, line_info_for_offsets, BuildOptions};
use rx_core::sandbox::Sandbox;
use rx_core::search::{SearchDriver, SearchRequest};
use rx_core::seekable::{create_seekable, SeekableOptions};
use rx_core::types::CancelToken;
use rx_core::{Config, RxError};

use tasks::{PathLocks, RequestStore};

/// Shared application state.
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub sandbox: Arc<Sandbox>,
    pub driver: Arc<SearchDriver>,
    pub store: RequestStore,
    pub locks: PathLocks,
    pub started: std::time::Instant,
}

impl AppContext {
    pub fn new(config: Config) -> Result<AppContext, RxError> {
        let sandbox = Arc::new(Sandbox::from_config(&config)?);
        let driver = Arc::new(SearchDriver::new(config.clone()));
        Ok(AppContext {
            config,
            sandbox,
            driver,
            store: RequestStore::new(),
            locks: PathLocks::new(),
            started: std::time::Instant::now(),
        })
    }
}

/// Build the full route table.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/trace", post(submit_trace))
        .route("/v1/analyse", post(submit_analyse))
        .route("/v1/index", post(submit_index))
        .route("/v1/compress", post(submit_compress))
        .route("/v1/samples", post(samples))
        .route("/v1/requests/{id}", get(poll_request))
        .route("/v1/detectors", get(detectors))
        .route("/v1/complexity", get(complexity))
        .with_state(ctx)
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}

fn map_core_error(e: &RxError) -> ApiError {
    let status = match e {
        RxError::PathOutsideSandbox { .. } => StatusCode::FORBIDDEN,
        RxError::RegexInvalid(_) => StatusCode::BAD_REQUEST,
        RxError::NotAProcessableFile { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": e.to_string() })))
}

// ---------------------------------------------------------------------------
// Fast endpoints
// ---------------------------------------------------------------------------

async fn health(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "engine_available": engine_available(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": ctx.started.elapsed().as_secs(),
        "constants": {
            "large_file_threshold": ctx.config.large_file_threshold,
            "index_step_bytes": ctx.config.index_step_bytes(),
            "max_subprocesses": ctx.config.max_subprocesses,
            "sample_size_lines": ctx.config.sample_size_lines,
        },
        "cache_dir": ctx.config.cache_dir,
        "search_roots": ctx.sandbox.roots(),
        "no_cache": ctx.config.no_cache,
        "no_index": ctx.config.no_index,
    }))
}

async fn detectors() -> Json<serde_json::Value> {
    let categories: Vec<serde_json::Value> = category_catalog()
        .into_iter()
        .map(|(category, description, members)| {
            json!({
                "name": category.as_str(),
                "description": description,
                "detectors": members,
            })
        })
        .collect();
    Json(json!({ "detectors": detector_catalog(), "categories": categories }))
}

#[derive(Deserialize)]
struct ComplexityQuery {
    pattern: String,
}

async fn complexity(Query(query): Query<ComplexityQuery>) -> Json<serde_json::Value> {
    let report = analyze_pattern(&query.pattern);
    Json(json!({ "regex": query.pattern, "report": report }))
}

async fn poll_request(
    State(ctx): State<AppContext>,
    UrlPath(id): UrlPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match ctx.store.get(&id) {
        Some(entry) => Ok(Json(serde_json::to_value(entry).unwrap_or_default())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown request id {id}") })),
        )),
    }
}

// ---------------------------------------------------------------------------
// Submit-and-poll endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TraceBody {
    #[serde(alias = "path")]
    paths: Vec<PathBuf>,
    #[serde(alias = "regexp")]
    patterns: Vec<String>,
    #[serde(default)]
    flags: Vec<String>,
    max_results: Option<usize>,
    #[serde(default)]
    before_context: usize,
    #[serde(default)]
    after_context: usize,
    #[serde(default)]
    recursive: bool,
}

async fn submit_trace(
    State(ctx): State<AppContext>,
    Json(body): Json<TraceBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.patterns.is_empty() {
        return Err(bad_request("at least one pattern is required".into()));
    }
    let resolved = ctx.sandbox.validate_all(&body.paths).map_err(|e| map_core_error(&e))?;
    let request = SearchRequest {
        paths: resolved,
        patterns: body.patterns,
        flags: body.flags,
        max_results: body.max_results,
        before_context: body.before_context,
        after_context: body.after_context,
        use_index: !ctx.config.no_index,
        use_cache: !ctx.config.no_cache,
        recursive: body.recursive,
    };

    let request_id = ctx.store.create("trace");
    let store = ctx.store.clone();
    let driver = ctx.driver.clone();
    let id = request_id.clone();
    std::thread::spawn(move || {
        store.mark_running(&id);
        match driver.run(&request, &CancelToken::new()) {
            Ok(outcome) => {
                store.finish(&id, serde_json::to_value(&outcome).unwrap_or_default())
            }
            Err(e) => {
                error!("trace request {id} failed: {e}");
                store.fail(&id, e.to_string());
            }
        }
    });
    Ok(Json(json!({ "request_id": request_id, "status": "queued" })))
}

#[derive(Deserialize)]
struct AnalyseBody {
    #[serde(alias = "path")]
    paths: Vec<PathBuf>,
    #[serde(default)]
    anomalies: bool,
    #[serde(default)]
    recursive: bool,
}

async fn submit_analyse(
    State(ctx): State<AppContext>,
    Json(body): Json<AnalyseBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resolved = ctx.sandbox.validate_all(&body.paths).map_err(|e| map_core_error(&e))?;
    let request_id = ctx.store.create("analyse");
    let store = ctx.store.clone();
    let config = ctx.config.clone();
    let id = request_id.clone();
    std::thread::spawn(move || {
        store.mark_running(&id);
        let files = match rx_core::search::expand_paths(&resolved, body.recursive) {
            Ok(files) => files,
            Err(e) => {
                store.fail(&id, e.to_string());
                return;
            }
        };
        let options = BuildOptions { analyze: true, detect_anomalies: body.anomalies };
        let mut reports = Vec::new();
        let mut skipped = Vec::new();
        for (file, result) in rx_core::index::ensure_indexes(&files, &config, options) {
            match result {
                Ok(index) => reports.push(index),
                Err(e) if e.is_file_local() => {
                    skipped.push(json!({ "path": file, "reason": e.to_string() }))
                }
                Err(e) => {
                    store.fail(&id, e.to_string());
                    return;
                }
            }
        }
        store.finish(&id, json!({ "results": reports, "skipped_files": skipped }));
    });
    Ok(Json(json!({ "request_id": request_id, "status": "queued" })))
}

#[derive(Deserialize)]
struct IndexBody {
    path: PathBuf,
    #[serde(default)]
    analyze: bool,
}

async fn submit_index(
    State(ctx): State<AppContext>,
    Json(body): Json<IndexBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resolved =
        ctx.sandbox.validate(&body.path).map_err(|e| map_core_error(&e))?;
    let request_id = ctx.store.create("index");
    let store = ctx.store.clone();
    let config = ctx.config.clone();
    let locks = ctx.locks.clone();
    let id = request_id.clone();
    std::thread::spawn(move || {
        store.mark_running(&id);
        let lock = locks.lock_for(&resolved);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let options = BuildOptions { analyze: body.analyze, detect_anomalies: body.analyze };
        match ensure_index(&resolved, &config, options) {
            Ok(index) => {
                store.finish(&id, serde_json::to_value(&index).unwrap_or_default())
            }
            Err(e) => store.fail(&id, e.to_string()),
        }
    });
    Ok(Json(json!({ "request_id": request_id, "status": "queued" })))
}

#[derive(Deserialize)]
struct CompressBody {
    path: PathBuf,
    output: Option<PathBuf>,
    #[serde(default)]
    frame_size_mb: Option<u64>,
    #[serde(default)]
    level: Option<i32>,
}

async fn submit_compress(
    State(ctx): State<AppContext>,
    Json(body): Json<CompressBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resolved =
        ctx.sandbox.validate(&body.path).map_err(|e| map_core_error(&e))?;
    let target = match &body.output {
        // The output lands inside the sandbox too; it may not exist yet.
        Some(output) => ctx.sandbox.validate(output).map_err(|e| map_core_error(&e))?,
        None => {
            let mut name = resolved.as_os_str().to_os_string();
            name.push(".zst");
            PathBuf::from(name)
        }
    };
    let options = SeekableOptions {
        frame_size_bytes: body.frame_size_mb.unwrap_or(4).max(1) * 1024 * 1024,
        compression_level: body.level.unwrap_or(3),
    };

    let request_id = ctx.store.create("compress");
    let store = ctx.store.clone();
    let locks = ctx.locks.clone();
    let id = request_id.clone();
    std::thread::spawn(move || {
        store.mark_running(&id);
        let lock = locks.lock_for(&resolved);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        match create_seekable(&resolved, &target, options) {
            Ok(info) => {
                info!("compressed {} into {} frames", info.path.display(), info.frame_count());
                store.finish(
                    &id,
                    json!({
                        "path": info.path,
                        "frame_count": info.frame_count(),
                        "compressed_size": info.compressed_size,
                        "decompressed_size": info.decompressed_size,
                    }),
                );
            }
            Err(e) => store.fail(&id, e.to_string()),
        }
    });
    Ok(Json(json!({ "request_id": request_id, "status": "queued" })))
}

// ---------------------------------------------------------------------------
// Samples (synchronous: one batched index query + a few seeks)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SamplesBody {
    path: PathBuf,
    offsets: Vec<u64>,
    #[serde(default)]
    context: u64,
}

async fn samples(
    State(ctx): State<AppContext>,
    Json(body): Json<SamplesBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resolved =
        ctx.sandbox.validate(&body.path).map_err(|e| map_core_error(&e))?;
    let config = ctx.config.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<serde_json::Value, RxError> {
        let index = ensure_index(&resolved, &config, BuildOptions::default())?;
        let infos = line_info_for_offsets(&resolved, &index, &body.offsets)?;
        let mut samples = serde_json::Map::new();
        for offset in &body.offsets {
            let Some(info) = infos.get(offset) else { continue };
            let first = info.line_number.saturating_sub(body.context).max(1);
            let last = info.line_number + body.context;
            let mut lines = Vec::new();
            for line_no in first..=last {
                match read_line_text(&resolved, &index, line_no)? {
                    Some(text) => lines.push(text),
                    None => break,
                }
            }
            samples.insert(offset.to_string(), json!(lines));
        }
        Ok(json!({
            "path": resolved,
            "offsets": body.offsets,
            "context": body.context,
            "samples": samples,
        }))
    })
    .await
    .map_err(|e| bad_request(format!("samples task failed: {e}")))?;

    result.map(Json).map_err(|e| map_core_error(&e))
}

fn read_line_text(
    path: &std::path::Path,
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
