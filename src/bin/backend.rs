#![forbid(unsafe_code)]

//! Axum front end for the yt-dlp helpers in the `youtube_tools` library.
//!
//! Every response, including errors and unknown routes, uses the same
//! `{code, message?, data?}` envelope. Downloads are accepted immediately and
//! run in the background; clients poll `/download/status` for the outcome.

use std::{
    any::Any,
    fmt::Display,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer};
use tracing::{error, info, warn};
use youtube_tools::config::{ConfigOverrides, resolve_config};
use youtube_tools::error::{MetadataError, ReferenceError, TaskError};
use youtube_tools::executor::DownloadExecutor;
use youtube_tools::logging::init_tracing;
use youtube_tools::metadata::{MetadataFetcher, OfferedFormats, VideoInfo};
use youtube_tools::reference::normalize;
use youtube_tools::storage::Storage;
use youtube_tools::tasks::{DownloadTask, TaskRegistry, is_valid_task_id};
use youtube_tools::ytdlp::YtDlp;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Parser)]
#[command(name = "backend", version, about = "HTTP API around yt-dlp")]
struct BackendArgs {
    /// TOML configuration file (default: config.toml or $CONFIG_PATH).
    #[arg(long)]
    config: Option<PathBuf>,
    /// dotenv style file with environment overrides.
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Storage mount holding the metadata cache and finished downloads.
    #[arg(long)]
    mount: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> ConfigOverrides {
        ConfigOverrides {
            config_path: self.config,
            env_path: self.env_file,
            host: self.host,
            port: self.port,
            mount: self.mount,
        }
    }
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    fetcher: Arc<MetadataFetcher>,
    registry: TaskRegistry,
    started: Instant,
    requests: Arc<AtomicU64>,
}

impl AppState {
    fn new(fetcher: Arc<MetadataFetcher>, registry: TaskRegistry) -> Self {
        Self {
            fetcher,
            registry,
            started: Instant::now(),
            requests: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseCode {
    Success,
    InvalidRequest,
    InvalidTaskId,
    TaskNotFound,
    VideoInfoError,
    ServerError,
}

impl ResponseCode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidTaskId => "INVALID_TASK_ID",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::VideoInfoError => "VIDEO_INFO_ERROR",
            Self::ServerError => "SERVER_ERROR",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Self::Success => "Operation successful",
            Self::InvalidRequest => "Invalid request parameters",
            Self::InvalidTaskId => "Invalid task ID",
            Self::TaskNotFound => "Task not found",
            Self::VideoInfoError => "Failed to get video information",
            Self::ServerError => "Internal server error",
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<T> {
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn success<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        code: ResponseCode::Success.as_str(),
        message: None,
        data: Some(data),
    })
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: ResponseCode,
    message: String,
}

impl ApiError {
    /// Standard message for `code` followed by the underlying cause.
    fn new(status: StatusCode, code: ResponseCode, cause: impl Display) -> Self {
        Self {
            status,
            code,
            message: format!("{}: {cause}", code.message()),
        }
    }

    fn with_message(status: StatusCode, code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(cause: impl Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ResponseCode::InvalidRequest, cause)
    }
}

impl From<ReferenceError> for ApiError {
    fn from(err: ReferenceError) -> Self {
        Self::bad_request(err)
    }
}

impl From<MetadataError> for ApiError {
    fn from(err: MetadataError) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ResponseCode::VideoInfoError,
            err,
        )
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::NotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, ResponseCode::TaskNotFound, err)
            }
            TaskError::Token(_) => Self::bad_request(err),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Envelope::<()> {
            code: self.code.as_str(),
            message: Some(self.message),
            data: None,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    let config = resolve_config(args.into_overrides()).context("loading configuration")?;
    init_tracing(&config.log);

    let storage = Storage::new(&config.storage);
    let offered = OfferedFormats::from_config(&config.ytdlp);
    let executor = Arc::new(DownloadExecutor::new(&config.ytdlp, storage.clone()));
    let registry = TaskRegistry::new(executor, offered.clone(), config.tasks.retention());
    let fetcher = Arc::new(MetadataFetcher::new(
        YtDlp::new(&config.ytdlp),
        storage,
        offered,
    ));
    let eviction = registry.start_eviction(config.tasks.eviction_interval());

    let app = router(AppState::new(fetcher, registry.clone()));
    let listener =
        tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
            .await
            .with_context(|| {
                format!("binding to {}:{}", config.server.host, config.server.port)
            })?;
    info!(
        addr = %listener.local_addr().context("reading listener address")?,
        mount = %config.storage.mount.display(),
        ytdlp = %config.ytdlp.path.display(),
        "API server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    eviction.stop().await;
    let cancelled = registry.cancel_all();
    info!(cancelled, "API server stopped");
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(video_info))
        .route("/download", post(start_download).delete(cancel_download))
        .route("/download/status", get(download_status))
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Tags each request with an id and logs it once the response is ready.
async fn log_requests(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let request_id = format!("{:08x}", state.requests.fetch_add(1, Ordering::Relaxed) + 1);
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = started.elapsed().as_millis() as u64;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    if response.status().is_server_error() {
        error!(%request_id, %method, %path, status, latency_ms, "request failed");
    } else if response.status().is_client_error() {
        warn!(%request_id, %method, %path, status, latency_ms, "request rejected");
    } else {
        info!(%request_id, %method, %path, status, latency_ms, "request served");
    }
    response
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "handler panicked");
    ApiError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        ResponseCode::ServerError,
        "unexpected failure",
    )
    .into_response()
}

async fn not_found() -> ApiError {
    ApiError::new(
        StatusCode::NOT_FOUND,
        ResponseCode::InvalidRequest,
        "endpoint not found",
    )
}

#[derive(Debug, Serialize)]
struct HealthPayload {
    version: &'static str,
    uptime: String,
    uptime_seconds: u64,
}

async fn health(State(state): State<AppState>) -> Json<Envelope<HealthPayload>> {
    let uptime = state.started.elapsed();
    success(HealthPayload {
        version: env!("CARGO_PKG_VERSION"),
        uptime: format_uptime(uptime),
        uptime_seconds: uptime.as_secs(),
    })
}

fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m{seconds}s"),
        _ => format!("{hours}h{minutes}m{seconds}s"),
    }
}

#[derive(Debug, Deserialize)]
struct InfoQuery {
    #[serde(default)]
    url: String,
}

async fn video_info(
    State(state): State<AppState>,
    query: Result<Query<InfoQuery>, QueryRejection>,
) -> ApiResult<Json<Envelope<VideoInfo>>> {
    let Query(query) = query?;
    if query.url.trim().is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    let reference = normalize(&query.url)?;
    let info = state.fetcher.fetch(&reference).await?;
    Ok(success(Arc::unwrap_or_clone(info)))
}

#[derive(Debug, Deserialize)]
struct StartDownloadRequest {
    url: String,
    #[serde(default)]
    format_id: String,
}

#[derive(Debug, Serialize)]
struct StartDownloadResponse {
    task_id: String,
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<StartDownloadRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<StartDownloadResponse>>> {
    let Json(request) = payload?;
    let reference = normalize(&request.url)?;
    if request.format_id.trim().is_empty() {
        return Err(ApiError::bad_request("format_id is required"));
    }
    let task_id = state
        .registry
        .get_or_create(&reference, request.format_id.trim())?;
    Ok(success(StartDownloadResponse { task_id }))
}

#[derive(Debug, Deserialize)]
struct TaskQuery {
    #[serde(default)]
    task_id: String,
}

fn validated_task_id(query: Result<Query<TaskQuery>, QueryRejection>) -> ApiResult<String> {
    let Query(TaskQuery { task_id }) = query?;
    let task_id = task_id.trim();
    if task_id.is_empty() {
        return Err(ApiError::with_message(
            StatusCode::BAD_REQUEST,
            ResponseCode::InvalidTaskId,
            "Task ID is required",
        ));
    }
    if !is_valid_task_id(task_id) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            ResponseCode::InvalidTaskId,
            format!("malformed task ID `{task_id}`"),
        ));
    }
    Ok(task_id.to_string())
}

async fn download_status(
    State(state): State<AppState>,
    query: Result<Query<TaskQuery>, QueryRejection>,
) -> ApiResult<Json<Envelope<DownloadTask>>> {
    let task_id = validated_task_id(query)?;
    Ok(success(state.registry.status(&task_id)?))
}

async fn cancel_download(
    State(state): State<AppState>,
    query: Result<Query<TaskQuery>, QueryRejection>,
) -> ApiResult<Json<Envelope<DownloadTask>>> {
    let task_id = validated_task_id(query)?;
    Ok(success(state.registry.cancel(&task_id)?))
}
