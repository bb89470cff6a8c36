use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use finops_rag::answer::{build_request, client_from_config, to_answer, GeneratedAnswer};
use finops_rag::config::clamp_top_k;
use finops_rag::{
    load_dataset, AskResponse, CancelToken, Dataset, GuardDecision, GuardRejection, IndexStatus,
    RagConfig, RagEngine, RagError, ScoredRecord, SearchParams, SourceRecord,
};

struct AppState {
    engine: RagEngine,
    config: RagConfig,
    dataset: RwLock<Option<Arc<Dataset>>>,
}

impl AppState {
    fn dataset(&self) -> Option<Arc<Dataset>> {
        self.dataset.read().clone()
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing();
    let config_path = std::env::var("FINOPS_CONFIG").ok().map(PathBuf::from);
    let config = RagConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    let engine = RagEngine::new(&config).context("failed to initialise retrieval engine")?;
    let dataset = match load_dataset(&config.records_path, &config.context.tips) {
        Ok(dataset) => {
            info!(records = dataset.len(), path = %config.records_path.display(), "dataset loaded");
            Some(Arc::new(dataset))
        }
        Err(err) => {
            warn!(error = %err, "no dataset loaded at startup; POST /build_index to load one");
            None
        }
    };
    let state = Arc::new(AppState {
        engine,
        config,
        dataset: RwLock::new(dataset),
    });
    let app = router(state);
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/health", get(health))
        .route("/build_index", post(handle_build_index))
        .route("/ask", get(handle_ask))
        .layer(middleware::from_fn(log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = started.elapsed().as_secs_f64();
    if let Ok(value) = HeaderValue::from_str(&format!("{elapsed:.3}")) {
        response.headers_mut().insert("X-Process-Time", value);
    }
    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = (elapsed * 1000.0).round() as u64,
        "request"
    );
    response
}

async fn hello() -> Json<serde_json::Value> {
    Json(json!({ "message": "Hello from AI Analytics App!" }))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    #[serde(flatten)]
    index: IndexStatus,
    current_dataset_hash: Option<String>,
    stale: Option<bool>,
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, AppError> {
    let state = state.clone();
    let response = task::spawn_blocking(move || -> Result<HealthResponse, AppError> {
        let index = state.engine.status()?;
        let current_dataset_hash = state.dataset().map(|d| d.hash().to_string());
        let stale = match (&index.dataset_hash, &current_dataset_hash) {
            (Some(built), Some(current)) => Some(built != current),
            _ => None,
        };
        Ok(HealthResponse {
            index,
            current_dataset_hash,
            stale,
        })
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct BuildParams {
    path: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct BuildResponse {
    built: bool,
    entries: usize,
    embedded: usize,
    reused: usize,
    dataset_hash: String,
}

async fn handle_build_index(
    State(state): State<Arc<AppState>>,
    Query(params): Query<BuildParams>,
) -> Result<Json<BuildResponse>, AppError> {
    let state = state.clone();
    let response = task::spawn_blocking(move || -> Result<BuildResponse, AppError> {
        let path = params.path.unwrap_or_else(|| state.config.records_path.clone());
        let dataset = Arc::new(load_dataset(&path, &state.config.context.tips)?);
        let published = Arc::clone(&dataset);
        let report = state
            .engine
            .build_index_then(&dataset, &CancelToken::default(), || {
                *state.dataset.write() = Some(published);
            })?;
        Ok(BuildResponse {
            built: true,
            entries: report.entries,
            embedded: report.embedded,
            reused: report.reused,
            dataset_hash: report.dataset_hash,
        })
    })
    .await
    .map_err(AppError::internal)??;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct AskParams {
    question: Option<String>,
    top_k: Option<usize>,
    #[serde(default)]
    generate: bool,
}

#[derive(Debug, Serialize)]
struct RetrievedRecord {
    #[serde(flatten)]
    scored: ScoredRecord,
    record: Option<SourceRecord>,
}

#[derive(Debug, Serialize)]
struct AskResponseBody {
    question: String,
    results: Vec<RetrievedRecord>,
    context: String,
    answer: Option<GeneratedAnswer>,
}

async fn handle_ask(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AskParams>,
) -> Result<Json<AskResponseBody>, AppError> {
    let question = params.question.unwrap_or_default();
    if question.trim().is_empty() {
        return Err(AppError::bad_request("Question must be provided."));
    }
    let top_k = clamp_top_k(params.top_k.unwrap_or(state.engine.params().top_k));
    let worker = state.clone();
    let (sanitized, body) = task::spawn_blocking(move || -> Result<(String, AskResponseBody), AppError> {
        let snapshot = worker.dataset().ok_or_else(|| {
            AppError::Conflict("no dataset loaded; POST /build_index first".to_string())
        })?;
        let search = SearchParams {
            top_k,
            threshold: worker.engine.params().threshold,
        };
        let (dataset, response) = ask_current(&worker, &question, search, snapshot)?;
        let sanitized = match response.decision {
            GuardDecision::Allow(text) => text,
            GuardDecision::Reject(rejection) => return Err(rejection.into()),
        };
        let results = response
            .result
            .unwrap_or_default()
            .matches
            .into_iter()
            .map(|scored| RetrievedRecord {
                record: dataset.get(&scored.record_id).cloned(),
                scored,
            })
            .collect();
        Ok((
            sanitized,
            AskResponseBody {
                question,
                results,
                context: response.context.unwrap_or_default(),
                answer: None,
            },
        ))
    })
    .await
    .map_err(AppError::internal)??;

    let mut body = body;
    if params.generate {
        let client = client_from_config(&state.config.generation)?;
        let request = build_request(&body.context, &sanitized);
        let response = client
            .chat(&request)
            .await
            .map_err(|e| AppError::BadGateway(format!("generation failed: {e:#}")))?;
        body.answer = Some(to_answer(&client, response));
    }
    Ok(Json(body))
}

/// Runs `ask` against `snapshot`. A rebuild publishes its dataset together
/// with the index, so a snapshot taken just before the swap is retried once
/// against the newer dataset instead of reporting a stale index.
fn ask_current(
    state: &AppState,
    question: &str,
    search: SearchParams,
    snapshot: Arc<Dataset>,
) -> Result<(Arc<Dataset>, AskResponse), RagError> {
    match state.engine.ask_with(question, &snapshot, search) {
        Err(err @ RagError::StaleIndex { .. }) => match state.dataset() {
            Some(latest) if !Arc::ptr_eq(&latest, &snapshot) => {
                let response = state.engine.ask_with(question, &latest, search)?;
                Ok((latest, response))
            }
            _ => Err(err),
        },
        other => other.map(|response| (snapshot, response)),
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadGateway(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<GuardRejection> for AppError {
    fn from(value: GuardRejection) -> Self {
        Self::BadRequest(value.reason)
    }
}

impl From<RagError> for AppError {
    fn from(value: RagError) -> Self {
        match value {
            RagError::GuardRejection(rejection) => rejection.into(),
            err @ (RagError::Data(_) | RagError::Source(_)) => Self::BadRequest(err.to_string()),
            err @ (RagError::StaleIndex { .. } | RagError::IndexNotBuilt | RagError::EmptyIndex) => {
                Self::Conflict(err.to_string())
            }
            err @ (RagError::Provider(_) | RagError::Generation(_)) => Self::BadGateway(err.to_string()),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::BadGateway(msg) => {
                warn!("upstream_error" = %msg);
                (StatusCode::BAD_GATEWAY, msg)
            }
            AppError::Internal(err) => {
                error!("internal_error" = %err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "detail": message }))).into_response()
    }
}
