mod admission;
mod cancel;
mod clock;
mod config;
mod gate;
mod http;
mod idempotency;
mod jobs;
mod llm;
mod metrics;
mod models;
mod orchestrator;
mod security;
mod sink;
mod stages;
mod store;
mod tenants;
#[cfg(test)]
mod testing;

use admission::AdmissionController;
use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clock::{Clock, SystemClock};
use eyre::WrapErr;
use idempotency::IdempotencyCache;
use jobs::{JobQueue, QueueClosed};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, CreateJobRequest, Job, JobAccepted};
use orchestrator::{JobOrchestrator, OrchestratorError};
use security::{AuthContext, AuthState, require_api_auth};
use serde::Deserialize;
use serde_json::json;
use sink::{HttpStorefrontSink, InMemorySink, PublishSink};
use stages::ExecutorRegistry;
use std::{net::SocketAddr, sync::Arc};
use store::{InMemoryJobStore, JobStore, RedisJobStore};
use tenants::TenantRegistry;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "catalog.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let tenants = TenantRegistry::from_env().wrap_err("loading tenant profiles")?;
    info!(target = "catalog.api", tenants = tenants.len(), "tenant registry loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let admission = Arc::new(AdmissionController::new(
        config::admission_from_env(),
        clock.clone(),
    ));

    let redis = std::env::var("REDIS_URL")
        .ok()
        .map(redis::Client::open)
        .transpose()
        .wrap_err("invalid REDIS_URL")?;
    let (store, idempotency): (Arc<dyn JobStore>, IdempotencyCache) = match redis {
        Some(client) => {
            info!(target = "catalog.api", "using redis job store");
            (
                Arc::new(RedisJobStore::new(client.clone())),
                IdempotencyCache::redis(client, IdempotencyCache::ttl_from_env()),
            )
        }
        None => {
            warn!(target = "catalog.api", "REDIS_URL not set; jobs live in memory only");
            (
                Arc::new(InMemoryJobStore::new()),
                IdempotencyCache::memory(IdempotencyCache::ttl_from_env()),
            )
        }
    };

    let llm = llm::LlmClient::new(llm::LlmConfig::from_env());
    if !llm.is_configured() {
        warn!(target = "catalog.llm", "LLM gateway not configured; enrichment uses templates");
    }
    let sink: Arc<dyn PublishSink> = if config::parse_env_bool("STOREFRONT_ENABLE_NETWORK") {
        Arc::new(HttpStorefrontSink::new())
    } else {
        info!(target = "catalog.sink", "storefront network disabled; publishing in memory");
        Arc::new(InMemorySink::new())
    };

    let orchestrator = JobOrchestrator::new(
        store,
        ExecutorRegistry::standard(Arc::new(llm), sink),
        tenants.clone(),
    )
    .with_clock(clock)
    .with_admission(admission.clone())
    .with_config(config::PipelineConfig::from_env());
    let (queue, _worker) = JobQueue::spawn(orchestrator.clone());

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("installing prometheus recorder")?;

    let state = AppState {
        orchestrator,
        queue,
        idempotency,
        openapi: Arc::new(load_openapi()),
        prometheus_handle,
    };
    let app = build_router(state, AuthState::new(tenants, admission))
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = config::parse_env("PORT").unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "catalog.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    orchestrator: JobOrchestrator,
    queue: JobQueue,
    idempotency: IdempotencyCache,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/retry", post(retry_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/confirm", post(confirm_job))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .merge(protected)
        .with_state(state)
        .layer(cors)
}

fn load_openapi() -> serde_json::Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "catalog-pipeline-rs",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized);
        }
    }
    Ok(Json((*state.openapi).clone()))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn body_limit_from_env() -> usize {
    config::parse_env::<usize>("REQUEST_MAX_BYTES")
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::InvalidInput(format!("`{raw}` is not a job id")))
}

/// Loads a job and checks it belongs to the caller's tenant.
async fn owned_job(state: &AppState, context: &AuthContext, raw_id: &str) -> Result<Job, AppError> {
    let job_id = parse_job_id(raw_id)?;
    let job = state.orchestrator.status(job_id).await?;
    if job.tenant != context.tenant {
        warn!(
            target = "catalog.api",
            tenant = %context.tenant,
            job_id = %job_id,
            "cross_tenant_access_denied"
        );
        return Err(AppError::Forbidden);
    }
    Ok(job)
}

/// Create an ingestion job and hand it to the background worker.
///
/// - Method: `POST`
/// - Path: `/jobs`
/// - Auth: `Authorization: Bearer <key>` or `X-Api-Key: <key>`
/// - Body: `CreateJobRequest`; `tenant` defaults to the caller's tenant
/// - Headers: optional `Idempotency-Key`
/// - Response: `202` with `JobAccepted`
async fn create_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    crate::metrics::inc_requests("/jobs");
    let tenant = payload.tenant.unwrap_or_else(|| context.tenant.clone());
    if tenant != context.tenant {
        return Err(AppError::Forbidden);
    }

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(key) = &idempotency_key
        && let Some(existing) = state.idempotency.get(&tenant, key).await
        && let Ok(job) = state.orchestrator.status(existing).await
    {
        info!(
            target = "catalog.api",
            tenant = %tenant,
            job_id = %job.job_id,
            "idempotent_replay"
        );
        return Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))));
    }

    let job = state.orchestrator.create(&tenant, &payload.source_ref).await?;
    // A concurrent request with the same key may have claimed it first.
    if let Some(key) = &idempotency_key
        && let Some(holder) = state.idempotency.claim(&tenant, key, job.job_id).await
        && let Ok(existing) = state.orchestrator.status(holder).await
    {
        if let Err(err) = state.orchestrator.cancel(job.job_id).await {
            warn!(target = "catalog.api", job_id = %job.job_id, error = %err, "duplicate_cancel_failed");
        }
        info!(
            target = "catalog.api",
            tenant = %tenant,
            job_id = %existing.job_id,
            duplicate = %job.job_id,
            "idempotent_replay"
        );
        return Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&existing))));
    }
    state.queue.submit(job.job_id).await?;
    info!(
        target = "catalog.api",
        tenant = %tenant,
        api_key = %context.api_key_id,
        job_id = %job.job_id,
        "job_accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

async fn get_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}");
    Ok(Json(owned_job(&state, &context, &id).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    tenant: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Job>>, AppError> {
    crate::metrics::inc_requests("/jobs");
    let tenant = query.tenant.unwrap_or_else(|| context.tenant.clone());
    if tenant != context.tenant {
        return Err(AppError::Forbidden);
    }
    Ok(Json(state.orchestrator.list_jobs(&tenant).await?))
}

/// Requeue a FAILED job at the stage where it stopped. `409` otherwise.
async fn retry_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    crate::metrics::inc_requests("/jobs/{id}/retry");
    let job = owned_job(&state, &context, &id).await?;
    let job = state.orchestrator.mark_for_retry(job.job_id).await?;
    state.queue.submit(job.job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

async fn cancel_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Job>, AppError> {
    crate::metrics::inc_requests("/jobs/{id}/cancel");
    let job = owned_job(&state, &context, &id).await?;
    Ok(Json(state.orchestrator.cancel(job.job_id).await?))
}

async fn confirm_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    crate::metrics::inc_requests("/jobs/{id}/confirm");
    let job = owned_job(&state, &context, &id).await?;
    let job = state.orchestrator.mark_confirmed(job.job_id).await?;
    state.queue.submit(job.job_id).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

#[derive(Debug)]
enum AppError {
    Orchestrator(OrchestratorError),
    InvalidInput(String),
    Forbidden,
    Unauthorized,
    QueueUnavailable,
}

impl From<OrchestratorError> for AppError {
    fn from(value: OrchestratorError) -> Self {
        Self::Orchestrator(value)
    }
}

impl From<QueueClosed> for AppError {
    fn from(_: QueueClosed) -> Self {
        Self::QueueUnavailable
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Orchestrator(err) => {
                let (status, code) = match &err {
                    OrchestratorError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                    OrchestratorError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                    OrchestratorError::NotRetryable { .. } => (StatusCode::CONFLICT, "not_retryable"),
                    OrchestratorError::NotCancellable { .. } => {
                        (StatusCode::CONFLICT, "not_cancellable")
                    }
                    OrchestratorError::NotAwaitingConfirmation(_) => {
                        (StatusCode::CONFLICT, "not_awaiting_confirmation")
                    }
                    OrchestratorError::NotRunnable { .. } => (StatusCode::CONFLICT, "not_runnable"),
                    OrchestratorError::AlreadyRunning(_) => (StatusCode::CONFLICT, "already_running"),
                    OrchestratorError::Store(_) => {
                        error!(target = "catalog.api", error = %err, "job store failure");
                        (StatusCode::INTERNAL_SERVER_ERROR, "store_error")
                    }
                };
                (status, code, Some(err.to_string()))
            }
            AppError::InvalidInput(detail) => (StatusCode::BAD_REQUEST, "invalid_input", Some(detail)),
            AppError::Forbidden => (
                StatusCode::FORBIDDEN,
                "forbidden",
                Some("job belongs to another tenant".to_string()),
            ),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            AppError::QueueUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_unavailable",
                Some("worker not available".to_string()),
            ),
        };
        let payload = ApiError {
            error: code.to_string(),
            detail,
        };
        (status, Json(payload)).into_response()
    }
}
