use crate::{
    auth::{extract_bearer_token, CallerVerifier},
    batch::CancelToken,
    eid::OwnerId,
    errors::ServiceError,
    service::{
        BatchItemResult, DeleteSourceResponse, DuplicatesRequest, EmbeddingService,
        GenerateRequest, GenerateResponse, SearchRequest, SearchResponse,
    },
    sources::{NewSource, SourceItem},
    store::{ClusterAssignment, DuplicateCandidate, OwnerStats},
};
use anyhow::Context;
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequest, FromRequestParts, Path, State},
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

/// Largest accepted `items` list for batch generation
const MAX_BATCH_ITEMS: usize = 100;

#[derive(Clone)]
pub struct SharedState {
    service: Arc<EmbeddingService>,
    verifier: Arc<dyn CallerVerifier>,
    /// Cancelled on shutdown so running batches stop between chunks
    shutdown: CancelToken,
}

impl SharedState {
    pub fn new(service: Arc<EmbeddingService>, verifier: Arc<dyn CallerVerifier>) -> Self {
        Self {
            service,
            verifier,
            shutdown: CancelToken::new(),
        }
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/embeddings", post(generate))
        .route("/api/embeddings/batch", post(generate_batch))
        .route("/api/embeddings/:source_ref_id", delete(delete_embeddings))
        .route("/api/search", post(search))
        .route("/api/duplicates", post(duplicates))
        .route("/api/stats", get(stats))
        .route("/api/cluster", post(cluster))
        .route("/api/sources", post(register_source).get(list_sources))
        .route("/api/sources/:id", delete(delete_source))
        .layer(DefaultBodyLimit::max(10 * 1024 * 1024))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(Arc::new(state))
}

async fn shutdown_signal(shutdown: CancelToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("failed to install signal handler: {e}");
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

    log::warn!("shutting down, cancelling running batches");
    shutdown.cancel();
}

async fn start_app(state: SharedState, bind: &str) -> anyhow::Result<()> {
    let signal = shutdown_signal(state.shutdown.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    log::info!("listening on {bind}");
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await
        .context("server error")?;

    Ok(())
}

pub fn start_daemon(state: SharedState, bind: &str) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(async { start_app(state, bind).await })
}

#[derive(Debug)]
pub struct HttpError(ServiceError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::DimensionMismatch { .. }
            | ServiceError::EmbeddingGenerationFailed(_)
            | ServiceError::Storage(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<ServiceError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        ServiceError::Validation(rejection.body_text())
    }
}

/// JSON body whose rejections use the API error shape.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(HttpError))]
struct ApiJson<T>(T);

/// Owner resolved from the bearer credential.
struct Caller(OwnerId);

#[async_trait]
impl FromRequestParts<Arc<SharedState>> for Caller {
    type Rejection = HttpError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<SharedState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(extract_bearer_token)
            .ok_or(HttpError(ServiceError::Auth))?;

        state
            .verifier
            .verify(token)
            .map(Caller)
            .ok_or(HttpError(ServiceError::Auth))
    }
}

async fn generate(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
    ApiJson(payload): ApiJson<GenerateRequest>,
) -> Result<Json<GenerateResponse>, HttpError> {
    log::debug!("generate: {} ({} chars)", payload.source_ref_id, payload.content.len());

    tokio::task::block_in_place(move || Ok(Json(state.service.generate(&owner, &payload)?)))
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    items: Vec<GenerateRequest>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    results: Vec<BatchItemResult>,
}

async fn generate_batch(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
    ApiJson(payload): ApiJson<BatchRequest>,
) -> Result<Json<BatchResponse>, HttpError> {
    if payload.items.is_empty() {
        return Err(ServiceError::Validation("items must not be empty".to_string()).into());
    }
    if payload.items.len() > MAX_BATCH_ITEMS {
        return Err(ServiceError::Validation(format!(
            "at most {MAX_BATCH_ITEMS} items per batch, got {}",
            payload.items.len()
        ))
        .into());
    }

    tokio::task::block_in_place(move || {
        let results = state
            .service
            .generate_batch(&owner, &payload.items, &state.shutdown);
        Ok(Json(BatchResponse { results }))
    })
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
    ApiJson(payload): ApiJson<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || Ok(Json(state.service.search(&owner, &payload)?)))
}

async fn duplicates(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
    ApiJson(payload): ApiJson<DuplicatesRequest>,
) -> Result<Json<Vec<DuplicateCandidate>>, HttpError> {
    tokio::task::block_in_place(move || Ok(Json(state.service.duplicates(&owner, &payload)?)))
}

async fn stats(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
) -> Result<Json<OwnerStats>, HttpError> {
    tokio::task::block_in_place(move || Ok(Json(state.service.stats(&owner)?)))
}

#[derive(Debug, Deserialize)]
struct ClusterRequest {
    k: usize,
}

async fn cluster(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
    ApiJson(payload): ApiJson<ClusterRequest>,
) -> Result<Json<Vec<ClusterAssignment>>, HttpError> {
    tokio::task::block_in_place(move || Ok(Json(state.service.cluster(&owner, payload.k)?)))
}

async fn register_source(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
    ApiJson(payload): ApiJson<NewSource>,
) -> Result<(StatusCode, Json<SourceItem>), HttpError> {
    tokio::task::block_in_place(move || {
        let item = state.service.register_source(&owner, payload)?;
        Ok((StatusCode::CREATED, Json(item)))
    })
}

async fn list_sources(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
) -> Result<Json<Vec<SourceItem>>, HttpError> {
    tokio::task::block_in_place(move || Ok(Json(state.service.sources().list(&owner)?)))
}

async fn delete_source(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
    Path(id): Path<String>,
) -> Result<Json<DeleteSourceResponse>, HttpError> {
    tokio::task::block_in_place(move || Ok(Json(state.service.delete_source(&owner, &id)?)))
}

async fn delete_embeddings(
    State(state): State<Arc<SharedState>>,
    Caller(owner): Caller,
    Path(source_ref_id): Path<String>,
) -> Result<Json<DeleteSourceResponse>, HttpError> {
    tokio::task::block_in_place(move || {
        let embeddings_removed = state.service.delete_embeddings(&owner, &source_ref_id)?;
        Ok(Json(DeleteSourceResponse {
            source_ref_id,
            embeddings_removed,
        }))
    })
}
