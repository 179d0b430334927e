use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{header::WWW_AUTHENTICATE, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::auth::{extract_bearer, AuthBoundary, WorkerCredentials};
use crate::client::{Transcriber, WorkerHealth};
use crate::db::{DeleteScope, QueueStore, TranscriptStore};
use crate::error::{QueueError, StoreError};
use crate::processor::{BatchSummary, JobProcessor};
use crate::queue::{self, EnqueueSummary};
use crate::retry::RetryPolicy;
use crate::scheduler::{ClaimFilter, Scheduler};
use crate::{OwnerId, QueueItem, Status, StatusCounts, Transcript};

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthBoundary>,
    pub queue: Arc<dyn QueueStore>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub transcriber: Arc<dyn Transcriber>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new<S>(
        store: Arc<S>,
        transcriber: Arc<dyn Transcriber>,
        auth: AuthBoundary,
        policy: RetryPolicy,
        batch_ceiling: i64,
    ) -> Self
    where
        S: QueueStore + TranscriptStore + 'static,
    {
        let queue: Arc<dyn QueueStore> = store.clone();
        let transcripts: Arc<dyn TranscriptStore> = store;
        let processor = JobProcessor::new(queue.clone(), transcripts.clone(), transcriber.clone(), policy);

        AppState {
            auth: Arc::new(auth),
            scheduler: Arc::new(Scheduler::new(queue.clone(), processor, batch_ceiling)),
            queue,
            transcripts,
            transcriber,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let user_routes = Router::new()
        .route("/api/queue", post(enqueue).get(list).delete(delete))
        .route("/api/queue/retry/:id", post(requeue))
        .route("/api/queue/process/mine", post(process_mine))
        .route("/api/transcripts/:media_id", get(transcript))
        .route_layer(middleware::from_fn_with_state(state.clone(), session_middleware));

    let worker_routes = Router::new()
        .route("/api/queue/process", post(process))
        .route("/api/queue/health", get(health));

    user_routes
        .merge(worker_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn session_middleware(State(state): State<AppState>, mut req: Request, next: Next) -> Result<Response, QueueError> {
    let owner = state.auth.authorize_session(req.headers())?;
    req.extensions_mut().insert(owner);
    Ok(next.run(req).await)
}

impl QueueError {
    fn status_code(&self) -> StatusCode {
        match self {
            QueueError::Validation(_) => StatusCode::BAD_REQUEST,
            QueueError::Auth(_) => StatusCode::UNAUTHORIZED,
            QueueError::NotFound(_) | QueueError::NoTranscript(_) => StatusCode::NOT_FOUND,
            QueueError::InvalidTransition { .. } | QueueError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            QueueError::Store(StoreError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            QueueError::Validation(_) => "validation_error",
            QueueError::Auth(_) => "unauthorized",
            QueueError::NotFound(_) | QueueError::NoTranscript(_) => "not_found",
            QueueError::InvalidTransition { .. } => "invalid_transition",
            QueueError::Store(StoreError::Conflict(_)) => "conflict",
            QueueError::Store(StoreError::Database(_)) => "store_error",
        }
    }
}

impl From<JsonRejection> for QueueError {
    fn from(rejection: JsonRejection) -> Self {
        QueueError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for QueueError {
    fn from(rejection: QueryRejection) -> Self {
        QueueError::Validation(rejection.body_text())
    }
}

impl From<PathRejection> for QueueError {
    fn from(rejection: PathRejection) -> Self {
        QueueError::Validation(rejection.body_text())
    }
}

/// `Json` whose rejections render as a `QueueError`.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(QueueError))]
struct ApiJson<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(QueueError))]
struct ApiQuery<T>(T);

#[derive(FromRequestParts)]
#[from_request(via(Path), rejection(QueueError))]
struct ApiPath<T>(T);

/// A missing body means defaults; a body that is present must parse.
fn optional_body<T: Default>(body: Result<Json<T>, JsonRejection>) -> Result<T, QueueError> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(T::default()),
        Err(rejection) => Err(rejection.into()),
    }
}

impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = ?self, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let mut response = (status, Json(json!({ "error": self.code(), "message": message }))).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueRequest {
    media_ids: Vec<String>,
    #[serde(default)]
    priority: i32,
    language: Option<String>,
}

async fn enqueue(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    ApiJson(req): ApiJson<EnqueueRequest>,
) -> Result<Json<EnqueueSummary>, QueueError> {
    let summary = queue::enqueue(
        state.queue.as_ref(),
        &owner,
        &req.media_ids,
        req.priority,
        req.language.as_deref(),
    )
    .await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<Status>,
}

async fn list(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> Result<Json<Vec<QueueItem>>, QueueError> {
    Ok(Json(queue::list(state.queue.as_ref(), &owner, params.status).await?))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteRequest {
    ids: Option<Vec<Uuid>>,
    status: Option<Status>,
    #[serde(default)]
    all: bool,
}

impl DeleteRequest {
    fn scope(self) -> Result<DeleteScope, QueueError> {
        match self {
            DeleteRequest { ids: Some(ids), .. } => Ok(DeleteScope::Ids(ids)),
            DeleteRequest { status: Some(status), .. } => Ok(DeleteScope::Status(status)),
            DeleteRequest { all: true, .. } => Ok(DeleteScope::All),
            _ => Err(QueueError::validation("specify ids, status or all")),
        }
    }
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    deleted: u64,
}

async fn delete(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    ApiJson(req): ApiJson<DeleteRequest>,
) -> Result<Json<DeleteResponse>, QueueError> {
    let deleted = queue::delete(state.queue.as_ref(), &owner, req.scope()?).await?;
    Ok(Json(DeleteResponse { deleted }))
}

async fn requeue(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<QueueItem>, QueueError> {
    Ok(Json(queue::requeue(state.queue.as_ref(), &owner, id).await?))
}

async fn transcript(
    State(state): State<AppState>,
    ApiPath(media_id): ApiPath<String>,
) -> Result<Json<Transcript>, QueueError> {
    queue::transcript(state.transcripts.as_ref(), &media_id)
        .await?
        .map(Json)
        .ok_or(QueueError::NoTranscript(media_id))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    secret: Option<String>,
    specific_item_id: Option<Uuid>,
    max_items: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SecretQuery {
    secret: Option<String>,
}

async fn process(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(query): ApiQuery<SecretQuery>,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<BatchSummary>, QueueError> {
    let body = optional_body(body);
    state.auth.authorize_worker(WorkerCredentials {
        header: extract_bearer(&headers),
        body: body.as_ref().ok().and_then(|body| body.secret.as_deref()),
        query: query.secret.as_deref(),
    })?;
    let body = body?;

    let filter = ClaimFilter {
        specific_id: body.specific_item_id,
        max_items: body.max_items,
        owner: None,
    };
    Ok(Json(state.scheduler.run_batch(filter).await?))
}

async fn process_mine(
    State(state): State<AppState>,
    Extension(owner): Extension<OwnerId>,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> Result<Json<BatchSummary>, QueueError> {
    let body = optional_body(body)?;
    let filter = ClaimFilter {
        specific_id: body.specific_item_id,
        max_items: body.max_items,
        owner: Some(owner),
    };
    Ok(Json(state.scheduler.run_batch(filter).await?))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    queue: StatusCounts,
    worker: WorkerHealth,
}

async fn health(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiQuery(query): ApiQuery<SecretQuery>,
) -> Result<Json<HealthResponse>, QueueError> {
    state.auth.authorize_worker(WorkerCredentials {
        header: extract_bearer(&headers),
        body: None,
        query: query.secret.as_deref(),
    })?;

    let queue = state.queue.counts().await.map_err(QueueError::from)?;
    let worker = state.transcriber.health().await;
    Ok(Json(HealthResponse { queue, worker }))
}
