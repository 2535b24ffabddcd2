//! The receiver's HTTP surface.
//!
//! All endpoints live under `/api/v1` behind bearer-token authentication;
//! `/ping` is public. JSON endpoints are bounded by a body cap and a request
//! timeout; the upload endpoint is exempt from both since object payloads
//! are unbounded and slow links need as long as they need.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::api::{
    is_hex_checksum, parse_checksum_part, InfoResponse, ObjectName, ObjectsResponse, QueueRequest,
    QueueResponse,
};
use crate::queue::{Queue, QueueError};
use crate::repo::Repo;
use crate::staging::{StageError, StagingDir};
use crate::token::TokenConfig;

/// Non-upload endpoints refuse bodies beyond this.
const JSON_BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Bound on every request except uploads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors surfaced to clients, mapped onto HTTP statuses.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("queue entry not found")]
    NotFound,
    #[error("{0}")]
    Malformed(String),
    #[error("{0}")]
    Conflict(String),
    #[error("bad checksum for {0}")]
    BadChecksum(ObjectName),
    #[error("object \"{0}\" is already staged")]
    AlreadyStaged(ObjectName),
    #[error("cannot upload objects while the update is being finalized")]
    ClosedForUpload,
    #[error("already finalizing")]
    AlreadyFinalizing,
    #[error("object \"{0}\" was never staged")]
    MissingObject(ObjectName),
    #[error("unsupported form field \"{0}\"")]
    UnsupportedField(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ReceiveError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::BadChecksum(_)
            | Self::AlreadyStaged(_)
            | Self::ClosedForUpload
            | Self::UnsupportedField(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict(_)
            | Self::AlreadyFinalizing
            | Self::MissingObject(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ReceiveError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Include the whole error chain for internal failures
        let message = match &self {
            Self::Internal(e) => format!("{e:#}"),
            other => other.to_string(),
        };
        if status.is_server_error() {
            tracing::error!("Responding with {status}: {message}");
        } else {
            tracing::debug!("Responding with {status}: {message}");
        }
        (status, format!("{message}\n")).into_response()
    }
}

impl From<QueueError> for ReceiveError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::BranchBusy(_) => Self::Conflict(e.to_string()),
        }
    }
}

impl From<StageError> for ReceiveError {
    fn from(e: StageError) -> Self {
        match e {
            StageError::AlreadyStaged(name) => Self::AlreadyStaged(name),
            StageError::Missing(name) => Self::MissingObject(name),
            StageError::Other(e) => Self::Internal(e),
        }
    }
}

/// Everything the handlers share.
#[derive(Debug)]
pub struct Inner {
    pub repo: Repo,
    pub queue: Queue,
    pub staging: StagingDir,
    pub tokens: TokenConfig,
}

/// Shared handler state, cheap to clone.
#[derive(Clone, Debug)]
pub struct AppState(Arc<Inner>);

impl AppState {
    pub fn new(repo: Repo, tokens: TokenConfig) -> Result<Self> {
        let staging = StagingDir::open(repo.path())?;
        Ok(Self(Arc::new(Inner {
            repo,
            queue: Queue::new(),
            staging,
            tokens,
        })))
    }
}

impl std::ops::Deref for AppState {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let authorized = token_from_headers(req.headers())
        .map(|t| state.tokens.verify(t))
        .unwrap_or(false);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response();
    }
    next.run(req).await
}

/// Bound every request except uploads, which stream for as long as they need.
async fn request_timeout(req: Request, next: Next) -> Response {
    if req.method() == Method::PUT {
        return next.run(req).await;
    }
    match tokio::time::timeout(REQUEST_TIMEOUT, next.run(req)).await {
        Ok(resp) => resp,
        Err(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}

async fn ping() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/json")], "{}")
}

async fn info(State(state): State<AppState>) -> Result<Json<InfoResponse>, ReceiveError> {
    let repo = state.repo.clone();
    let info = tokio::task::spawn_blocking(move || -> Result<InfoResponse> {
        Ok(InfoResponse {
            mode: repo.mode_name()?.to_string(),
            revs: repo.list_revisions()?,
        })
    })
    .await
    .map_err(anyhow::Error::new)??;
    Ok(Json(info))
}

async fn create_entry(
    State(state): State<AppState>,
    Json(req): Json<QueueRequest>,
) -> Result<Json<QueueResponse>, ReceiveError> {
    for (branch, pair) in &req.refs {
        if !is_hex_checksum(&pair.client) {
            return Err(ReceiveError::Malformed(format!(
                "invalid client revision for branch \"{branch}\""
            )));
        }
        if !pair.server.is_empty() && !is_hex_checksum(&pair.server) {
            return Err(ReceiveError::Malformed(format!(
                "invalid server revision for branch \"{branch}\""
            )));
        }
        if pair.server == pair.client {
            return Err(ReceiveError::Malformed(format!(
                "branch \"{branch}\" is already at {}",
                pair.client
            )));
        }
    }
    let archive = state.repo.is_archive();
    for name in &req.objects {
        let valid = match name.suffix() {
            "filez" => archive,
            "file" => !archive,
            _ => true,
        };
        if !valid {
            return Err(ReceiveError::Malformed(format!(
                "object {name} does not match the repository mode"
            )));
        }
    }
    let entry = state.queue.create(req.refs, req.objects)?;
    tracing::info!(
        "Queue {}: created for {:?} with {} objects",
        entry.id,
        entry.update_refs.keys().collect::<Vec<_>>(),
        entry.objects.len()
    );
    Ok(Json(QueueResponse {
        id: entry.id.clone(),
    }))
}

async fn missing_objects(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ObjectsResponse>, ReceiveError> {
    let entry = state.queue.get(&id).ok_or(ReceiveError::NotFound)?;
    let staging = state.staging.clone();
    let objects =
        tokio::task::spawn_blocking(move || staging.missing_objects(entry.objects.iter()))
            .await
            .map_err(anyhow::Error::new)?;
    Ok(Json(ObjectsResponse { objects }))
}

async fn upload(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<(), ReceiveError> {
    let entry = state.queue.get(&id).ok_or(ReceiveError::NotFound)?;
    if entry.is_finalizing() {
        return Err(ReceiveError::ClosedForUpload);
    }

    // Digests of objects staged by this request, awaiting their checksum part
    let mut digests: HashMap<ObjectName, String> = HashMap::new();
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ReceiveError::Malformed(e.to_string()))?
    {
        match field.name().map(ToOwned::to_owned).as_deref() {
            Some("file") => {
                let name = field
                    .file_name()
                    .ok_or_else(|| ReceiveError::Malformed("file part without a filename".into()))
                    .and_then(|n| {
                        ObjectName::parse(n).map_err(|e| ReceiveError::Malformed(e.to_string()))
                    })?;
                if !entry.objects.contains(&name) {
                    return Err(ReceiveError::Malformed(format!(
                        "object {name} is not part of queue entry {id}"
                    )));
                }
                tracing::debug!("Receiving {name}");
                let mut staged = state.staging.begin(&name).await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ReceiveError::Malformed(e.to_string()))?
                {
                    staged
                        .write_chunk(&chunk)
                        .await
                        .map_err(|e| anyhow::Error::new(e).context(format!("Storing {name}")))?;
                }
                let digest = staged.finish().await?;
                digests.insert(name, digest);
            }
            Some("checksum") => {
                let body = field
                    .text()
                    .await
                    .map_err(|e| ReceiveError::Malformed(e.to_string()))?;
                let (name, declared) =
                    parse_checksum_part(&body).map_err(|e| ReceiveError::Malformed(e.to_string()))?;
                let Some(computed) = digests.get(&name) else {
                    return Err(ReceiveError::Malformed(format!(
                        "checksum for {name} without a matching file part"
                    )));
                };
                if *computed != declared {
                    // Drop the staged copy so the client can retry the object
                    state.staging.discard(&name)?;
                    tracing::warn!("Object {name} has a bad checksum ({computed} vs {declared})");
                    return Err(ReceiveError::BadChecksum(name));
                }
            }
            other => {
                return Err(ReceiveError::UnsupportedField(
                    other.unwrap_or_default().to_string(),
                ))
            }
        }
    }
    Ok(())
}

async fn done(State(state): State<AppState>, Path(id): Path<String>) -> Result<(), ReceiveError> {
    let entry = state.queue.get(&id).ok_or(ReceiveError::NotFound)?;
    if !entry.begin_finalize() {
        return Err(ReceiveError::AlreadyFinalizing);
    }
    tracing::info!("Queue {id}: publishing {} objects", entry.objects.len());

    let staging = state.staging.clone();
    let repo = state.repo.clone();
    let entry = entry.clone();
    tokio::task::spawn_blocking(move || -> Result<(), ReceiveError> {
        // Objects first; refs only once the whole closure is live. A failure
        // anywhere leaves the previous refs intact.
        staging.promote(entry.objects.iter())?;
        for (branch, pair) in &entry.update_refs {
            tracing::info!("Setting branch {branch} to {}", pair.client);
            repo.set_ref(branch, &pair.client)?;
        }
        Ok(())
    })
    .await
    .map_err(anyhow::Error::new)??;

    state.queue.remove(&id);
    Ok(())
}

async fn delete_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(), ReceiveError> {
    // Only the entry goes away; staged files stay for the operator
    if !state.queue.remove(&id) {
        return Err(ReceiveError::NotFound);
    }
    tracing::info!("Queue {id}: deleted");
    Ok(())
}

fn make_span(req: &axum::http::Request<axum::body::Body>) -> tracing::Span {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.to_string())
        .unwrap_or_default();
    tracing::info_span!("request", %request_id, method = %req.method(), uri = %req.uri(), %client)
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/info", get(info))
        .route("/queue", post(create_entry))
        .route(
            "/queue/{id}",
            get(missing_objects)
                .put(upload)
                .delete(delete_entry)
                // GET and DELETE read no body, so lifting the cap here only
                // affects the upload stream.
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/done/{id}", get(done))
        .layer(DefaultBodyLimit::max(JSON_BODY_LIMIT))
        .layer(middleware::from_fn(request_timeout))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .nest("/api/v1", api)
        .route("/ping", get(ping))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(CatchPanicLayer::new())
                .layer(CompressionLayer::new())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}

/// Accept `:8080` as shorthand for all interfaces.
fn normalize_bind_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

/// Bind `address` and serve until the process is terminated.
pub async fn serve(address: &str, state: AppState) -> Result<()> {
    let addr = normalize_bind_address(address);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Binding {addr}"))?;
    tracing::info!("Listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
