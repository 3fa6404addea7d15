//! HTTP API for the Cairn node.
//!
//! Implements git smart HTTP protocol endpoints for push/pull operations,
//! plus a small JSON API for the repository registry.
//!
//! The git handlers are synchronous and run on the blocking pool; request
//! bodies are read whole (bounded by `max_body_bytes`) before handing them
//! to the protocol code.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cairn_git::{
    advertise_refs, receive_pack, upload_pack, GitError, Service, TransferOptions,
};
use cairn_storage::{
    CachedStore, FsStore, MemoryStore, ObjectStore, Reference, RepoStore, Repository, StorageError,
};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use validator::Validate;

use crate::access::{Access, AccessPolicy, AllowAll, Denial, StaticTokenPolicy};
use crate::config::{NodeConfig, StorageBackend};
use crate::feed::RefUpdateFeed;
use crate::observability::request_id_layer;
use crate::validation::{repo_name, validate_name, ValidationErrorResponse};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Repository registry.
    pub repos: Arc<RepoStore>,
    /// Authorization for transfers.
    pub access: Arc<dyn AccessPolicy>,
    /// Applied reference updates.
    pub feed: RefUpdateFeed,
    /// Pack limits and push policy.
    pub transfer: Arc<TransferOptions>,
    /// Largest accepted request body, after decoding.
    pub max_body_bytes: usize,
    /// Create unknown repositories on their first push.
    pub auto_create_on_push: bool,
}

impl AppState {
    /// Creates state over `repos` with an open access policy and defaults.
    pub fn new(repos: Arc<RepoStore>) -> Self {
        let transfer = TransferOptions::default();
        Self {
            repos,
            access: Arc::new(AllowAll),
            feed: RefUpdateFeed::default(),
            max_body_bytes: transfer.limits.max_pack_bytes,
            transfer: Arc::new(transfer),
            auto_create_on_push: false,
        }
    }

    /// Replaces the access policy.
    pub fn with_access(mut self, access: Arc<dyn AccessPolicy>) -> Self {
        self.access = access;
        self
    }

    /// Builds storage, policy and limits from configuration.
    pub fn from_config(config: &NodeConfig) -> Result<Self, StorageError> {
        let repos = match config.storage.backend {
            StorageBackend::Memory => RepoStore::new(Arc::new(MemoryStore::new())),
            StorageBackend::Fs => {
                let fs = FsStore::with_compression(
                    config.storage.objects_dir(),
                    config.storage.compression,
                )?;
                let objects: Arc<dyn ObjectStore> = match config.storage.cache() {
                    Some(cache) => Arc::new(CachedStore::new(fs, cache)),
                    None => Arc::new(fs),
                };
                RepoStore::persistent(objects, config.storage.refs_dir())?
            }
        };

        let access: Arc<dyn AccessPolicy> = match &config.auth.write_token {
            Some(token) => Arc::new(StaticTokenPolicy::new(token.clone())),
            None => Arc::new(AllowAll),
        };

        tracing::info!(
            backend = ?config.storage.backend,
            repositories = repos.list().len(),
            token_auth = config.auth.write_token.is_some(),
            "Storage ready"
        );

        Ok(Self {
            repos: Arc::new(repos),
            access,
            feed: RefUpdateFeed::new(config.api.feed_capacity),
            transfer: Arc::new(config.git.transfer_options()),
            max_body_bytes: config.api.max_body_bytes,
            auto_create_on_push: config.git.auto_create_on_push,
        })
    }

    fn authorize(
        &self,
        owner: &str,
        name: &str,
        access: Access,
        headers: &HeaderMap,
    ) -> Result<(), ApiError> {
        self.access
            .authorize(owner, name, access, headers)
            .map_err(|denial| match denial {
                Denial::Unauthenticated => ApiError::Unauthorized,
                Denial::Forbidden => ApiError::Forbidden,
            })
    }
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("repository already exists: {0}")]
    RepoExists(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("permission denied")]
    Forbidden,
    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
    #[error("unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("validation failed")]
    Validation(#[from] validator::ValidationErrors),
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("storage error: {0}")]
    Storage(StorageError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::RepoNotFound(key) => ApiError::RepoNotFound(key),
            StorageError::RepoExists(key) => ApiError::RepoExists(key),
            StorageError::InvalidRef(msg) => ApiError::BadRequest(msg),
            other => ApiError::Storage(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Validation(errors) = self {
            return ValidationErrorResponse::from(errors).into_response();
        }
        let status = match &self {
            ApiError::RepoNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::RepoExists(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::UnsupportedEncoding(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Validation(_)
            | ApiError::Git(_)
            | ApiError::Storage(_)
            | ApiError::Internal(_) => {
                tracing::error!(error = %self, "Request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let mut response = (status, Json(ErrorResponse { error: self.to_string() })).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Bearer realm=\"cairn\""),
            );
        }
        response
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Repository info for listing.
#[derive(Debug, Serialize, Deserialize)]
pub struct RepoInfo {
    pub owner: String,
    pub name: String,
}

impl RepoInfo {
    fn of(repo: &Repository) -> Self {
        Self {
            owner: repo.owner.clone(),
            name: repo.name.clone(),
        }
    }
}

/// Repository details, with references.
#[derive(Debug, Serialize, Deserialize)]
pub struct RepoDetails {
    pub owner: String,
    pub name: String,
    /// Branch HEAD points at, if symbolic.
    pub head: Option<String>,
    /// Direct references and their hex IDs.
    pub refs: BTreeMap<String, String>,
}

/// Request to create a repository.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateRepoRequest {
    #[validate(custom(function = "validate_name"))]
    pub owner: String,
    #[validate(custom(function = "validate_name"))]
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

/// Creates the API router.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.max_body_bytes;
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Repository management
        .route("/api/repos", get(list_repos).post(create_repo))
        .route("/api/repos/{owner}/{name}", get(get_repo))
        // Git smart HTTP protocol
        .route("/git/{owner}/{name}/info/refs", get(git_info_refs))
        .route("/git/{owner}/{name}/git-upload-pack", post(git_upload_pack))
        .route("/git/{owner}/{name}/git-receive-pack", post(git_receive_pack))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(request_id_layer())
        .with_state(state)
}

/// Runs a synchronous job on the blocking pool.
async fn run_blocking<T, F>(job: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
}

/// Undoes `Content-Encoding: gzip`, bounded by `limit` decoded bytes.
fn decode_body(headers: &HeaderMap, body: Bytes, limit: usize) -> Result<Bytes, ApiError> {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .map(|v| v.to_str().unwrap_or_default().trim().to_ascii_lowercase());

    match encoding.as_deref() {
        None | Some("") | Some("identity") => Ok(body),
        Some("gzip") | Some("x-gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(&body[..])
                .take(limit as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| ApiError::BadRequest(format!("invalid gzip body: {}", e)))?;
            if out.len() > limit {
                return Err(ApiError::PayloadTooLarge(limit));
            }
            Ok(Bytes::from(out))
        }
        Some(other) => Err(ApiError::UnsupportedEncoding(other.to_string())),
    }
}

fn git_response(content_type: String, body: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        body,
    )
        .into_response()
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Lists all repositories.
async fn list_repos(State(state): State<AppState>) -> impl IntoResponse {
    let repos: Vec<RepoInfo> = state.repos.list().iter().map(|r| RepoInfo::of(r)).collect();
    Json(repos)
}

/// Creates a new repository.
async fn create_repo(
    State(state): State<AppState>,
    Json(req): Json<CreateRepoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()?;
    let repo = state.repos.create(&req.owner, &req.name)?;
    Ok((StatusCode::CREATED, Json(RepoInfo::of(&repo))))
}

/// Gets repository details.
async fn get_repo(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let repo = state.repos.get(&owner, repo_name(&name))?;
    let refs = repo
        .list_refs()
        .into_iter()
        .filter_map(|(name, reference)| match reference {
            Reference::Direct(id) => Some((name, id.to_hex())),
            Reference::Symbolic(_) => None,
        })
        .collect();

    Ok(Json(RepoDetails {
        owner: repo.owner.clone(),
        name: repo.name.clone(),
        head: repo.refs.head_target(),
        refs,
    }))
}

/// Git info/refs endpoint - advertises references.
async fn git_info_refs(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let service = query
        .service
        .as_deref()
        .and_then(Service::parse)
        .ok_or_else(|| {
            ApiError::BadRequest(
                "dumb HTTP is not supported; request ?service=git-upload-pack or git-receive-pack"
                    .to_string(),
            )
        })?;
    let name = repo_name(&name).to_string();
    let access = match service {
        Service::UploadPack => Access::Read,
        Service::ReceivePack => Access::Write,
    };
    state.authorize(&owner, &name, access, &headers)?;

    let repo = match state.repos.get(&owner, &name) {
        Ok(repo) => repo,
        // Advertise an empty repository; the push itself creates it.
        Err(StorageError::RepoNotFound(_))
            if service == Service::ReceivePack && state.auto_create_on_push =>
        {
            validate_name(&owner).map_err(|_| ApiError::RepoNotFound(format!("{}/{}", owner, name)))?;
            validate_name(&name).map_err(|_| ApiError::RepoNotFound(format!("{}/{}", owner, name)))?;
            Arc::new(Repository::new(&owner, &name, state.repos.objects()))
        }
        Err(e) => return Err(e.into()),
    };

    let output = run_blocking(move || {
        let mut output = Vec::new();
        advertise_refs(&mut output, &repo, service)?;
        Ok(output)
    })
    .await?;

    Ok(git_response(
        format!("application/x-{}-advertisement", service),
        output,
    ))
}

/// Git upload-pack endpoint - handles fetch/clone.
async fn git_upload_pack(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let name = repo_name(&name).to_string();
    state.authorize(&owner, &name, Access::Read, &headers)?;
    let repo = state.repos.get(&owner, &name)?;
    let limit = state.max_body_bytes;

    let output = run_blocking(move || {
        let body = decode_body(&headers, body, limit)?;
        let mut output = Vec::new();
        upload_pack(&mut Cursor::new(body), &mut output, &repo)?;
        Ok(output)
    })
    .await?;

    Ok(git_response(
        "application/x-git-upload-pack-result".to_string(),
        output,
    ))
}

/// Git receive-pack endpoint - handles push.
async fn git_receive_pack(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let name = repo_name(&name).to_string();
    state.authorize(&owner, &name, Access::Write, &headers)?;

    let repo = match state.repos.get(&owner, &name) {
        Ok(repo) => repo,
        Err(StorageError::RepoNotFound(_)) if state.auto_create_on_push => {
            validate_name(&owner).map_err(|_| ApiError::RepoNotFound(format!("{}/{}", owner, name)))?;
            validate_name(&name).map_err(|_| ApiError::RepoNotFound(format!("{}/{}", owner, name)))?;
            state.repos.get_or_create(&owner, &name)?
        }
        Err(e) => return Err(e.into()),
    };

    let limit = state.max_body_bytes;
    let options = Arc::clone(&state.transfer);
    let (output, report) = run_blocking(move || {
        let body = decode_body(&headers, body, limit)?;
        let mut output = Vec::new();
        let report = receive_pack(&mut Cursor::new(body), &mut output, &repo, &options)?;
        Ok((output, report))
    })
    .await?;

    if !report.updates.is_empty() {
        let listeners = state.feed.publish(report.updates.iter().cloned());
        tracing::debug!(updates = report.updates.len(), listeners, "Published ref updates");
    }

    Ok(git_response(
        "application/x-git-receive-pack-result".to_string(),
        output,
    ))
}
