//! HTTP facade for the pipeline.
//!
//! Exposes document ingestion and querying as a small JSON API so a separate
//! front end (or any HTTP client) can drive the system.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Register a PDF by path and start background ingestion |
//! | `GET`  | `/documents` | List registered documents with status |
//! | `GET`  | `/documents/{id}` | Status readout for one document |
//! | `POST` | `/query` | Ask a question against a ready document |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one envelope:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `document_not_ready`
//! (409), `empty_index` (409), `synthesis_error` (500), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted: the front end serving the
//! chat UI runs on a different origin than this API.

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::document;
use crate::error::StageError;
use crate::models::{ChatTurn, Citation, DocumentRecord};
use crate::pipeline::Pipeline;
use crate::progress::NoProgress;
use crate::summarize::CancelToken;
use crate::{db, migrate};

/// Shared application state passed to all route handlers via Axum's `State`
/// extractor. The pipeline is cheap to clone.
#[derive(Clone)]
struct AppState {
    pipeline: Pipeline,
}

/// Starts the HTTP server with backends wired from configuration.
///
/// Opens the database, runs migrations, and binds to `[server].bind`. Runs
/// until the process is terminated.
pub async fn run(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool).await?;
    let pipeline = Pipeline::from_config(Arc::new(config.clone()), pool)?;
    run_with_pipeline(config, pipeline).await
}

/// Starts the HTTP server around an existing [`Pipeline`].
///
/// Used by hosts that construct the pipeline themselves, for example with
/// custom stage backends.
pub async fn run_with_pipeline(config: &Config, pipeline: Pipeline) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState { pipeline };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_upload).get(handle_list_documents))
        .route("/documents/{id}", get(handle_get_document))
        .route("/query", post(handle_query))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!("listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// Inner error detail with a machine-readable code and human-readable message.
#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

/// Constructs a 400 Bad Request error.
fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

/// Constructs a 404 Not Found error.
fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Constructs a 409 Conflict error with a specific code.
fn conflict(code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::CONFLICT,
        code: code.to_string(),
        message: message.into(),
    }
}

/// Constructs a 500 error.
fn internal(code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: code.to_string(),
        message: message.into(),
    }
}

/// Maps pipeline and query failures to the most appropriate HTTP status.
/// Typed stage errors carry their own classification; anything else is a 500.
fn classify_error(err: anyhow::Error) -> AppError {
    if let Some(stage) = err.downcast_ref::<StageError>() {
        return match stage {
            StageError::NotReady { .. } => conflict("document_not_ready", stage.to_string()),
            StageError::EmptyIndex(_) => conflict("empty_index", stage.to_string()),
            StageError::Synthesis(_) => internal("synthesis_error", stage.to_string()),
            _ => internal("internal", stage.to_string()),
        };
    }
    let msg = err.to_string();
    if msg.contains("Unknown document") {
        not_found(msg)
    } else {
        internal("internal", msg)
    }
}

// ============ GET /health ============

/// JSON response body for `GET /health`.
#[derive(Serialize)]
struct HealthResponse {
    /// Always `"ok"` when the server is running.
    status: String,
    /// The crate version from `Cargo.toml`.
    version: String,
}

/// Handler for `GET /health`.
async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /documents ============

/// JSON request body for `POST /documents`.
#[derive(Deserialize)]
struct UploadRequest {
    /// Path to a PDF on a filesystem the server can read.
    path: String,
}

/// One document's status readout.
#[derive(Serialize)]
struct DocumentResponse {
    id: String,
    file_name: String,
    path: String,
    sha256: String,
    page_count: i64,
    status: String,
    status_reason: Option<String>,
    regions_detected: i64,
    regions_summarized: i64,
    regions_failed: i64,
    created_at: i64,
    updated_at: i64,
}

impl From<&DocumentRecord> for DocumentResponse {
    fn from(doc: &DocumentRecord) -> Self {
        DocumentResponse {
            id: doc.id.clone(),
            file_name: doc.file_name.clone(),
            path: doc.path.clone(),
            sha256: doc.sha256.clone(),
            page_count: doc.page_count,
            status: doc.status.to_string(),
            status_reason: doc.status_reason.clone(),
            regions_detected: doc.regions_detected,
            regions_summarized: doc.regions_summarized,
            regions_failed: doc.regions_failed,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

/// Handler for `POST /documents`.
///
/// Registers the document and spawns ingestion on the runtime, returning
/// immediately with the `uploaded` record. Progress is polled via
/// `GET /documents/{id}`.
async fn handle_upload(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<Json<DocumentResponse>, AppError> {
    if req.path.trim().is_empty() {
        return Err(bad_request("path must not be empty"));
    }

    let doc = state
        .pipeline
        .upload(Path::new(&req.path))
        .await
        .map_err(|e| bad_request(format!("failed to register document: {}", e)))?;

    let pipeline = state.pipeline.clone();
    let document_id = doc.id.clone();
    tokio::spawn(async move {
        if let Err(e) = pipeline
            .ingest(&document_id, CancelToken::new(), &NoProgress)
            .await
        {
            warn!(document_id, error = %e, "background ingestion failed");
        }
    });

    Ok(Json(DocumentResponse::from(&doc)))
}

// ============ GET /documents ============

/// JSON response body for `GET /documents`.
#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<DocumentResponse>,
}

/// Handler for `GET /documents`. Most recently updated first.
async fn handle_list_documents(
    State(state): State<AppState>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = document::list_documents(state.pipeline.pool())
        .await
        .map_err(|e| internal("internal", e.to_string()))?;
    Ok(Json(DocumentListResponse {
        documents: documents.iter().map(DocumentResponse::from).collect(),
    }))
}

// ============ GET /documents/{id} ============

/// Handler for `GET /documents/{id}`.
async fn handle_get_document(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let doc = document::get_document(state.pipeline.pool(), &id)
        .await
        .map_err(|e| internal("internal", e.to_string()))?
        .ok_or_else(|| not_found(format!("no document with id: {}", id)))?;
    Ok(Json(DocumentResponse::from(&doc)))
}

// ============ POST /query ============

/// JSON request body for `POST /query`.
#[derive(Deserialize)]
struct QueryRequest {
    document_id: String,
    question: String,
    /// Optional prior turns, replayed to the synthesis model.
    #[serde(default)]
    history: Vec<ChatTurn>,
}

/// JSON response body for `POST /query`.
#[derive(Serialize)]
struct QueryResponse {
    answer: String,
    citations: Vec<Citation>,
}

/// Handler for `POST /query`.
///
/// Returns `409` while the document is not `ready` or its index is empty,
/// `404` for unknown documents, and `500` when synthesis fails.
async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let answer = state
        .pipeline
        .answer(&req.document_id, &req.question, &req.history)
        .await
        .map_err(classify_error)?;

    Ok(Json(QueryResponse {
        answer: answer.text,
        citations: answer.citations,
    }))
}
