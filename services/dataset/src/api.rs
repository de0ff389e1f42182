use crate::config::ApiConfig;
use crate::datasets::DatasetService;
use crate::error::{DatasetError, Result};
use crate::models::{sanitize_path_component, DatasetQuery, DatasetRecord, LabelStatus};
use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub datasets: DatasetService,
}

/// Uniform response envelope: `code` is 0 on success and -1 on failure
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "success".to_string(),
            data,
        }
    }
}

/// Dataset record as returned by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetView {
    pub id: Uuid,
    pub name: String,
    pub s3_key: String,
    pub category: String,
    /// Integer status code (0 pending, 2 processing, 1 done, -1 failed)
    pub is_labeled: i32,
    pub status: LabelStatus,
    pub create_at: DateTime<Utc>,
}

impl From<DatasetRecord> for DatasetView {
    fn from(r: DatasetRecord) -> Self {
        Self {
            id: r.id,
            is_labeled: r.status.code(),
            status: r.status,
            name: r.name,
            s3_key: r.blob_key,
            category: r.category,
            create_at: r.created_at,
        }
    }
}

/// Query parameters for dataset list
#[derive(Debug, Deserialize)]
pub struct ListParams {
    /// Case-insensitive substring of the name
    pub keyword: Option<String>,
    /// Exact category
    pub category: Option<String>,
}

/// `?name=` parameter of download and delete
#[derive(Debug, Deserialize)]
pub struct NameParams {
    pub name: Option<String>,
}

impl NameParams {
    fn required(self) -> Result<String> {
        self.name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| DatasetError::InvalidInput("missing name parameter".to_string()))
    }
}

impl IntoResponse for DatasetError {
    fn into_response(self) -> Response {
        let status = match &self {
            DatasetError::NotFound(_) => StatusCode::NOT_FOUND,
            DatasetError::Conflict(_) => StatusCode::CONFLICT,
            DatasetError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "Request failed");
        } else {
            warn!(kind = self.kind(), error = %self, "Request rejected");
        }

        let body = ApiResponse {
            code: -1,
            msg: self.to_string(),
            data: json!({}),
        };
        (status, Json(body)).into_response()
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/upload_dataset", post(upload_dataset))
        .route("/list_datasets", get(list_datasets))
        .route("/download_dataset", get(download_dataset))
        .route("/delete_dataset", delete(delete_dataset))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "dataset-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.datasets.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Accept a multipart upload with `name`, `category` and `file` fields
#[instrument(skip(state, multipart))]
async fn upload_dataset(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<serde_json::Value>>> {
    let mut name = None;
    let mut category = String::new();
    let mut archive: Option<NamedTempFile> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(invalid_multipart)? {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("name") => name = Some(field.text().await.map_err(invalid_multipart)?),
            Some("category") => category = field.text().await.map_err(invalid_multipart)?,
            Some("file") => {
                let scratch = NamedTempFile::new()?;
                let mut out = tokio::fs::File::create(scratch.path()).await?;
                while let Some(chunk) = field.chunk().await.map_err(invalid_multipart)? {
                    out.write_all(&chunk).await?;
                }
                out.flush().await?;
                archive = Some(scratch);
            }
            _ => {}
        }
    }

    let name = name.ok_or_else(|| DatasetError::InvalidInput("missing name field".to_string()))?;
    let archive =
        archive.ok_or_else(|| DatasetError::InvalidInput("missing file field".to_string()))?;

    let record = state
        .datasets
        .upload(&name, &category, archive.path())
        .await?;

    Ok(Json(ApiResponse::success(json!({ "name": record.name }))))
}

#[instrument(skip(state))]
async fn list_datasets(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<ApiResponse<serde_json::Value>>> {
    let query = DatasetQuery {
        keyword: params.keyword,
        category: params.category,
    };

    let list: Vec<DatasetView> = state
        .datasets
        .list(&query)
        .await?
        .into_iter()
        .map(DatasetView::from)
        .collect();

    Ok(Json(ApiResponse::success(json!({ "list": list }))))
}

/// Stream the current archive as `<name>.zip`; the local copy is unlinked
/// before the body is sent
#[instrument(skip(state))]
async fn download_dataset(
    State(state): State<AppState>,
    Query(params): Query<NameParams>,
) -> Result<Response> {
    let name = params.required()?;

    let scratch = NamedTempFile::new()?;
    state.datasets.download(&name, scratch.path()).await?;
    let file = tokio::fs::File::from_std(scratch.reopen()?);
    drop(scratch);

    let body = Body::from_stream(ReaderStream::new(file));
    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (header::CONTENT_DISPOSITION, content_disposition(&name)),
    ];

    Ok((headers, body).into_response())
}

#[instrument(skip(state))]
async fn delete_dataset(
    State(state): State<AppState>,
    Query(params): Query<NameParams>,
) -> Result<Json<ApiResponse<serde_json::Value>>> {
    let name = params.required()?;
    state.datasets.delete(&name).await?;
    Ok(Json(ApiResponse::success(json!({ "name": name }))))
}

/// Attachment header for `<name>.zip`: an ASCII-safe `filename` plus the
/// exact name percent-encoded in `filename*`
fn content_disposition(name: &str) -> String {
    format!(
        "attachment; filename=\"{}.zip\"; filename*=UTF-8''{}.zip",
        sanitize_path_component(name),
        urlencoding::encode(name)
    )
}

fn invalid_multipart(e: axum::extract::multipart::MultipartError) -> DatasetError {
    DatasetError::InvalidInput(format!("invalid multipart body: {}", e))
}

/// Serve the dataset API until `shutdown` is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting dataset API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
