//! HTTP surface: `POST /predict`, `GET /mask`, `GET /mask/:id`, `GET /healthz`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::artifacts::OverlayArtifact;
use crate::config::Config;
use crate::errors::{DecodeStage, Result, ScanError};
use crate::pipeline::{InferencePipeline, PredictionReport, RequestStage};
use crate::traits::{ClassificationModel, SegmentationModel};

/// Multipart field carrying the uploaded scan.
pub const UPLOAD_FIELD: &str = "image";

pub struct AppState<S: SegmentationModel, C: ClassificationModel> {
    pub pipeline: Arc<InferencePipeline<S, C>>,
    pub config: Arc<Config>,
}

impl<S: SegmentationModel, C: ClassificationModel> AppState<S, C> {
    pub fn new(pipeline: InferencePipeline<S, C>, config: Config) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            config: Arc::new(config),
        }
    }
}

impl<S: SegmentationModel, C: ClassificationModel> Clone for AppState<S, C> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            config: Arc::clone(&self.config),
        }
    }
}

pub fn router<S, C>(state: AppState<S, C>) -> Router
where
    S: SegmentationModel + 'static,
    C: ClassificationModel + 'static,
{
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/predict", post(predict::<S, C>))
        .route("/mask", get(latest_mask::<S, C>))
        .route("/mask/:id", get(mask_by_id::<S, C>))
        .route("/healthz", get(healthz::<S, C>))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationBody {
    pub label: String,
    pub confidence: f64,
    pub probabilities: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResponse {
    pub classification: ClassificationBody,
    pub segmentation_mask_url: String,
}

impl PredictionResponse {
    pub fn new(report: &PredictionReport, mask_url: String) -> Self {
        let classification = &report.classification;
        Self {
            classification: ClassificationBody {
                label: classification.label.clone(),
                confidence: round4(classification.confidence),
                probabilities: classification
                    .probabilities
                    .iter()
                    .map(|(name, p)| (name.clone(), round4(*p)))
                    .collect(),
            },
            segmentation_mask_url: mask_url,
        }
    }
}

fn round4(value: f32) -> f64 {
    (f64::from(value) * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub segmentation: bool,
    pub classification: bool,
    pub classes: Vec<String>,
}

async fn predict<S, C>(
    State(state): State<AppState<S, C>>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResponse>>
where
    S: SegmentationModel + 'static,
    C: ClassificationModel + 'static,
{
    let limit = state.config.max_upload_bytes;
    let upload = match read_upload(&mut multipart, limit).await {
        Ok(upload) => upload,
        Err(e) => {
            debug!(stage = ?RequestStage::Rejected, "request stage");
            return Err(e);
        }
    };

    let pipeline = Arc::clone(&state.pipeline);
    let report = tokio::task::spawn_blocking(move || pipeline.predict(&upload))
        .await
        .map_err(|e| ScanError::Model {
            operation: "inference task".to_string(),
            source: Box::new(e),
        })?
        .inspect_err(|e| {
            if matches!(e, ScanError::Decode { .. }) {
                debug!(stage = ?RequestStage::Rejected, "request stage");
            }
        })?;

    let mask_url = state.config.mask_url(&report.overlay.id.to_string());
    let response = PredictionResponse::new(&report, mask_url);
    debug!(stage = ?RequestStage::Responded, "request stage");
    Ok(Json(response))
}

async fn read_upload(multipart: &mut Multipart, limit: usize) -> Result<axum::body::Bytes> {
    let upload_error = |err: MultipartError| {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ScanError::UploadTooLarge { limit }
        } else {
            ScanError::Upload {
                source: Box::new(err),
            }
        }
    };
    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() == Some(UPLOAD_FIELD) {
            return field.bytes().await.map_err(upload_error);
        }
    }
    Err(ScanError::MissingUpload {
        field: UPLOAD_FIELD.to_string(),
    })
}

async fn latest_mask<S, C>(State(state): State<AppState<S, C>>) -> Result<Response>
where
    S: SegmentationModel + 'static,
    C: ClassificationModel + 'static,
{
    let artifact = state
        .pipeline
        .artifacts()
        .latest()
        .ok_or(ScanError::UnavailableArtifact { id: None })?;
    Ok(png_response(&artifact))
}

async fn mask_by_id<S, C>(
    State(state): State<AppState<S, C>>,
    AxumPath(id): AxumPath<String>,
) -> Result<Response>
where
    S: SegmentationModel + 'static,
    C: ClassificationModel + 'static,
{
    let artifact = Uuid::parse_str(&id)
        .ok()
        .and_then(|uuid| state.pipeline.artifacts().get(&uuid))
        .ok_or(ScanError::UnavailableArtifact { id: Some(id) })?;
    Ok(png_response(&artifact))
}

fn png_response(artifact: &OverlayArtifact) -> Response {
    let mut resp = Response::new(artifact.png.clone().into());
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    let modified = artifact
        .created_at
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
    resp
}

async fn healthz<S, C>(State(state): State<AppState<S, C>>) -> Json<HealthResponse>
where
    S: SegmentationModel + 'static,
    C: ClassificationModel + 'static,
{
    let pipeline = &state.pipeline;
    let segmentation = pipeline.segmentation_available();
    let classification = pipeline.classification_available();
    Json(HealthResponse {
        status: if segmentation && classification {
            "ok"
        } else {
            "degraded"
        },
        segmentation,
        classification,
        classes: pipeline.classes().names().to_vec(),
    })
}

impl IntoResponse for ScanError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::MissingUpload { .. } => (StatusCode::BAD_REQUEST, "No image uploaded".to_string()),
            Self::Upload { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::UploadTooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            Self::Decode {
                stage: DecodeStage::Primary,
                ..
            } => (StatusCode::BAD_REQUEST, "Invalid image".to_string()),
            Self::Decode {
                stage: DecodeStage::Secondary,
                ..
            } => (StatusCode::BAD_REQUEST, "Invalid image format".to_string()),
            Self::UnavailableArtifact { .. } => {
                (StatusCode::NOT_FOUND, "mask not found".to_string())
            }
            Self::UnavailableModel { .. } => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        if status.is_server_error() {
            error!(error = ?self, %status, "request failed");
        } else {
            warn!(error = %self, %status, "request rejected");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}
