mod detect;
mod health;
mod metrics;
mod model_info;

use crate::{detector::Detector, server::SharedState, service::DetectionError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

pub fn api_routes<D: Detector>() -> Router<SharedState<D>> {
    Router::new()
        .route("/health", get(health::healthcheck::<D>))
        .route("/model-info", get(model_info::model_info::<D>))
        .route("/detect", post(detect::detect::<D>))
        .route("/metrics", get(metrics::metrics_handler::<D>))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
    pub kind: String,
}

impl IntoResponse for DetectionError {
    fn into_response(self) -> Response {
        let status = match self {
            DetectionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DetectionError::ModelUnavailable(_)
            | DetectionError::Inference(_)
            | DetectionError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if self.is_client_error() {
            tracing::warn!("Rejected request: {}", self);
        } else {
            tracing::error!("Request failed: {}", self);
        }

        let body = ErrorBody {
            detail: self.to_string(),
            kind: self.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
