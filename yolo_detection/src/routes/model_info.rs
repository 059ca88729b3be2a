use crate::{
    detector::Detector,
    server::SharedState,
    service::{DetectionError, ModelInfo},
};
use axum::{extract::State, response::Json};
use tracing::instrument;

const ROUTE: &str = "/model-info";

#[instrument(skip(state))]
pub async fn model_info<D: Detector>(
    State(state): State<SharedState<D>>,
) -> Result<Json<ModelInfo>, DetectionError> {
    state.metrics.record_request(ROUTE);

    let info = state
        .detection_service
        .model_info()
        .await
        .inspect_err(|e| state.metrics.record_error(ROUTE, e.kind()))?;

    Ok(Json(info))
}
