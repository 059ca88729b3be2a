use crate::{detector::Detector, server::SharedState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use tracing::instrument;

const ROUTE: &str = "/health";

#[instrument(skip(state))]
pub async fn healthcheck<D: Detector>(State(state): State<SharedState<D>>) -> impl IntoResponse {
    state.metrics.record_request(ROUTE);

    let report = state.detection_service.health().await;
    let status = if report.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (status, Json(report))
}
