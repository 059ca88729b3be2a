use crate::{
    detector::Detector,
    server::SharedState,
    service::{DetectionError, DetectionResponse, UploadedImage},
};
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    response::Json,
};
use std::time::Instant;
use tracing::instrument;

const ROUTE: &str = "/detect";
const IMAGE_FIELD: &str = "image";
const IMAGE_ID_FIELD: &str = "image_id";

struct DetectForm {
    image: UploadedImage,
    image_id: Option<String>,
}

async fn read_form(mut multipart: Multipart) -> Result<DetectForm, DetectionError> {
    let mut image = None;
    let mut image_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| DetectionError::InvalidInput(format!("Multipart error: {}", e)))?
    {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some(IMAGE_FIELD) => {
                let content_type = field.content_type().map(str::to_owned);
                let bytes = field.bytes().await.map_err(|e| {
                    DetectionError::InvalidInput(format!("Failed to read image: {}", e))
                })?;
                image = Some(UploadedImage {
                    bytes,
                    content_type,
                });
            }
            Some(IMAGE_ID_FIELD) => {
                let text = field.text().await.map_err(|e| {
                    DetectionError::InvalidInput(format!("Failed to read image_id: {}", e))
                })?;
                image_id = Some(text);
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| {
        DetectionError::InvalidInput("Missing `image` file field".to_string())
    })?;

    Ok(DetectForm { image, image_id })
}

async fn handle<D: Detector>(
    state: &SharedState<D>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<DetectionResponse, DetectionError> {
    let multipart = multipart.map_err(|e| DetectionError::InvalidInput(e.body_text()))?;
    let form = read_form(multipart).await?;
    state
        .detection_service
        .detect(form.image, form.image_id)
        .await
}

#[instrument(skip(state, multipart))]
pub async fn detect<D: Detector>(
    State(state): State<SharedState<D>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResponse>, DetectionError> {
    state.metrics.record_request(ROUTE);
    let started = Instant::now();

    match handle(&state, multipart).await {
        Ok(response) => {
            state.metrics.record_detection(
                started.elapsed().as_millis() as u64,
                response.detection_count,
                ROUTE,
            );
            Ok(Json(response))
        }
        Err(e) => {
            state.metrics.record_error(ROUTE, e.kind());
            Err(e)
        }
    }
}
