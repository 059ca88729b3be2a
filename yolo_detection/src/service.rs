use crate::{
    annotator::Annotator,
    codec::{self, CodecError},
    config::{Config, MAX_CONFIDENCE_DECIMALS},
    detector::{Detector, RawDetection},
    model_handle::ModelHandle,
};
use bytes::Bytes;
use image::RgbImage;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::Semaphore, time::Instant};
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("Failed to load YOLO model: {0}")]
    ModelUnavailable(String),
    #[error("YOLO inference failed: {0}")]
    Inference(String),
    #[error("Failed to encode annotated image: {0}")]
    Encode(String),
}

impl DetectionError {
    pub fn kind(&self) -> &'static str {
        match self {
            DetectionError::InvalidInput(_) => "invalid_input",
            DetectionError::ModelUnavailable(_) => "model_unavailable",
            DetectionError::Inference(_) => "inference_error",
            DetectionError::Encode(_) => "encode_error",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, DetectionError::InvalidInput(_))
    }
}

/// An image file as received from a client.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub annotated_image_base64: String,
    pub detections: Vec<Detection>,
    pub image_id: Option<String>,
    pub detection_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub model_loaded: bool,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HealthReport {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_path: PathBuf,
    pub device: String,
    pub confidence_threshold: f32,
    pub classes: IndexMap<usize, String>,
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub model_path: PathBuf,
    pub device: String,
    pub confidence_threshold: f32,
    pub confidence_decimals: Option<u32>,
    pub max_concurrent: usize,
    pub timeout: Option<Duration>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServiceOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model_path: config.model.model_path.clone(),
            device: config.model.device.clone(),
            confidence_threshold: config.model.confidence_threshold,
            confidence_decimals: config.annotation.confidence_decimals,
            max_concurrent: config
                .inference
                .max_concurrent
                .unwrap_or(config.model.num_instances)
                .max(1),
            timeout: config.inference.get_timeout(),
        }
    }
}

fn round_to(value: f32, decimals: u32) -> f32 {
    let factor = 10f64.powi(decimals.min(MAX_CONFIDENCE_DECIMALS) as i32);
    ((value as f64 * factor).round() / factor) as f32
}

/// Maps a raw detection onto the response record.
pub fn translate(
    raw: &RawDetection,
    class_names: &[String],
    confidence_decimals: Option<u32>,
) -> Detection {
    let class_name = class_names
        .get(raw.class_id)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", raw.class_id));

    let confidence = if raw.confidence.is_nan() {
        0.
    } else {
        raw.confidence.clamp(0., 1.)
    };
    let confidence = match confidence_decimals {
        Some(decimals) => round_to(confidence, decimals),
        None => confidence,
    };

    Detection {
        class_name,
        confidence,
        x: raw.x1 as i32,
        y: raw.y1 as i32,
        w: (raw.x2 - raw.x1).max(0.) as u32,
        h: (raw.y2 - raw.y1).max(0.) as u32,
    }
}

/// Runs uploaded images through validation, detection, annotation and
/// encoding.
pub struct DetectionService<D: Detector> {
    model: Arc<ModelHandle<D>>,
    annotator: Arc<Annotator>,
    options: ServiceOptions,
    permits: Arc<Semaphore>,
}

impl<D: Detector> DetectionService<D> {
    pub fn new(model: ModelHandle<D>, annotator: Annotator, options: ServiceOptions) -> Self {
        let permits = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
        Self {
            model: Arc::new(model),
            annotator: Arc::new(annotator),
            options,
            permits,
        }
    }

    pub fn model(&self) -> &ModelHandle<D> {
        &self.model
    }

    #[instrument(skip(self, upload))]
    pub async fn detect(
        &self,
        upload: UploadedImage,
        image_id: Option<String>,
    ) -> Result<DetectionResponse, DetectionError> {
        validate(&upload)?;

        let image = Arc::new(decode(upload.bytes).await?);

        let detector = self
            .model
            .get()
            .await
            .map_err(|e| DetectionError::ModelUnavailable(e.to_string()))?;

        let raw = self.run_detector(detector.clone(), image.clone()).await?;

        let detections: Vec<Detection> = raw
            .iter()
            .map(|raw| {
                translate(
                    raw,
                    detector.class_names(),
                    self.options.confidence_decimals,
                )
            })
            .collect();

        tracing::debug!("Returning {} detections", detections.len());
        for (i, detection) in detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class={}, confidence={:.3}, bbox=({}, {}, {}, {})",
                i,
                detection.class_name,
                detection.confidence,
                detection.x,
                detection.y,
                detection.w,
                detection.h
            );
        }

        let annotated_image_base64 = self.render(image, detections.clone()).await?;

        Ok(DetectionResponse {
            annotated_image_base64,
            detection_count: detections.len(),
            detections,
            image_id,
        })
    }

    async fn run_detector(
        &self,
        detector: Arc<D>,
        image: Arc<RgbImage>,
    ) -> Result<Vec<RawDetection>, DetectionError> {
        let started = Instant::now();
        // One deadline covers both the wait for a free slot and the detector call.
        let deadline = self.options.timeout.map(|limit| started + limit);

        let acquire = self.permits.clone().acquire_owned();
        let permit = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, acquire).await.map_err(|_| {
                DetectionError::Inference(format!(
                    "inference timed out after {} ms waiting for a free inference slot",
                    started.elapsed().as_millis()
                ))
            })?,
            None => acquire.await,
        }
        .map_err(|e| DetectionError::Inference(e.to_string()))?;
        let threshold = self.options.confidence_threshold;

        // Held until the detector returns, even after a timeout.
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            detector.predict(&image, threshold)
        });

        let joined = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, task).await.map_err(|_| {
                DetectionError::Inference(format!(
                    "inference timed out after {} ms",
                    started.elapsed().as_millis()
                ))
            })?,
            None => task.await,
        };

        joined
            .map_err(|e| DetectionError::Inference(format!("inference task failed: {}", e)))?
            .map_err(|e| DetectionError::Inference(e.to_string()))
    }

    async fn render(
        &self,
        image: Arc<RgbImage>,
        detections: Vec<Detection>,
    ) -> Result<String, DetectionError> {
        let annotator = self.annotator.clone();
        let png = tokio::task::spawn_blocking(move || {
            if detections.is_empty() {
                return codec::encode_png(&image);
            }
            codec::encode_png(&annotator.annotate(&image, &detections))
        })
        .await
        .map_err(|e| DetectionError::Encode(e.to_string()))?
        .map_err(|e| DetectionError::Encode(e.to_string()))?;

        Ok(codec::to_png_data_uri(&png))
    }

    pub async fn health(&self) -> HealthReport {
        match self.model.get().await {
            Ok(_) => HealthReport {
                status: "ok".to_string(),
                model_loaded: true,
                device: self.options.device.clone(),
                detail: None,
            },
            Err(e) => HealthReport {
                status: "error".to_string(),
                model_loaded: false,
                device: self.options.device.clone(),
                detail: Some(e.to_string()),
            },
        }
    }

    pub async fn model_info(&self) -> Result<ModelInfo, DetectionError> {
        let detector = self
            .model
            .get()
            .await
            .map_err(|e| DetectionError::ModelUnavailable(e.to_string()))?;

        Ok(ModelInfo {
            model_path: self.options.model_path.clone(),
            device: self.options.device.clone(),
            confidence_threshold: self.options.confidence_threshold,
            classes: detector
                .class_names()
                .iter()
                .cloned()
                .enumerate()
                .collect(),
        })
    }
}

fn validate(upload: &UploadedImage) -> Result<(), DetectionError> {
    let is_image = upload
        .content_type
        .as_deref()
        .map(|content_type| content_type.trim().to_lowercase().starts_with("image/"))
        .unwrap_or(false);
    if !is_image {
        return Err(DetectionError::InvalidInput(
            "Invalid file type. Expected image/*".to_string(),
        ));
    }
    if upload.bytes.is_empty() {
        return Err(DetectionError::InvalidInput("Empty file".to_string()));
    }
    Ok(())
}

async fn decode(bytes: Bytes) -> Result<RgbImage, DetectionError> {
    tokio::task::spawn_blocking(move || codec::decode(&bytes))
        .await
        .map_err(|e| DetectionError::InvalidInput(format!("Unable to decode image: {}", e)))?
        .map_err(|e| match e {
            CodecError::Empty => DetectionError::InvalidInput("Empty file".to_string()),
            other => DetectionError::InvalidInput(other.to_string()),
        })
}
