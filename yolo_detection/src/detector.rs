use image::RgbImage;
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("Failed to load model from {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("Unsupported device `{0}`. Use `cpu`, `cuda` or `cuda:<id>`")]
    UnsupportedDevice(String),
    #[error("Failed to load class labels: {0}")]
    Labels(#[from] std::io::Error),
    #[error("{0}")]
    Inference(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
}

/// A single detection as reported by the model, in absolute pixel
/// coordinates of the image passed to [`Detector::predict`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub class_id: usize,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// A pretrained object detector.
///
/// Calls are blocking; callers running on an async runtime are expected to
/// move them off the reactor threads.
pub trait Detector: Send + Sync + 'static {
    fn predict(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<RawDetection>, DetectorError>;

    /// Class names indexed by class id.
    fn class_names(&self) -> &[String];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Cuda(i32),
}

impl FromStr for Device {
    type Err = DetectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        match normalized.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|id| id.parse::<i32>().ok())
                .filter(|id| *id >= 0)
                .map(Device::Cuda)
                .ok_or_else(|| DetectorError::UnsupportedDevice(s.to_string())),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
        }
    }
}
