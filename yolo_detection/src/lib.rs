mod annotator;
mod app;
mod codec;
mod font;
mod labels;
mod model_handle;
mod ort_service;
mod routes;
mod server;
mod service;
mod telemetry;

pub mod config;
pub mod detector;

pub use annotator::Annotator;
pub use app::start_app;
pub use codec::{from_png_data_uri, to_png_data_uri};
pub use font::LabelFont;
pub use model_handle::ModelHandle;
pub use ort_service::OrtDetector;
pub use routes::ErrorBody;
pub use server::{create_app, HttpServer, SharedState};
pub use service::{
    Detection, DetectionError, DetectionResponse, DetectionService, HealthReport, ModelInfo,
    ServiceOptions, UploadedImage,
};
pub use telemetry::Metrics;
