use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use image::{GenericImageView, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use std::io::Cursor;
use tower::ServiceExt;
use yolo_detection::{
    config::ServerConfig,
    create_app,
    detector::{Detector, DetectorError, RawDetection},
    from_png_data_uri, Annotator, DetectionService, HttpServer, Metrics, ModelHandle,
    ServiceOptions, SharedState,
};

const BOUNDARY: &str = "yolo-detection-test-boundary";
const UPLOAD_LIMIT: usize = 20 * 1024 * 1024;

struct FixedDetector {
    detections: Vec<RawDetection>,
    class_names: Vec<String>,
}

impl Detector for FixedDetector {
    fn predict(&self, _: &RgbImage, _: f32) -> Result<Vec<RawDetection>, DetectorError> {
        Ok(self.detections.clone())
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

fn fixed_detector() -> FixedDetector {
    FixedDetector {
        detections: vec![RawDetection {
            class_id: 1,
            confidence: 0.83,
            x1: 12.,
            y1: 30.,
            x2: 72.,
            y2: 90.,
        }],
        class_names: vec!["person".to_string(), "dog".to_string()],
    }
}

fn app_with(model: ModelHandle<FixedDetector>, upload_limit: usize) -> Router {
    let service = DetectionService::new(model, Annotator::default(), ServiceOptions::default());
    let state = SharedState::new(service, Metrics::new().unwrap());
    create_app(state, upload_limit)
}

fn app() -> Router {
    app_with(ModelHandle::loaded(fixed_detector()), UPLOAD_LIMIT)
}

fn broken_app() -> Router {
    let model = ModelHandle::new(|| {
        Err(DetectorError::Load {
            path: "missing.onnx".to_string(),
            reason: "No such file or directory".to_string(),
        })
    });
    app_with(model, UPLOAD_LIMIT)
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([20, 60, 100]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

enum Part<'a> {
    File {
        name: &'a str,
        content_type: &'a str,
        bytes: &'a [u8],
    },
    Text {
        name: &'a str,
        value: &'a str,
    },
}

fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::File {
                name,
                content_type,
                bytes,
            } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"upload\"\r\n\
                         Content-Type: {}\r\n\r\n",
                        name, content_type
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
            Part::Text { name, value } => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"\r\n\r\n{}",
                        name, value
                    )
                    .as_bytes(),
                );
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn detect_request(parts: &[Part]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/detect")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn detect_returns_detections_and_annotated_image() {
    let png = png_bytes(160, 120);
    let request = detect_request(&[
        Part::File {
            name: "image",
            content_type: "image/png",
            bytes: &png,
        },
        Part::Text {
            name: "image_id",
            value: "frame-0042",
        },
    ]);

    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["image_id"], "frame-0042");
    assert_eq!(body["detection_count"], 1);

    let detection = &body["detections"][0];
    assert_eq!(detection["class_name"], "dog");
    assert_eq!(detection["x"], 12);
    assert_eq!(detection["y"], 30);
    assert_eq!(detection["w"], 60);
    assert_eq!(detection["h"], 60);
    assert!((detection["confidence"].as_f64().unwrap() - 0.83).abs() < 1e-6);

    let uri = body["annotated_image_base64"].as_str().unwrap();
    assert!(uri.starts_with("data:image/png;base64,"));
    let annotated = image::load_from_memory(&from_png_data_uri(uri).unwrap()).unwrap();
    assert_eq!(annotated.dimensions(), (160, 120));
}

#[tokio::test]
async fn detect_without_image_id_serialises_null() {
    let png = png_bytes(32, 32);
    let request = detect_request(&[Part::File {
        name: "image",
        content_type: "IMAGE/PNG",
        bytes: &png,
    }]);

    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["image_id"].is_null());
}

#[tokio::test]
async fn detect_rejects_non_image_content_type() {
    let request = detect_request(&[Part::File {
        name: "image",
        content_type: "text/plain",
        bytes: b"hello",
    }]);

    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Invalid file type. Expected image/*");
}

#[tokio::test]
async fn detect_rejects_empty_file() {
    let request = detect_request(&[Part::File {
        name: "image",
        content_type: "image/jpeg",
        bytes: b"",
    }]);

    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["detail"], "Empty file");
}

#[tokio::test]
async fn detect_rejects_undecodable_image() {
    let request = detect_request(&[Part::File {
        name: "image",
        content_type: "image/png",
        bytes: b"\x89PNG but not really",
    }]);

    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Unable to decode image"));
}

#[tokio::test]
async fn detect_requires_image_field() {
    let request = detect_request(&[Part::Text {
        name: "image_id",
        value: "abc",
    }]);

    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
}

#[tokio::test]
async fn detect_rejects_non_multipart_body() {
    let request = Request::builder()
        .method("POST")
        .uri("/detect")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();

    let (status, body) = send(app(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn detect_rejects_upload_over_limit() {
    let app = app_with(ModelHandle::loaded(fixed_detector()), 1024);
    let oversized = vec![0u8; 8 * 1024];
    let request = detect_request(&[Part::File {
        name: "image",
        content_type: "image/png",
        bytes: &oversized,
    }]);

    let (status, body) = send(app, request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "invalid_input");
}

#[tokio::test]
async fn detect_reports_model_load_failure() {
    let png = png_bytes(16, 16);
    let request = detect_request(&[Part::File {
        name: "image",
        content_type: "image/png",
        bytes: &png,
    }]);

    let (status, body) = send(broken_app(), request).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["detail"]
        .as_str()
        .unwrap()
        .starts_with("Failed to load YOLO model"));
}

#[tokio::test]
async fn health_reports_loaded_model() {
    let (status, body) = send(app(), get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["model_loaded"], true);
    assert_eq!(body["device"], "cpu");
    assert!(body.get("detail").is_none());
}

#[tokio::test]
async fn health_reports_load_failure() {
    let (status, body) = send(broken_app(), get("/health")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    assert_eq!(body["model_loaded"], false);
    assert!(body["detail"].as_str().unwrap().contains("missing.onnx"));
}

#[tokio::test]
async fn model_info_lists_classes_by_index() {
    let (status, body) = send(app(), get("/model-info")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["device"], "cpu");
    assert_eq!(body["model_path"], "yolov8n.onnx");
    assert!((body["confidence_threshold"].as_f64().unwrap() - 0.25).abs() < 1e-6);
    assert_eq!(body["classes"]["0"], "person");
    assert_eq!(body["classes"]["1"], "dog");
}

#[tokio::test]
async fn model_info_reports_load_failure() {
    let (status, body) = send(broken_app(), get("/model-info")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "model_unavailable");
}

#[tokio::test]
async fn metrics_are_exposed_as_prometheus_text() {
    let app = app();
    let response = app.clone().oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("requests_total"));
}

#[tokio::test]
async fn server_stops_on_shutdown_signal() {
    let config = ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    };
    let server = HttpServer::new(app(), &config).await.unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(server.run(async {
        let _ = shutdown_rx.await;
    }));
    shutdown_tx.send(()).unwrap();

    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
