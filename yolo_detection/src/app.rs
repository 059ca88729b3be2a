use crate::{
    annotator::Annotator,
    config::Config,
    font::LabelFont,
    model_handle::ModelHandle,
    ort_service::OrtDetector,
    server::{create_app, HttpServer, SharedState},
    service::{DetectionService, ServiceOptions},
    telemetry::Metrics,
};
use tokio::signal;

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let model_config = config.model.clone();
    let model = ModelHandle::new(move || OrtDetector::new(&model_config));

    let font = match LabelFont::load(
        config.annotation.font_path.as_deref(),
        config.annotation.font_size,
    ) {
        Ok(font) => font,
        Err(e) => {
            tracing::error!("Failed to load label font: {:?}", e);
            return Err(e.into());
        }
    };

    let detection_service = DetectionService::new(
        model,
        Annotator::new(font),
        ServiceOptions::from_config(&config),
    );

    if config.model.preload {
        if let Err(e) = detection_service.model().get().await {
            tracing::error!(
                "Failed to preload model, requests will retry the load: {}",
                e
            );
        }
    }

    let metrics = Metrics::new()?;
    let state = SharedState::new(detection_service, metrics);
    let router = create_app(state, config.server.max_upload_bytes);

    let server = HttpServer::new(router, &config.server).await?;

    server
        .run(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown.");
        })
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
