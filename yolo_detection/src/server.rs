use crate::{
    config::ServerConfig, detector::Detector, routes::api_routes, service::DetectionService,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::{future::Future, sync::Arc};
use tokio::net::TcpListener;

pub struct SharedState<D: Detector> {
    pub detection_service: Arc<DetectionService<D>>,
    pub metrics: Arc<Metrics>,
}

impl<D: Detector> Clone for SharedState<D> {
    fn clone(&self) -> Self {
        Self {
            detection_service: self.detection_service.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<D: Detector> SharedState<D> {
    pub fn new(detection_service: DetectionService<D>, metrics: Metrics) -> Self {
        Self {
            detection_service: Arc::new(detection_service),
            metrics: Arc::new(metrics),
        }
    }
}

pub fn create_app<D: Detector>(state: SharedState<D>, max_upload_bytes: usize) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(router: Router, config: &ServerConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.get_address()).await?;
        Ok(Self { router, listener })
    }

    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
