use crate::detector::{Detector, DetectorError};
use std::sync::Arc;
use tokio::sync::OnceCell;

type Loader<D> = dyn Fn() -> Result<D, DetectorError> + Send + Sync;

/// Process-wide handle to the detector, constructed at most once.
///
/// Concurrent first callers wait on the same load. A failed load leaves the
/// handle empty, so the next caller runs the loader again.
pub struct ModelHandle<D: Detector> {
    loader: Arc<Loader<D>>,
    model: Arc<OnceCell<Arc<D>>>,
}

impl<D: Detector> ModelHandle<D> {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<D, DetectorError> + Send + Sync + 'static,
    {
        Self {
            loader: Arc::new(loader),
            model: Arc::new(OnceCell::new()),
        }
    }

    /// A handle around an already constructed detector.
    pub fn loaded(detector: D) -> Self {
        Self {
            loader: Arc::new(|| {
                Err(DetectorError::Inference(
                    "detector was supplied pre-built".to_string(),
                ))
            }),
            model: Arc::new(OnceCell::new_with(Some(Arc::new(detector)))),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// Returns the detector, loading it on the blocking pool if needed.
    ///
    /// The load runs in its own task, so a caller that gives up does not
    /// abandon an initialisation other callers are waiting on.
    pub async fn get(&self) -> Result<Arc<D>, DetectorError> {
        if let Some(model) = self.model.get() {
            return Ok(model.clone());
        }

        let model = self.model.clone();
        let loader = self.loader.clone();
        tokio::spawn(async move {
            model
                .get_or_try_init(|| load(loader))
                .await
                .cloned()
        })
        .await
        .map_err(|e| DetectorError::Load {
            path: String::new(),
            reason: format!("model loader task failed: {}", e),
        })?
    }
}

async fn load<D: Detector>(loader: Arc<Loader<D>>) -> Result<Arc<D>, DetectorError> {
    tracing::info!("Loading detection model");
    let detector = tokio::task::spawn_blocking(move || loader())
        .await
        .map_err(|e| DetectorError::Load {
            path: String::new(),
            reason: format!("model loader task failed: {}", e),
        })?
        .inspect_err(|e| tracing::error!("Failed to load detection model: {}", e))?;
    tracing::info!("Detection model loaded");
    Ok(Arc::new(detector))
}
