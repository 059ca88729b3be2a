use crate::{
    config::ModelConfig,
    detector::{Detector, DetectorError, Device, RawDetection},
    labels::resolve_labels,
};
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array, ArrayView2, Axis, Ix2, Ix4};
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

fn intersection(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.);
    width * height
}

fn union(box1: &RawDetection, box2: &RawDetection) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn iou(box1: &RawDetection, box2: &RawDetection) -> f32 {
    let union = union(box1, box2);
    if union <= 0. {
        return 0.;
    }
    intersection(box1, box2) / union
}

fn transform_image(image: &RgbImage, input_size: u32) -> Array<f32, Ix4> {
    let side = input_size as usize;
    let img = image::imageops::resize(image, input_size, input_size, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, side, side));
    for (x, y, pixel) in img.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Post-processing parameters for a YOLOv8 detection head.
#[derive(Debug, Clone, Copy)]
pub struct Postprocess {
    pub input_size: u32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Postprocess {
    /// `output` holds one row per anchor: `cx, cy, w, h` in model input
    /// pixels followed by one score per class.
    pub fn extract(
        &self,
        output: ArrayView2<f32>,
        img_width: u32,
        img_height: u32,
        confidence_threshold: f32,
    ) -> Vec<RawDetection> {
        let scale_x = img_width as f32 / self.input_size as f32;
        let scale_y = img_height as f32 / self.input_size as f32;
        let (max_x, max_y) = (img_width as f32, img_height as f32);

        let mut boxes = Vec::new();
        for row in output.axis_iter(Axis(0)) {
            let best = row
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .filter(|(_, prob)| !prob.is_nan())
                .reduce(|accum, item| if item.1 > accum.1 { item } else { accum });

            let Some((class_id, prob)) = best else {
                continue;
            };
            if prob.is_nan() || prob < confidence_threshold {
                continue;
            }

            let xc = row[0] * scale_x;
            let yc = row[1] * scale_y;
            let w = row[2] * scale_x;
            let h = row[3] * scale_y;

            boxes.push(RawDetection {
                class_id,
                confidence: prob,
                x1: (xc - w / 2.).clamp(0., max_x),
                y1: (yc - h / 2.).clamp(0., max_y),
                x2: (xc + w / 2.).clamp(0., max_x),
                y2: (yc + h / 2.).clamp(0., max_y),
            });
        }

        boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));

        let mut result: Vec<RawDetection> = Vec::new();
        for candidate in boxes {
            if result.len() >= self.max_detections {
                break;
            }
            let suppressed = result.iter().any(|kept| {
                kept.class_id == candidate.class_id && iou(kept, &candidate) >= self.iou_threshold
            });
            if !suppressed {
                result.push(candidate);
            }
        }

        result
    }
}

/// YOLOv8 detector backed by a pool of ONNX Runtime sessions.
pub struct OrtDetector {
    sessions: Vec<Mutex<Session>>,
    counter: AtomicUsize,
    class_names: Vec<String>,
    postprocess: Postprocess,
}

impl OrtDetector {
    pub fn new(model_config: &ModelConfig) -> Result<Self, DetectorError> {
        let device: Device = model_config.device.parse()?;
        let class_names = resolve_labels(model_config.labels_file.as_deref())?;
        let model_path = model_config.get_path();

        let load_error = |e: ort::Error| DetectorError::Load {
            path: model_path.display().to_string(),
            reason: e.to_string(),
        };

        let sessions = (0..model_config.num_instances)
            .map(|_| {
                let execution_provider = match device {
                    Device::Cpu => CPUExecutionProvider::default().build(),
                    Device::Cuda(device_id) => CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build()
                        .error_on_failure(),
                };
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_execution_providers([execution_provider])?
                    .commit_from_file(model_path)?;
                Ok(Mutex::new(session))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(load_error)?;

        tracing::info!(
            "Created {} ONNX sessions for {} on {}",
            sessions.len(),
            model_path.display(),
            device
        );

        Ok(Self {
            sessions,
            counter: AtomicUsize::new(0),
            class_names,
            postprocess: Postprocess {
                input_size: model_config.input_size,
                iou_threshold: model_config.iou_threshold,
                max_detections: model_config.max_detections,
            },
        })
    }

    pub fn run_inference(
        &self,
        input: &Array<f32, Ix4>,
    ) -> Result<ndarray::ArrayD<f32>, DetectorError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| DetectorError::Inference(format!("session mutex poisoned: {}", e)))?;

        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| DetectorError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| DetectorError::Inference(format!("inference failed: {}", e)))?;

        let (shape, data) = outputs["output0"]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::Output(format!("failed to extract tensor: {}", e)))?;

        let array = ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| DetectorError::Output(format!("invalid tensor shape: {}", e)))?;

        Ok(array)
    }
}

impl Detector for OrtDetector {
    fn predict(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let input = transform_image(image, self.postprocess.input_size);
        let outputs = self.run_inference(&input)?;

        if outputs.ndim() != 3 || outputs.shape()[0] != 1 || outputs.shape()[1] < 5 {
            return Err(DetectorError::Output(format!(
                "expected a [1, 4 + classes, anchors] tensor, got {:?}",
                outputs.shape()
            )));
        }

        // [1, 4 + classes, anchors] -> [anchors, 4 + classes]
        let output = outputs
            .slice(s![0, .., ..])
            .into_dimensionality::<Ix2>()
            .map_err(|e| DetectorError::Output(format!("invalid tensor rank: {}", e)))?
            .reversed_axes();

        Ok(self.postprocess.extract(
            output,
            image.width(),
            image.height(),
            confidence_threshold,
        ))
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}
