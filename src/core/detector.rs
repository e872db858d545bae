use crate::common::config::{DetectorConfig, ModelConfig};
use crate::common::{AttendanceError, Config, Result};
use crate::core::pipeline::{DetectionModel, FaceBox, FaceLocator};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MIN_BOX_SIDE: f32 = 10.0;

/// YOLO-style face detector backed by ONNX Runtime, one session per
/// detection model that has been loaded.
pub struct OnnxFaceLocator {
    fast: Option<Session>,
    accurate: Option<Session>,
    environment: Arc<Environment>,
    models: ModelConfig,
    detector: DetectorConfig,
}

impl OnnxFaceLocator {
    /// Loads the session for `model`; others can be added with [`load_model`].
    ///
    /// [`load_model`]: OnnxFaceLocator::load_model
    pub fn new(config: &Config, models_base: &Path, model: DetectionModel) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_locator")
                .build()
                .map_err(|e| AttendanceError::Model(format!("Failed to create environment: {}", e)))?,
        );

        let mut locator = Self {
            fast: None,
            accurate: None,
            environment,
            models: config.models.clone(),
            detector: config.detector.clone(),
        };
        locator.load_model(model, models_base)?;
        Ok(locator)
    }

    pub fn load_model(&mut self, model: DetectionModel, models_base: &Path) -> Result<()> {
        let model_path = self.models.detector_path(model, models_base);
        if !model_path.exists() {
            return Err(AttendanceError::Model(format!(
                "Detector model ({:?}) not found at: {:?}",
                model, model_path
            )));
        }

        let session = SessionBuilder::new(&self.environment)?
            .with_optimization_level(optimization_level(self.models.optimization_level))?
            .with_model_from_file(&model_path)?;
        tracing::debug!("Loaded {:?} detector from {:?}", model, model_path);

        match model {
            DetectionModel::Fast => self.fast = Some(session),
            DetectionModel::Accurate => self.accurate = Some(session),
        }
        Ok(())
    }

    fn session(&self, model: DetectionModel) -> Result<&Session> {
        let session = match model {
            DetectionModel::Fast => self.fast.as_ref(),
            DetectionModel::Accurate => self.accurate.as_ref(),
        };
        session.ok_or_else(|| AttendanceError::Model(format!("Detector model {:?} is not loaded", model)))
    }

    fn image_to_array(&self, image: &DynamicImage) -> Array4<f32> {
        let (width, height) = (self.detector.input_width, self.detector.input_height);
        let gray = if image.width() == width && image.height() == height {
            image.to_luma8()
        } else {
            image.resize_exact(width, height, FilterType::Nearest).to_luma8()
        };

        let (w, h) = (width as usize, height as usize);
        let raw = gray.as_raw();
        let mut array = Array4::<f32>::zeros((1, 3, h, w));
        for y in 0..h {
            for x in 0..w {
                let value = raw[y * w + x] as f32 / 255.0;
                array[[0, 0, y, x]] = value;
                array[[0, 1, y, x]] = value;
                array[[0, 2, y, x]] = value;
            }
        }
        array
    }
}

impl FaceLocator for OnnxFaceLocator {
    fn locate(&self, image: &DynamicImage, model: DetectionModel) -> Result<Vec<FaceBox>> {
        let session = self.session(model)?;

        let input = CowArray::from(self.image_to_array(image).into_dyn());
        let tensor = Value::from_array(session.allocator(), &input)?;
        let outputs = session.run(vec![tensor])?;

        let Some(first) = outputs.first() else {
            return Ok(Vec::new());
        };
        let output = first.try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let data = output.into_raw_vec();

        let mut faces = parse_predictions(&data, &shape, &self.detector);
        faces = apply_nms(faces, NMS_IOU_THRESHOLD);
        faces.retain(|face| face.confidence >= self.detector.confidence_threshold);
        faces.truncate(self.detector.max_faces);

        // back to the caller's pixel space
        let scale_x = image.width() as f32 / self.detector.input_width as f32;
        let scale_y = image.height() as f32 / self.detector.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        Ok(faces)
    }
}

pub(crate) fn optimization_level(level: u32) -> GraphOptimizationLevel {
    match level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

/// Decodes `[1, N, 5]` or transposed `[1, 5, N]` predictions of
/// `(cx, cy, w, h, conf)` into corner boxes in detector input pixels.
pub fn parse_predictions(data: &[f32], shape: &[usize], config: &DetectorConfig) -> Vec<FaceBox> {
    let (count, stride, transposed) = match shape {
        [_, a, b] if b > a && *a <= 10 => (*b, *a, true),
        [_, a, b] => (*a, *b, false),
        [a, b] => (*a, *b, false),
        _ => {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Vec::new();
        }
    };
    if stride < 4 || data.len() < count * stride {
        tracing::warn!("Detector output too short for shape {:?}", shape);
        return Vec::new();
    }

    let field = |i: usize, f: usize| -> f32 {
        if f >= stride {
            return 0.0;
        }
        if transposed {
            data[f * count + i]
        } else {
            data[i * stride + f]
        }
    };

    let input_w = config.input_width as f32;
    let input_h = config.input_height as f32;
    let mut faces = Vec::new();

    for i in 0..count {
        let confidence = field(i, 4);
        if confidence <= 0.001 {
            continue;
        }

        let (mut cx, mut cy, mut w, mut h) = (field(i, 0), field(i, 1), field(i, 2), field(i, 3));
        // normalized output
        if cx <= 1.0 && cy <= 1.0 && w <= 1.0 && h <= 1.0 {
            cx *= input_w;
            cy *= input_h;
            w *= input_w;
            h *= input_h;
        }

        let x1 = (cx - w / 2.0).max(0.0);
        let y1 = (cy - h / 2.0).max(0.0);
        let x2 = (cx + w / 2.0).min(input_w);
        let y2 = (cy + h / 2.0).min(input_h);

        if x2 - x1 > MIN_BOX_SIDE && y2 - y1 > MIN_BOX_SIDE {
            faces.push(FaceBox { x1, y1, x2, y2, confidence });
        }
    }

    faces
}

/// Greedy non-maximum suppression; the result is sorted by confidence.
pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

pub fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width() * a.height() + b.width() * b.height() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, confidence }
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(20.0, 20.0, 30.0, 30.0, 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_nms_drops_overlapping_weaker_box() {
        let boxes = vec![
            face(0.0, 0.0, 100.0, 100.0, 0.7),
            face(2.0, 2.0, 102.0, 102.0, 0.9),
            face(300.0, 300.0, 400.0, 400.0, 0.8),
        ];
        let kept = apply_nms(boxes, NMS_IOU_THRESHOLD);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.8);
    }

    #[test]
    fn test_parse_standard_layout_pixels() {
        let config = DetectorConfig::default();
        // six predictions, only the first above the noise floor
        let mut data = vec![0.0f32; 6 * 5];
        data[..5].copy_from_slice(&[100.0, 100.0, 40.0, 60.0, 0.95]);
        data[5..10].copy_from_slice(&[50.0, 50.0, 40.0, 40.0, 0.0]);
        let faces = parse_predictions(&data, &[1, 6, 5], &config);
        assert_eq!(faces, vec![face(80.0, 70.0, 120.0, 130.0, 0.95)]);
    }

    #[test]
    fn test_parse_transposed_normalized() {
        let config = DetectorConfig::default();
        let count = 20;
        let mut data = vec![0.0f32; 5 * count];
        // prediction 3: centred, quarter of the input each way
        data[3] = 0.5;
        data[count + 3] = 0.5;
        data[2 * count + 3] = 0.25;
        data[3 * count + 3] = 0.25;
        data[4 * count + 3] = 0.8;

        let faces = parse_predictions(&data, &[1, 5, count], &config);
        assert_eq!(faces.len(), 1);
        let w = config.input_width as f32;
        assert!((faces[0].x1 - w * 0.375).abs() < 1e-3);
        assert!((faces[0].x2 - w * 0.625).abs() < 1e-3);
    }

    #[test]
    fn test_parse_skips_tiny_boxes_and_bad_shapes() {
        let config = DetectorConfig::default();
        let mut data = vec![0.0f32; 6 * 5];
        data[..5].copy_from_slice(&[100.0, 100.0, 4.0, 4.0, 0.9]);
        assert!(parse_predictions(&data, &[1, 6, 5], &config).is_empty());
        assert!(parse_predictions(&data, &[30], &config).is_empty());
        // declared larger than the buffer
        assert!(parse_predictions(&data, &[1, 5, 100], &config).is_empty());
    }
}
