use crate::common::config::{EncoderConfig, ModelConfig};
use crate::common::{AttendanceError, Config, Result};
use crate::core::detector::optimization_level;
use crate::core::identity::FaceEncoding;
use crate::core::pipeline::{EncodingModel, FaceBox, FaceEncoder};
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::{Environment, Session, SessionBuilder, Value};
use std::path::Path;
use std::sync::Arc;

/// Face embedding network backed by ONNX Runtime.
pub struct OnnxFaceEncoder {
    small: Option<Session>,
    large: Option<Session>,
    environment: Arc<Environment>,
    models: ModelConfig,
    encoder: EncoderConfig,
}

impl OnnxFaceEncoder {
    pub fn new(config: &Config, models_base: &Path, model: EncodingModel) -> Result<Self> {
        let environment = Arc::new(
            Environment::builder()
                .with_name("face_encoder")
                .build()
                .map_err(|e| AttendanceError::Model(format!("Failed to create environment: {}", e)))?,
        );

        let mut encoder = Self {
            small: None,
            large: None,
            environment,
            models: config.models.clone(),
            encoder: config.encoder.clone(),
        };
        encoder.load_model(model, models_base)?;
        Ok(encoder)
    }

    pub fn load_model(&mut self, model: EncodingModel, models_base: &Path) -> Result<()> {
        let model_path = self.models.encoder_path(model, models_base);
        if !model_path.exists() {
            return Err(AttendanceError::Model(format!(
                "Encoder model ({:?}) not found at: {:?}",
                model, model_path
            )));
        }

        let session = SessionBuilder::new(&self.environment)?
            .with_optimization_level(optimization_level(self.models.optimization_level))?
            .with_model_from_file(&model_path)?;
        tracing::debug!("Loaded {:?} encoder from {:?}", model, model_path);

        match model {
            EncodingModel::Small => self.small = Some(session),
            EncodingModel::Large => self.large = Some(session),
        }
        Ok(())
    }

    fn session(&self, model: EncodingModel) -> Result<&Session> {
        let session = match model {
            EncodingModel::Small => self.small.as_ref(),
            EncodingModel::Large => self.large.as_ref(),
        };
        session.ok_or_else(|| AttendanceError::Model(format!("Encoder model {:?} is not loaded", model)))
    }

    fn embed(&self, session: &Session, image: &DynamicImage, face: &FaceBox) -> Result<FaceEncoding> {
        let size = self.encoder.input_size;
        let crop = crop_face(image, face).resize_exact(size, size, FilterType::Triangle);
        let input = preprocess_face(&crop, size as usize, self.encoder.normalization_value);

        let input = CowArray::from(input.into_dyn());
        let tensor = Value::from_array(session.allocator(), &input)?;
        let outputs = session.run(vec![tensor])?;

        let output = outputs
            .first()
            .ok_or_else(|| AttendanceError::Model("Encoder produced no output".into()))?;
        let embedding = output.try_extract::<f32>()?.view().to_owned().into_raw_vec();
        Ok(FaceEncoding::from(embedding))
    }
}

impl FaceEncoder for OnnxFaceEncoder {
    fn encode(&self, image: &DynamicImage, faces: &[FaceBox], model: EncodingModel) -> Result<Vec<FaceEncoding>> {
        let session = self.session(model)?;
        faces.iter().map(|face| self.embed(session, image, face)).collect()
    }
}

/// Crops a box out of `image`, clamped to the image bounds.
pub fn crop_face(image: &DynamicImage, face: &FaceBox) -> DynamicImage {
    let max_x = image.width().saturating_sub(1);
    let max_y = image.height().saturating_sub(1);
    let x = (face.x1.max(0.0) as u32).min(max_x);
    let y = (face.y1.max(0.0) as u32).min(max_y);
    let width = (face.width().max(1.0) as u32).clamp(1, image.width() - x);
    let height = (face.height().max(1.0) as u32).clamp(1, image.height() - y);
    image.crop_imm(x, y, width, height)
}

fn preprocess_face(image: &DynamicImage, size: usize, norm: f32) -> Array4<f32> {
    let gray = image.to_luma8();
    let mut array = Array4::<f32>::zeros((1, 1, size, size));
    for (x, y, pixel) in gray.enumerate_pixels() {
        array[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - norm) / norm;
    }
    array
}
