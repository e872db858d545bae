//! Seams to the collaborators the session loop drives: frame source, face
//! locator, face encoder, comparator and preview.

use crate::common::Result;
use crate::core::identity::{FaceEncoding, Identity};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Face bounding box in pixel coordinates of the image it was found in.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn scaled(&self, factor: f32) -> FaceBox {
        FaceBox {
            x1: self.x1 * factor,
            y1: self.y1 * factor,
            x2: self.x2 * factor,
            y2: self.y2 * factor,
            confidence: self.confidence,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DetectionModel {
    #[default]
    #[serde(alias = "hog")]
    Fast,
    #[serde(alias = "cnn")]
    Accurate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EncodingModel {
    #[default]
    Small,
    Large,
}

pub trait VideoSource {
    /// Next frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<DynamicImage>>;

    fn release(&mut self);
}

pub trait FaceLocator {
    fn locate(&self, image: &DynamicImage, model: DetectionModel) -> Result<Vec<FaceBox>>;
}

pub trait FaceEncoder {
    /// One encoding per box, in box order.
    fn encode(&self, image: &DynamicImage, faces: &[FaceBox], model: EncodingModel) -> Result<Vec<FaceEncoding>>;
}

pub trait FaceComparator {
    /// Match flag per candidate, same length and order as `candidates`.
    fn compare(&self, candidates: &[FaceEncoding], query: &FaceEncoding) -> Vec<bool>;
}

pub trait PreviewRenderer {
    /// Shows one annotated frame; returns `true` when the user asked to quit.
    fn render(&mut self, frame: &DynamicImage, faces: &[FaceBox], identities: &[Identity]) -> Result<bool>;

    fn close(&mut self);
}
