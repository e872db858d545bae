use crate::common::Result;
use crate::core::identity::Identity;
use crate::core::pipeline::{FaceBox, PreviewRenderer};
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::fs;
use std::path::PathBuf;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

/// Headless preview: frames with faces are annotated and written as JPEGs.
pub struct SnapshotPreview {
    output_dir: PathBuf,
    frame: u64,
    saved: u64,
}

impl SnapshotPreview {
    pub fn new(output_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir, frame: 0, saved: 0 })
    }

    pub fn saved(&self) -> u64 {
        self.saved
    }
}

impl PreviewRenderer for SnapshotPreview {
    fn render(&mut self, frame: &DynamicImage, faces: &[FaceBox], identities: &[Identity]) -> Result<bool> {
        self.frame += 1;
        if faces.is_empty() {
            return Ok(false);
        }

        let annotated = annotate(frame, faces, identities);
        let path = self.output_dir.join(format!("frame_{:06}.jpg", self.frame));
        annotated.save(&path)?;
        self.saved += 1;

        let labels: Vec<&str> = identities.iter().map(Identity::label).collect();
        tracing::debug!("Saved {:?} [{}]", path, labels.join(", "));
        Ok(false)
    }

    fn close(&mut self) {
        if self.saved > 0 {
            tracing::info!("Saved {} annotated frame(s) to {:?}", self.saved, self.output_dir);
        }
    }
}

/// Green boxes for identified students, red for unknown faces.
pub fn annotate(frame: &DynamicImage, faces: &[FaceBox], identities: &[Identity]) -> RgbImage {
    let mut img = frame.to_rgb8();
    let (width, height) = (img.width() as f32, img.height() as f32);

    for (i, face) in faces.iter().enumerate() {
        let x1 = face.x1.clamp(0.0, width - 1.0) as i32;
        let y1 = face.y1.clamp(0.0, height - 1.0) as i32;
        let x2 = face.x2.clamp(0.0, width) as i32;
        let y2 = face.y2.clamp(0.0, height) as i32;
        if x2 <= x1 || y2 <= y1 {
            continue;
        }

        let color = match identities.get(i) {
            Some(Identity::Known(_)) => KNOWN_COLOR,
            _ => UNKNOWN_COLOR,
        };
        let rect = Rect::at(x1, y1).of_size((x2 - x1) as u32, (y2 - y1) as u32);
        draw_hollow_rect_mut(&mut img, rect, color);
    }

    img
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::StudentId;

    fn face(x1: f32, y1: f32, x2: f32, y2: f32) -> FaceBox {
        FaceBox { x1, y1, x2, y2, confidence: 0.9 }
    }

    #[test]
    fn test_annotate_colors_by_identity() {
        let frame = DynamicImage::new_rgb8(50, 50);
        let known = Identity::Known(StudentId::new("1001").unwrap());
        let img = annotate(
            &frame,
            &[face(5.0, 5.0, 20.0, 20.0), face(30.0, 30.0, 45.0, 45.0)],
            &[known, Identity::Unknown],
        );

        assert_eq!(*img.get_pixel(5, 5), KNOWN_COLOR);
        assert_eq!(*img.get_pixel(30, 30), UNKNOWN_COLOR);
        assert_eq!(*img.get_pixel(10, 10), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_annotate_skips_degenerate_boxes() {
        let frame = DynamicImage::new_rgb8(10, 10);
        let img = annotate(&frame, &[face(8.0, 8.0, 2.0, 2.0)], &[Identity::Unknown]);
        assert!(img.pixels().all(|p| *p == Rgb([0, 0, 0])));
    }

    #[test]
    fn test_only_frames_with_faces_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut preview = SnapshotPreview::new(dir.path().join("captures")).unwrap();
        let frame = DynamicImage::new_rgb8(32, 32);

        assert!(!preview.render(&frame, &[], &[]).unwrap());
        assert!(!preview.render(&frame, &[face(2.0, 2.0, 20.0, 20.0)], &[Identity::Unknown]).unwrap());
        preview.close();

        assert_eq!(preview.saved(), 1);
        assert!(dir.path().join("captures/frame_000002.jpg").exists());
    }
}
