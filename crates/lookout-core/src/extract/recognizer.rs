//! ArcFace face recognizer via ONNX Runtime.
//!
//! Crops the detected face to a square, resizes it to 112×112 and extracts a
//! 512-dimensional L2-normalized embedding with the w600k_r50 model.

use super::detector::BoundingBox;
use super::{l2_normalize, ExtractError};
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
/// Extra context around the detector box, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.15;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ExtractError> {
        if !model_path.exists() {
            return Err(ExtractError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");

        Ok(Self { session })
    }

    /// Extract the embedding of `face` within `image`.
    pub fn extract(
        &mut self,
        image: &RgbImage,
        face: &BoundingBox,
    ) -> Result<Embedding, ExtractError> {
        let crop = crop_face(image, face);
        let input = preprocess(&crop);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::Inference(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ExtractError::Inference(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let mut values = raw.to_vec();
        if !l2_normalize(&mut values) {
            return Err(ExtractError::Inference("model returned a zero vector".into()));
        }

        Ok(Embedding {
            values,
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// Square crop centred on the box, clamped to the image, resized to 112×112.
fn crop_face(image: &RgbImage, face: &BoundingBox) -> RgbImage {
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let (w, h) = (image.width() as f32, image.height() as f32);
    let x0 = (cx - side / 2.0).clamp(0.0, w - 1.0);
    let y0 = (cy - side / 2.0).clamp(0.0, h - 1.0);
    let x1 = (cx + side / 2.0).clamp(x0 + 1.0, w);
    let y1 = (cy + side / 2.0).clamp(y0 + 1.0, h);

    let view = imageops::crop_imm(
        image,
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    );
    imageops::resize(
        &view.to_image(),
        ARCFACE_INPUT_SIZE,
        ARCFACE_INPUT_SIZE,
        FilterType::Triangle,
    )
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_crop_is_model_sized() {
        let img = RgbImage::from_pixel(300, 200, Rgb([10, 20, 30]));
        let face = BoundingBox { x: 100.0, y: 50.0, width: 60.0, height: 80.0, confidence: 0.9 };
        let crop = crop_face(&img, &face);
        assert_eq!(crop.dimensions(), (ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));
    }

    #[test]
    fn test_crop_clamps_box_outside_image() {
        let img = RgbImage::from_pixel(50, 50, Rgb([200, 200, 200]));
        let face = BoundingBox { x: -30.0, y: 40.0, width: 100.0, height: 100.0, confidence: 0.6 };
        let crop = crop_face(&img, &face);
        assert_eq!(crop.dimensions(), (ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE));
        assert_eq!(crop.get_pixel(0, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_preprocess_normalization_per_channel() {
        let face = RgbImage::from_pixel(112, 112, Rgb([0, 128, 255]));
        let t = preprocess(&face);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 5, 5]] + 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 5, 5]] - 0.5 / 127.5).abs() < 1e-6);
        assert!((t[[0, 2, 5, 5]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceRecognizer::load(Path::new("/nonexistent/w600k_r50.onnx")).err().unwrap();
        assert!(matches!(err, ExtractError::ModelNotFound(_)));
    }
}
