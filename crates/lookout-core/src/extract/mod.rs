//! Embedding extraction: photo bytes → fixed-length face embedding.
//!
//! A single capability ([`EmbeddingExtractor`]) with swappable backends.
//! The backend is picked once from configuration via [`build_extractor`];
//! nothing branches on model availability at call time.

pub mod detector;
pub mod histogram;
pub mod recognizer;

use crate::types::Embedding;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub use detector::FaceDetector;
pub use histogram::HistogramExtractor;
pub use recognizer::FaceRecognizer;

/// Largest accepted photo upload.
pub const MAX_IMAGE_BYTES: usize = 16 * 1024 * 1024;

const ACCEPTED_FORMATS: [ImageFormat; 4] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Gif,
    ImageFormat::WebP,
];

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("image is empty")]
    EmptyImage,
    #[error("image too large: {0} bytes (max {MAX_IMAGE_BYTES})")]
    TooLarge(usize),
    #[error("unsupported image format (accepted: png, jpeg, gif, webp)")]
    UnsupportedFormat,
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("no single face detected (found {faces})")]
    NoFaceDetected { faces: usize },
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a photo into a face embedding.
///
/// Implementations must return embeddings of exactly [`dimension`](Self::dimension)
/// values and must fail with `NoFaceDetected` rather than guess when the
/// photo holds zero or several faces.
pub trait EmbeddingExtractor: Send {
    fn dimension(&self) -> usize;
    fn model_version(&self) -> &str;
    fn extract(&mut self, image_bytes: &[u8]) -> Result<Embedding, ExtractError>;
}

/// Which extractor implementation to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// SCRFD detection + ArcFace recognition through ONNX Runtime.
    Onnx,
    /// Model-free colour/texture descriptor. No real face detection.
    Histogram,
}

impl Backend {
    /// Embedding dimensionality the backend produces.
    pub fn dimension(&self) -> usize {
        match self {
            Backend::Onnx => recognizer::ARCFACE_EMBEDDING_DIM,
            Backend::Histogram => histogram::HISTOGRAM_EMBEDDING_DIM,
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(Backend::Onnx),
            "histogram" => Ok(Backend::Histogram),
            other => Err(format!("unknown extractor backend: {other}")),
        }
    }
}

/// Instantiate the configured backend. ONNX models are loaded eagerly so a
/// missing file fails at startup, not on the first request.
pub fn build_extractor(
    backend: Backend,
    model_dir: &Path,
) -> Result<Box<dyn EmbeddingExtractor>, ExtractError> {
    match backend {
        Backend::Onnx => {
            let extractor = OnnxExtractor::load(
                &model_dir.join(detector::SCRFD_MODEL_FILE),
                &model_dir.join(recognizer::ARCFACE_MODEL_FILE),
            )?;
            Ok(Box::new(extractor))
        }
        Backend::Histogram => Ok(Box::new(HistogramExtractor::new())),
    }
}

/// Validate size and format, then decode.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::EmptyImage);
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(ExtractError::TooLarge(bytes.len()));
    }
    let format = accepted_format(bytes)?;
    Ok(image::load_from_memory_with_format(bytes, format)?)
}

/// Preferred file extension for an accepted photo (e.g. "png", "jpg").
pub fn image_extension(bytes: &[u8]) -> Result<&'static str, ExtractError> {
    let format = accepted_format(bytes)?;
    format
        .extensions_str()
        .first()
        .copied()
        .ok_or(ExtractError::UnsupportedFormat)
}

fn accepted_format(bytes: &[u8]) -> Result<ImageFormat, ExtractError> {
    let format = image::guess_format(bytes).map_err(|_| ExtractError::UnsupportedFormat)?;
    if ACCEPTED_FORMATS.contains(&format) {
        Ok(format)
    } else {
        Err(ExtractError::UnsupportedFormat)
    }
}

/// L2-normalize in place. Returns false if the vector has zero norm.
pub(crate) fn l2_normalize(values: &mut [f32]) -> bool {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
        true
    } else {
        false
    }
}

/// Detector + recognizer pipeline. Exactly one face must survive NMS.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn load(scrfd_path: &Path, arcface_path: &Path) -> Result<Self, ExtractError> {
        let detector = FaceDetector::load(scrfd_path)?;
        let recognizer = FaceRecognizer::load(arcface_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl EmbeddingExtractor for OnnxExtractor {
    fn dimension(&self) -> usize {
        recognizer::ARCFACE_EMBEDDING_DIM
    }

    fn model_version(&self) -> &str {
        recognizer::ARCFACE_MODEL_VERSION
    }

    fn extract(&mut self, image_bytes: &[u8]) -> Result<Embedding, ExtractError> {
        let rgb = decode_image(image_bytes)?.to_rgb8();
        let faces = self.detector.detect(&rgb)?;

        tracing::debug!(
            faces = faces.len(),
            width = rgb.width(),
            height = rgb.height(),
            "onnx: detection finished"
        );

        match faces.as_slice() {
            [face] => self.recognizer.extract(&rgb, face),
            _ => Err(ExtractError::NoFaceDetected { faces: faces.len() }),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_images {
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Encode `img` as PNG bytes.
    pub fn png(img: &RgbImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// A 64×64 image with a bright square on a mid-grey background.
    pub fn square(fg: [u8; 3]) -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            if (16..48).contains(&x) && (16..48).contains(&y) {
                Rgb(fg)
            } else {
                Rgb([90, 90, 90])
            }
        })
    }
}
