//! Model-free image descriptor.
//!
//! Builds a 512-dim vector from colour histograms, a coarse spatial grid and
//! gradient statistics of a 224×224 resize. It needs no model files, which
//! makes it useful for tests and small deployments, but it does not locate
//! faces: any decodable photo with some contrast yields an embedding. A flat
//! frame (no gradient energy) is reported as having no face.

use super::{decode_image, l2_normalize, EmbeddingExtractor, ExtractError};
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;

pub const HISTOGRAM_EMBEDDING_DIM: usize = 512;
pub const HISTOGRAM_MODEL_VERSION: &str = "histogram-v1";

const RESIZE: u32 = 224;
const HIST_BINS: usize = 32;
/// Only the lower half of each channel histogram is kept.
const HIST_BINS_KEPT: usize = 16;
const GRID: u32 = 8;
/// Minimum gradient spread for a frame to count as having content.
const MIN_CONTRAST: f32 = 1e-3;

#[derive(Debug, Default)]
pub struct HistogramExtractor;

impl HistogramExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl EmbeddingExtractor for HistogramExtractor {
    fn dimension(&self) -> usize {
        HISTOGRAM_EMBEDDING_DIM
    }

    fn model_version(&self) -> &str {
        HISTOGRAM_MODEL_VERSION
    }

    fn extract(&mut self, image_bytes: &[u8]) -> Result<Embedding, ExtractError> {
        let rgb = decode_image(image_bytes)?.to_rgb8();
        let (mut values, contrast) = describe(&rgb);

        if contrast < MIN_CONTRAST || !l2_normalize(&mut values) {
            tracing::debug!(contrast, "histogram: flat frame rejected");
            return Err(ExtractError::NoFaceDetected { faces: 0 });
        }

        Ok(Embedding {
            values,
            model_version: Some(HISTOGRAM_MODEL_VERSION.to_string()),
        })
    }
}

/// Raw (unnormalized) feature vector, zero-padded to the embedding size,
/// plus the summed gradient standard deviation of the grayscale frame.
fn describe(image: &RgbImage) -> (Vec<f32>, f32) {
    let img = imageops::resize(image, RESIZE, RESIZE, FilterType::Triangle);
    let size = RESIZE as usize;

    // Pixels scaled to [0, 1], channel-major.
    let mut channels = vec![vec![0.0f32; size * size]; 3];
    for (x, y, px) in img.enumerate_pixels() {
        let i = y as usize * size + x as usize;
        for c in 0..3 {
            channels[c][i] = px[c] as f32 / 255.0;
        }
    }

    let mut features = Vec::with_capacity(HISTOGRAM_EMBEDDING_DIM);

    for channel in &channels {
        let mut hist = [0.0f32; HIST_BINS];
        for &v in channel {
            let bin = ((v * HIST_BINS as f32) as usize).min(HIST_BINS - 1);
            hist[bin] += 1.0;
        }
        let total: f32 = hist.iter().sum::<f32>() + 1e-8;
        features.extend(hist[..HIST_BINS_KEPT].iter().map(|h| h / total));
    }

    let cell = size / GRID as usize;
    for gy in 0..GRID as usize {
        for gx in 0..GRID as usize {
            let mut patch = Vec::with_capacity(cell * cell * 3);
            for y in gy * cell..(gy + 1) * cell {
                for x in gx * cell..(gx + 1) * cell {
                    for channel in &channels {
                        patch.push(channel[y * size + x]);
                    }
                }
            }
            let (mean, std) = mean_std(&patch);
            features.push(mean);
            features.push(std);
        }
    }

    let gray: Vec<f32> = (0..size * size)
        .map(|i| (channels[0][i] + channels[1][i] + channels[2][i]) / 3.0)
        .collect();
    let mut grad_x = Vec::with_capacity(size * (size - 1));
    let mut grad_y = Vec::with_capacity(size * (size - 1));
    for y in 0..size {
        for x in 0..size {
            let v = gray[y * size + x];
            if x + 1 < size {
                grad_x.push(gray[y * size + x + 1] - v);
            }
            if y + 1 < size {
                grad_y.push(gray[(y + 1) * size + x] - v);
            }
        }
    }
    let (gx_mean, gx_std) = mean_std(&grad_x);
    let (gy_mean, gy_std) = mean_std(&grad_y);
    features.extend([gx_mean, gx_std, gy_mean, gy_std]);

    features.resize(HISTOGRAM_EMBEDDING_DIM, 0.0);
    (features, gx_std + gy_std)
}

fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::test_images;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_embedding_has_fixed_dimension_and_unit_norm() {
        let bytes = test_images::png(&test_images::square([220, 180, 40]));
        let emb = HistogramExtractor::new().extract(&bytes).unwrap();

        assert_eq!(emb.dimension(), HISTOGRAM_EMBEDDING_DIM);
        assert_eq!(emb.model_version.as_deref(), Some(HISTOGRAM_MODEL_VERSION));
        let norm: f32 = emb.values.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm = {norm}");
    }

    #[test]
    fn test_same_photo_same_embedding() {
        let bytes = test_images::png(&test_images::square([10, 200, 90]));
        let mut ex = HistogramExtractor::new();
        let a = ex.extract(&bytes).unwrap();
        let b = ex.extract(&bytes).unwrap();
        assert_eq!(a.euclidean_distance(&b), 0.0);
    }

    #[test]
    fn test_different_photos_differ() {
        let mut ex = HistogramExtractor::new();
        let a = ex
            .extract(&test_images::png(&test_images::square([250, 250, 250])))
            .unwrap();
        let b = ex
            .extract(&test_images::png(&test_images::square([5, 5, 120])))
            .unwrap();
        assert!(a.euclidean_distance(&b) > 0.01);
    }

    #[test]
    fn test_flat_frame_is_rejected() {
        let black = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        let err = HistogramExtractor::new()
            .extract(&test_images::png(&black))
            .unwrap_err();
        assert!(matches!(err, ExtractError::NoFaceDetected { faces: 0 }));
    }

    #[test]
    fn test_raw_descriptor_layout() {
        let grey = RgbImage::from_pixel(50, 50, Rgb([128, 128, 128]));
        let (f, contrast) = describe(&grey);
        assert_eq!(contrast, 0.0);
        assert_eq!(f.len(), HISTOGRAM_EMBEDDING_DIM);
        // 48 histogram values + 128 grid values + 4 gradient values, then padding.
        assert!(f[180..].iter().all(|&v| v == 0.0));
        // Uniform image: zero spread in every grid cell.
        assert!(f[48..176].chunks(2).all(|ms| ms[1].abs() < 1e-6));
    }
}
