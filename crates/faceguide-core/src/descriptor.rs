//! ArcFace descriptor extraction.
//!
//! The face is aligned by its eye pair onto the canonical 112×112 ArcFace
//! template, then embedded and L2-normalized.

use crate::detector::DetectorError;
use crate::types::{Descriptor, Point};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_DESCRIPTOR_LEN: usize = 512;

/// Template eye positions in the 112×112 crop.
const TEMPLATE_LEFT_EYE: Point = Point::new(38.2946, 51.6963);
const TEMPLATE_RIGHT_EYE: Point = Point::new(73.5318, 51.5014);

pub struct ArcFaceEncoder {
    session: Session,
}

impl ArcFaceEncoder {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = model_path, "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Embed the face whose five landmarks are given.
    pub fn encode(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        landmarks: &[Point],
    ) -> Result<Descriptor, DetectorError> {
        let [left, right, ..] = landmarks else {
            return Err(DetectorError::InferenceFailed(
                "descriptor extraction needs eye landmarks".into(),
            ));
        };
        if pixels.len() < (width * height) as usize {
            return Err(DetectorError::InvalidFrame { width, height });
        }

        let crop = align_by_eyes(pixels, width as usize, height as usize, *left, *right);
        let input = to_tensor(&crop);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("descriptor: {e}")))?;

        if raw.len() != ARCFACE_DESCRIPTOR_LEN {
            return Err(DetectorError::InferenceFailed(format!(
                "expected {ARCFACE_DESCRIPTOR_LEN}-dim descriptor, got {}",
                raw.len()
            )));
        }
        Ok(Descriptor(l2_normalize(raw)))
    }
}

/// Warp the frame so the detected eyes land on the template eyes.
///
/// Two point pairs fix a similarity transform exactly; treating points as
/// complex numbers, `dst = m·(src − L) + L'` with `m = (R' − L') / (R − L)`.
/// Each output pixel is sampled through the inverse map.
fn align_by_eyes(pixels: &[u8], width: usize, height: usize, left: Point, right: Point) -> Vec<u8> {
    let size = ARCFACE_INPUT_SIZE;
    let mut out = vec![0u8; size * size];

    let (vx, vy) = (right.x - left.x, right.y - left.y);
    let (ux, uy) = (
        TEMPLATE_RIGHT_EYE.x - TEMPLATE_LEFT_EYE.x,
        TEMPLATE_RIGHT_EYE.y - TEMPLATE_LEFT_EYE.y,
    );
    // inverse of m = v / u
    let denom = ux * ux + uy * uy;
    if vx * vx + vy * vy < 1e-6 || denom < 1e-6 {
        return out;
    }
    let ia = (vx * ux + vy * uy) / denom;
    let ib = (vy * ux - vx * uy) / denom;

    for oy in 0..size {
        for ox in 0..size {
            let dx = ox as f32 - TEMPLATE_LEFT_EYE.x;
            let dy = oy as f32 - TEMPLATE_LEFT_EYE.y;
            let sx = left.x + ia * dx - ib * dy;
            let sy = left.y + ib * dx + ia * dy;
            out[oy * size + ox] = sample_bilinear(pixels, width, height, sx, sy);
        }
    }
    out
}

/// Bilinear sample with black outside the frame.
fn sample_bilinear(pixels: &[u8], width: usize, height: usize, x: f32, y: f32) -> u8 {
    let x0 = x.floor();
    let y0 = y.floor();
    let (fx, fy) = (x - x0, y - y0);
    let at = |xi: f32, yi: f32| -> f32 {
        if xi < 0.0 || yi < 0.0 || xi >= width as f32 || yi >= height as f32 {
            0.0
        } else {
            pixels[yi as usize * width + xi as usize] as f32
        }
    };
    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1.0, y0) * fx;
    let bottom = at(x0, y0 + 1.0) * (1.0 - fx) + at(x0 + 1.0, y0 + 1.0) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

/// Grayscale crop → normalized NCHW tensor with the channel replicated.
fn to_tensor(crop: &[u8]) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    Array4::from_shape_fn((1, 3, size, size), |(_, _, y, x)| {
        (crop[y * size + x] as f32 - ARCFACE_MEAN) / ARCFACE_STD
    })
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_maps_eyes_onto_template() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h];
        let left = Point::new(80.0, 60.0);
        let right = Point::new(120.0, 60.0);
        // Bright 5x5 patch on the left eye.
        for y in 58..63 {
            for x in 78..83 {
                frame[y * w + x] = 255;
            }
        }

        let crop = align_by_eyes(&frame, w, h, left, right);
        let tx = TEMPLATE_LEFT_EYE.x.round() as usize;
        let ty = TEMPLATE_LEFT_EYE.y.round() as usize;
        assert!(crop[ty * ARCFACE_INPUT_SIZE + tx] > 100);
        // Far corner of the crop is outside the patch.
        assert_eq!(crop[0], 0);
    }

    #[test]
    fn test_alignment_degenerate_eyes() {
        let frame = vec![200u8; 50 * 50];
        let p = Point::new(25.0, 25.0);
        let crop = align_by_eyes(&frame, 50, 50, p, p);
        assert!(crop.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_sample_bilinear_outside_is_black() {
        let frame = vec![255u8; 4];
        assert_eq!(sample_bilinear(&frame, 2, 2, -5.0, 0.0), 0);
        assert_eq!(sample_bilinear(&frame, 2, 2, 0.0, 0.0), 255);
    }

    #[test]
    fn test_to_tensor_normalizes_and_replicates() {
        let crop = vec![255u8; ARCFACE_INPUT_SIZE * ARCFACE_INPUT_SIZE];
        let t = to_tensor(&crop);
        assert_eq!(t.shape(), &[1, 3, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE]);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert_eq!(t[[0, 0, 5, 5]], t[[0, 2, 5, 5]]);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
