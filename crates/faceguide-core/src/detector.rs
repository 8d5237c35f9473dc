//! Detector boundary and the SCRFD + ArcFace ONNX adapter.
//!
//! The capture loop only sees [`Detector`]. [`OnnxDetector`] is the
//! production implementation: SCRFD finds the face and its five landmarks,
//! ArcFace turns an eye-aligned crop into the descriptor.

use crate::descriptor::ArcFaceEncoder;
use crate::types::{BoundingBox, DetectionSample, Point};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_IOU: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detector capability consumed by the capture loop.
///
/// Returns the single most confident face in a grayscale frame, with
/// landmarks and descriptor. Calls must not depend on earlier frames.
pub trait Detector: Send {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<DetectionSample>, DetectorError>;
}

/// Maps letterboxed model coordinates back to frame pixels.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    scaled_w: u32,
    scaled_h: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> Self {
        let side = SCRFD_INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        Self {
            scale,
            pad_x: ((SCRFD_INPUT_SIZE - scaled_w) / 2) as f32,
            pad_y: ((SCRFD_INPUT_SIZE - scaled_h) / 2) as f32,
            scaled_w,
            scaled_h,
        }
    }

    fn unmap(&self, x: f32, y: f32) -> Point {
        Point::new((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// A raw SCRFD detection before descriptor extraction.
#[derive(Debug, Clone)]
struct Candidate {
    bbox: BoundingBox,
    confidence: f32,
    landmarks: Vec<Point>,
}

/// Output tensor slots (score, bbox, kps) for each stride.
type Layout = [(usize, usize, usize); 3];

/// SCRFD face detector (anchor-free, three strides, five landmarks).
pub struct ScrfdDetector {
    session: Session,
    layout: Layout,
}

impl ScrfdDetector {
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }
        let layout = output_layout(&names);
        tracing::info!(path = model_path, outputs = ?names, ?layout, "loaded SCRFD model");

        Ok(Self { session, layout })
    }

    fn detect_faces(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Vec<Candidate>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(pixels, width, height)?;
        let layout = self.layout;

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = layout[level];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("boxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("landmarks stride {stride}: {e}")))?;
            decode_level(scores, boxes, kps, stride, &letterbox, &mut candidates);
        }

        Ok(suppress(candidates, SCRFD_NMS_IOU))
    }
}

/// SCRFD detection followed by ArcFace descriptor extraction.
pub struct OnnxDetector {
    scrfd: ScrfdDetector,
    encoder: ArcFaceEncoder,
}

impl OnnxDetector {
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, DetectorError> {
        Ok(Self {
            scrfd: ScrfdDetector::load(scrfd_path)?,
            encoder: ArcFaceEncoder::load(arcface_path)?,
        })
    }
}

impl Detector for OnnxDetector {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<DetectionSample>, DetectorError> {
        let Some(best) = self.scrfd.detect_faces(pixels, width, height)?.into_iter().next() else {
            return Ok(None);
        };
        let descriptor = self.encoder.encode(pixels, width, height, &best.landmarks)?;
        Ok(Some(DetectionSample {
            bbox: best.bbox,
            landmarks: best.landmarks,
            confidence: best.confidence,
            descriptor,
        }))
    }
}

/// Resolve output slots by tensor name ("score_8", "bbox_16", ...), falling
/// back to the positional export order [scores, boxes, kps] x [8, 16, 32].
fn output_layout(names: &[String]) -> Layout {
    let slot = |kind: &str, stride: u32| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };
    let mut layout: Layout = [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
    for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (slot("score", stride), slot("bbox", stride), slot("kps", stride)) {
            (Some(s), Some(b), Some(k)) => layout[level] = (s, b, k),
            _ => {
                tracing::debug!(?names, "SCRFD output names not recognized; using positional layout");
                return [(0, 3, 6), (1, 4, 7), (2, 5, 8)];
            }
        }
    }
    layout
}

/// Letterbox a grayscale frame into the normalized NCHW SCRFD input.
fn letterbox_tensor(pixels: &[u8], width: u32, height: u32) -> Result<(Array4<f32>, Letterbox), DetectorError> {
    let frame = GrayImage::from_raw(width, height, pixels.to_vec())
        .filter(|_| width > 0 && height > 0)
        .ok_or(DetectorError::InvalidFrame { width, height })?;

    let letterbox = Letterbox::fit(width, height);
    let resized = imageops::resize(&frame, letterbox.scaled_w, letterbox.scaled_h, FilterType::Triangle);

    let side = SCRFD_INPUT_SIZE as usize;
    // Zero is the normalized value of the mean, so untouched cells act as padding.
    let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        let v = (px.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        for c in 0..3 {
            tensor[[0, c, oy + y as usize, ox + x as usize]] = v;
        }
    }
    Ok((tensor, letterbox))
}

/// Decode one stride level of SCRFD distance predictions.
fn decode_level(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: u32,
    letterbox: &Letterbox,
    out: &mut Vec<Candidate>,
) {
    let cols = (SCRFD_INPUT_SIZE / stride) as usize;
    let s = stride as f32;

    for (i, &score) in scores.iter().enumerate() {
        if score <= SCRFD_SCORE_THRESHOLD {
            continue;
        }
        let Some(d) = boxes.get(i * 4..i * 4 + 4) else {
            continue;
        };
        let cell = i / SCRFD_ANCHORS;
        let ax = ((cell % cols) as u32 * stride) as f32;
        let ay = ((cell / cols) as u32 * stride) as f32;

        let top_left = letterbox.unmap(ax - d[0] * s, ay - d[1] * s);
        let bottom_right = letterbox.unmap(ax + d[2] * s, ay + d[3] * s);
        let landmarks = kps
            .get(i * 10..i * 10 + 10)
            .map(|k| {
                k.chunks_exact(2)
                    .map(|p| letterbox.unmap(ax + p[0] * s, ay + p[1] * s))
                    .collect()
            })
            .unwrap_or_default();

        out.push(Candidate {
            bbox: BoundingBox {
                x: top_left.x,
                y: top_left.y,
                width: bottom_right.x - top_left.x,
                height: bottom_right.y - top_left.y,
            },
            confidence: score,
            landmarks,
        });
    }
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn suppress(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        if kept.iter().all(|k| k.bbox.iou(&c.bbox) <= iou_threshold) {
            kept.push(c);
        }
    }
    kept
}
