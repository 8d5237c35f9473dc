//! Guide geometry and fit scoring.
//!
//! Computes the on-screen target ellipse for a frame and scores how well a
//! detected face sits inside it. Everything here is pure: no camera, no model,
//! no clock.

use crate::types::DetectionSample;
use serde::{Deserialize, Serialize};

/// Fixed rx:ry ratio of the guide ellipse.
const GUIDE_ASPECT: f32 = 0.8;

const WEIGHT_POSITION: f32 = 0.45;
const WEIGHT_SIZE: f32 = 0.35;
const WEIGHT_ANGLE: f32 = 0.20;

const GOOD_CUTOFF: f32 = 0.70;
const OK_CUTOFF: f32 = 0.45;

/// Fraction of the size tolerance window beyond which a distance hint is given.
const SIZE_HINT_FRACTION: f32 = 0.6;
/// Component scores below this trigger a position or tilt hint.
const LOW_COMPONENT_SCORE: f32 = 0.5;

/// Placement of the guide and the tolerances used to score against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuideConfig {
    /// Guide center as a fraction of frame width.
    pub center_x: f32,
    /// Guide center as a fraction of frame height.
    pub center_y: f32,
    /// Vertical radius as a fraction of the shorter frame dimension.
    pub target_radius: f32,
    /// Positional tolerance as a fraction of the shorter frame dimension.
    pub position_tolerance: f32,
    /// Size tolerance as a fraction of the target face height.
    pub size_tolerance: f32,
    /// Head tilt tolerance in degrees.
    pub angle_tolerance_deg: f32,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            center_x: 0.5,
            center_y: 0.48,
            target_radius: 0.32,
            position_tolerance: 0.28,
            size_tolerance: 0.35,
            angle_tolerance_deg: 18.0,
        }
    }
}

/// Target ellipse in frame-pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuideRegion {
    pub cx: f32,
    pub cy: f32,
    pub rx: f32,
    pub ry: f32,
    /// Frame dimensions this region was derived for.
    pub frame_width: u32,
    pub frame_height: u32,
}

impl GuideRegion {
    /// Face height that scores a perfect size match.
    pub fn target_height(&self) -> f32 {
        2.0 * self.ry
    }

    pub fn min_dimension(&self) -> f32 {
        self.frame_width.min(self.frame_height) as f32
    }

    pub fn matches_frame(&self, width: u32, height: u32) -> bool {
        self.frame_width == width && self.frame_height == height
    }
}

/// Derive the guide ellipse for a frame of the given size.
pub fn compute_guide_region(frame_width: u32, frame_height: u32, config: &GuideConfig) -> GuideRegion {
    let w = frame_width as f32;
    let h = frame_height as f32;
    let ry = config.target_radius * w.min(h);
    GuideRegion {
        cx: config.center_x * w,
        cy: config.center_y * h,
        rx: ry * GUIDE_ASPECT,
        ry,
        frame_width,
        frame_height,
    }
}

/// Qualitative fit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Bad,
    Ok,
    Good,
}

impl Mood {
    /// Classify a composite score. The cut-points partition [0, 1].
    pub fn from_score(score: f32) -> Self {
        if score >= GOOD_CUTOFF {
            Mood::Good
        } else if score >= OK_CUTOFF {
            Mood::Ok
        } else {
            Mood::Bad
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Bad => "bad",
            Mood::Ok => "ok",
            Mood::Good => "good",
        }
    }
}

/// Advisory adjustment for the user. Directions are in frame coordinates;
/// a mirrored preview swaps left and right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hint {
    MoveCloser,
    MoveBack,
    MoveLeft,
    MoveRight,
    MoveUp,
    MoveDown,
    LevelHead,
}

impl Hint {
    pub fn message(&self) -> &'static str {
        match self {
            Hint::MoveCloser => "move closer",
            Hint::MoveBack => "move back",
            Hint::MoveLeft => "move left",
            Hint::MoveRight => "move right",
            Hint::MoveUp => "move up",
            Hint::MoveDown => "move down",
            Hint::LevelHead => "level your head",
        }
    }
}

/// How well one detection fits the guide.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub position: f32,
    pub size: f32,
    pub angle: f32,
    pub score: f32,
    pub mood: Mood,
    pub hint: Option<Hint>,
}

impl FitResult {
    /// Build a result from component scores, applying the fixed weights.
    pub fn from_components(position: f32, size: f32, angle: f32) -> Self {
        let score = clamp01(WEIGHT_POSITION * position + WEIGHT_SIZE * size + WEIGHT_ANGLE * angle);
        Self {
            position,
            size,
            angle,
            score,
            mood: Mood::from_score(score),
            hint: None,
        }
    }
}

/// Score a detection against the guide.
pub fn score_fit(sample: &DetectionSample, guide: &GuideRegion, config: &GuideConfig) -> FitResult {
    let face = sample.bbox.center();
    let dx = face.x - guide.cx;
    let dy = face.y - guide.cy;
    let position = clamp01(1.0 - dx.hypot(dy) / (config.position_tolerance * guide.min_dimension()));

    let target_h = guide.target_height();
    let size_window = config.size_tolerance * target_h;
    let size_err = (sample.bbox.height - target_h).abs();
    let size = clamp01(1.0 - size_err / size_window);

    let angle_deg = sample
        .eye_centroids()
        .map(|(l, r)| (r.y - l.y).atan2(r.x - l.x).to_degrees())
        .unwrap_or(0.0);
    let angle = clamp01(1.0 - angle_deg.abs() / config.angle_tolerance_deg);

    let mut fit = FitResult::from_components(position, size, angle);

    fit.hint = if size_err > SIZE_HINT_FRACTION * size_window {
        Some(if sample.bbox.height < target_h {
            Hint::MoveCloser
        } else {
            Hint::MoveBack
        })
    } else if position < LOW_COMPONENT_SCORE {
        Some(if dx.abs() >= dy.abs() {
            if dx > 0.0 { Hint::MoveLeft } else { Hint::MoveRight }
        } else if dy > 0.0 {
            Hint::MoveUp
        } else {
            Hint::MoveDown
        })
    } else if angle < LOW_COMPONENT_SCORE {
        Some(Hint::LevelHead)
    } else {
        None
    };

    fit
}

fn clamp01(x: f32) -> f32 {
    x.clamp(0.0, 1.0)
}
