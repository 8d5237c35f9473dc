//! faceguide-core: Guided capture logic.
//!
//! Guide geometry and fit scoring, the capture state machine, and the
//! detector and match-service boundaries the kiosk loop is built on.

pub mod descriptor;
pub mod detector;
pub mod guide;
pub mod machine;
pub mod matching;
pub mod types;

pub use detector::{Detector, DetectorError, OnnxDetector};
pub use guide::{compute_guide_region, score_fit, FitResult, GuideConfig, GuideRegion, Hint, Mood};
pub use machine::{CaptureMachine, CapturePolicy, CaptureTicket, Phase, SessionState, Verdict};
pub use matching::{MatchError, MatchResponse, MatchService, MatchStatus, MatchedIdentity};
pub use types::{BoundingBox, Descriptor, DetectionSample, Point};

/// Default model directory: `$FACEGUIDE_MODEL_DIR` or `/usr/share/faceguide/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("FACEGUIDE_MODEL_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("/usr/share/faceguide/models"))
}
