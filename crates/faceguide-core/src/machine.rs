//! Guided capture state machine.
//!
//! Owns every piece of mutable session state: the phase, the qualifying
//! frame counter, the held preview and the match status. Callers feed it
//! events and act on what it returns; it never performs I/O itself.
//!
//! Each reset or teardown bumps a generation counter. Work started under
//! an older generation (a detection, a match request, a dwell timer) is
//! rejected when it completes.

use crate::guide::{FitResult, Mood};
use crate::matching::MatchStatus;
use serde::{Deserialize, Serialize};

/// Linear capture progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Camera or detector not ready yet, or session torn down.
    Idle,
    /// Scoring frames, no capture pending.
    Tracking,
    /// Frame frozen, match request in flight.
    Capturing,
    /// Match outcome on screen, waiting for the auto-reset.
    ShowingResult,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Tracking => "tracking",
            Phase::Capturing => "capturing",
            Phase::ShowingResult => "showing_result",
        }
    }
}

/// How many qualifying frames trigger a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturePolicy {
    /// Consecutive frames needed while the current frame is "good".
    pub good_frames: u32,
    /// Frames needed while the current frame is only "ok". `None` disables
    /// capturing on a sustained "ok" streak.
    pub sustained_ok_frames: Option<u32>,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            good_frames: 3,
            sustained_ok_frames: Some(8),
        }
    }
}

impl CapturePolicy {
    /// Threshold that applies when the latest frame has the given mood.
    /// `None` means no streak can trigger a capture.
    pub fn required(&self, mood: Mood) -> Option<u32> {
        match mood {
            Mood::Good => Some(self.good_frames),
            _ => self.sustained_ok_frames,
        }
    }
}

/// Mutable session state. Only [`CaptureMachine`] writes it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub phase: Phase,
    pub qualifying_frames: u32,
    pub generation: u64,
    pub last_fit: Option<FitResult>,
    /// JPEG still of the captured frame.
    #[serde(skip)]
    pub preview: Option<Vec<u8>>,
    pub match_status: Option<MatchStatus>,
    /// Terminal session failure (camera denied, readiness timeout, ...).
    pub error: Option<String>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            qualifying_frames: 0,
            generation: 0,
            last_fit: None,
            preview: None,
            match_status: None,
            error: None,
        }
    }
}

/// Issued when a streak qualifies. The holder must take the snapshot and
/// send exactly one match request tagged with `generation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTicket {
    pub generation: u64,
}

/// Result of feeding one frame into the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not tracking; the frame was dropped.
    Ignored,
    /// Still tracking. `need` is the active threshold, if any.
    Progress { count: u32, need: Option<u32> },
    /// Transitioned to [`Phase::Capturing`].
    Capture(CaptureTicket),
}

pub struct CaptureMachine {
    policy: CapturePolicy,
    state: SessionState,
}

impl CaptureMachine {
    pub fn new(policy: CapturePolicy) -> Self {
        Self {
            policy,
            state: SessionState::new(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn policy(&self) -> &CapturePolicy {
        &self.policy
    }

    /// Whether a detection result for `generation` would still be applied.
    pub fn accepts_frames(&self, generation: u64) -> bool {
        self.state.phase == Phase::Tracking && self.state.generation == generation
    }

    /// Camera and detector both ready: `Idle → Tracking`.
    pub fn mark_ready(&mut self) -> bool {
        if self.state.phase != Phase::Idle {
            return false;
        }
        self.state.phase = Phase::Tracking;
        self.state.error = None;
        tracing::info!(generation = self.state.generation, "tracking started");
        true
    }

    /// Record a terminal session failure. The machine stays idle until a
    /// fresh `mark_ready`.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(%reason, "capture session failed");
        self.enter_idle();
        self.state.error = Some(reason);
    }

    /// No face, or a face below the confidence floor.
    pub fn on_no_face(&mut self) -> Verdict {
        if self.state.phase != Phase::Tracking {
            return Verdict::Ignored;
        }
        self.state.qualifying_frames = 0;
        self.state.last_fit = None;
        Verdict::Progress {
            count: 0,
            need: self.policy.required(Mood::Bad),
        }
    }

    /// Apply one scored frame.
    pub fn on_fit(&mut self, fit: FitResult) -> Verdict {
        if self.state.phase != Phase::Tracking {
            return Verdict::Ignored;
        }
        self.state.last_fit = Some(fit);

        match fit.mood {
            Mood::Good => self.state.qualifying_frames += 1,
            Mood::Ok if self.policy.sustained_ok_frames.is_some() => {
                self.state.qualifying_frames += 1
            }
            Mood::Ok => {}
            Mood::Bad => self.state.qualifying_frames = 0,
        }

        let count = self.state.qualifying_frames;
        let need = self.policy.required(fit.mood);
        match need {
            Some(n) if count >= n => {
                self.state.qualifying_frames = 0;
                self.state.phase = Phase::Capturing;
                tracing::info!(
                    generation = self.state.generation,
                    mood = fit.mood.as_str(),
                    score = fit.score,
                    frames = count,
                    "capture triggered"
                );
                Verdict::Capture(CaptureTicket {
                    generation: self.state.generation,
                })
            }
            _ => Verdict::Progress { count, need },
        }
    }

    /// Hold the still taken for a capture. Stale tickets are ignored.
    pub fn hold_preview(&mut self, ticket: CaptureTicket, jpeg: Vec<u8>) -> bool {
        if self.state.phase != Phase::Capturing || ticket.generation != self.state.generation {
            return false;
        }
        self.state.preview = Some(jpeg);
        true
    }

    /// Match outcome arrived: `Capturing → ShowingResult`.
    pub fn on_match_outcome(&mut self, ticket: CaptureTicket, status: MatchStatus) -> bool {
        if self.state.phase != Phase::Capturing || ticket.generation != self.state.generation {
            tracing::debug!(
                ticket = ticket.generation,
                current = self.state.generation,
                "discarding stale match outcome"
            );
            return false;
        }
        tracing::info!(
            generation = self.state.generation,
            outcome = %status.summary(),
            "showing result"
        );
        self.state.match_status = Some(status);
        self.state.phase = Phase::ShowingResult;
        true
    }

    /// Dwell timer for `generation` fired: `ShowingResult → Tracking`.
    pub fn on_dwell_elapsed(&mut self, generation: u64) -> bool {
        if self.state.phase != Phase::ShowingResult || generation != self.state.generation {
            return false;
        }
        tracing::debug!(generation, "auto-reset");
        self.rearm();
        true
    }

    /// Manual reset from any non-idle phase.
    pub fn reset(&mut self) -> bool {
        if self.state.phase == Phase::Idle {
            return false;
        }
        tracing::info!(from = self.state.phase.as_str(), "manual reset");
        self.rearm();
        true
    }

    /// Permanent teardown. Outstanding work becomes stale.
    pub fn teardown(&mut self) {
        self.enter_idle();
    }

    fn rearm(&mut self) {
        self.clear();
        self.state.phase = Phase::Tracking;
    }

    fn enter_idle(&mut self) {
        self.clear();
        self.state.phase = Phase::Idle;
    }

    fn clear(&mut self) {
        self.state.generation += 1;
        self.state.qualifying_frames = 0;
        self.state.last_fit = None;
        self.state.preview = None;
        self.state.match_status = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::{MatchResponse, MatchedIdentity};

    fn fit(score: f32) -> FitResult {
        FitResult::from_components(score, score, score)
    }

    fn tracking(policy: CapturePolicy) -> CaptureMachine {
        let mut m = CaptureMachine::new(policy);
        assert!(m.mark_ready());
        m
    }

    fn good_only(good_frames: u32) -> CapturePolicy {
        CapturePolicy {
            good_frames,
            sustained_ok_frames: None,
        }
    }

    /// Feed scores, return the 1-based index of each tick that captured.
    fn captures(m: &mut CaptureMachine, scores: &[f32]) -> Vec<usize> {
        scores
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| match m.on_fit(fit(s)) {
                Verdict::Capture(_) => Some(i + 1),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_starts_idle_and_ignores_frames() {
        let mut m = CaptureMachine::new(CapturePolicy::default());
        assert_eq!(m.phase(), Phase::Idle);
        assert_eq!(m.on_fit(fit(0.9)), Verdict::Ignored);
        assert!(!m.reset());
    }

    #[test]
    fn test_three_good_frames_capture_on_third() {
        let mut m = tracking(good_only(3));
        assert_eq!(captures(&mut m, &[0.8, 0.8, 0.8]), vec![3]);
        assert_eq!(m.phase(), Phase::Capturing);
        assert_eq!(m.state().qualifying_frames, 0);
    }

    #[test]
    fn test_bad_frame_resets_streak() {
        let mut m = tracking(good_only(3));
        assert_eq!(captures(&mut m, &[0.8, 0.8, 0.3, 0.8, 0.8, 0.8]), vec![6]);
    }

    #[test]
    fn test_single_bad_frame_clears_long_streak() {
        let mut m = tracking(CapturePolicy {
            good_frames: 100,
            sustained_ok_frames: None,
        });
        for _ in 0..50 {
            m.on_fit(fit(0.9));
        }
        assert_eq!(m.state().qualifying_frames, 50);
        m.on_fit(fit(0.1));
        assert_eq!(m.state().qualifying_frames, 0);
    }

    #[test]
    fn test_no_face_resets_streak() {
        let mut m = tracking(good_only(3));
        m.on_fit(fit(0.8));
        m.on_fit(fit(0.8));
        m.on_no_face();
        assert_eq!(m.state().qualifying_frames, 0);
        assert_eq!(captures(&mut m, &[0.8, 0.8]), Vec::<usize>::new());
    }

    #[test]
    fn test_captures_exactly_once_per_qualification() {
        let mut m = tracking(good_only(3));
        let scores = [0.9; 20];
        assert_eq!(captures(&mut m, &scores), vec![3]);
    }

    #[test]
    fn test_ok_frames_hold_count_when_policy_disabled() {
        let mut m = tracking(good_only(3));
        m.on_fit(fit(0.8));
        m.on_fit(fit(0.5));
        assert_eq!(m.state().qualifying_frames, 1);
        assert_eq!(
            m.on_fit(fit(0.5)),
            Verdict::Progress { count: 1, need: None }
        );
    }

    #[test]
    fn test_sustained_ok_captures_after_threshold() {
        let mut m = tracking(CapturePolicy {
            good_frames: 3,
            sustained_ok_frames: Some(8),
        });
        assert_eq!(captures(&mut m, &[0.5; 8]), vec![8]);
    }

    #[test]
    fn test_mixed_streak_uses_unified_count() {
        let mut m = tracking(CapturePolicy {
            good_frames: 3,
            sustained_ok_frames: Some(8),
        });
        // Two ok frames then a good one: count reaches 3 on a good frame.
        assert_eq!(captures(&mut m, &[0.5, 0.5, 0.8]), vec![3]);
    }

    #[test]
    fn test_match_outcome_shows_result() {
        let mut m = tracking(good_only(1));
        let Verdict::Capture(ticket) = m.on_fit(fit(0.9)) else {
            panic!("expected capture");
        };
        assert!(m.hold_preview(ticket, vec![0xFF, 0xD8]));
        let status = MatchStatus::from(Ok(MatchResponse::Matched {
            identity: MatchedIdentity {
                id: "7".into(),
                name: "Rui".into(),
                avatar: None,
                distance: 0.2,
            },
            threshold: 0.5,
        }));
        assert!(m.on_match_outcome(ticket, status.clone()));
        assert_eq!(m.phase(), Phase::ShowingResult);
        assert_eq!(m.state().match_status.as_ref(), Some(&status));
        assert!(m.state().preview.is_some());
        // No scoring while a result is on screen.
        assert_eq!(m.on_fit(fit(0.9)), Verdict::Ignored);
    }

    #[test]
    fn test_failure_still_reaches_showing_result() {
        let mut m = tracking(good_only(1));
        let Verdict::Capture(ticket) = m.on_fit(fit(0.9)) else {
            panic!("expected capture");
        };
        let status = MatchStatus::NoResult {
            reason: "timeout".into(),
        };
        assert!(m.on_match_outcome(ticket, status));
        assert_eq!(m.phase(), Phase::ShowingResult);
    }

    #[test]
    fn test_dwell_auto_reset_clears_state() {
        let mut m = tracking(good_only(1));
        let Verdict::Capture(ticket) = m.on_fit(fit(0.9)) else {
            panic!("expected capture");
        };
        m.hold_preview(ticket, vec![1, 2, 3]);
        m.on_match_outcome(ticket, MatchStatus::NoResult { reason: "x".into() });
        let generation = m.generation();
        assert!(m.on_dwell_elapsed(generation));
        assert_eq!(m.phase(), Phase::Tracking);
        assert!(m.state().preview.is_none());
        assert!(m.state().match_status.is_none());
        assert_eq!(m.state().qualifying_frames, 0);
        assert_eq!(m.generation(), generation + 1);
    }

    #[test]
    fn test_manual_reset_cancels_dwell_and_stale_outcome() {
        let mut m = tracking(good_only(1));
        let Verdict::Capture(ticket) = m.on_fit(fit(0.9)) else {
            panic!("expected capture");
        };
        assert!(m.reset());
        assert_eq!(m.phase(), Phase::Tracking);
        // Late match response for the superseded capture is dropped.
        assert!(!m.on_match_outcome(ticket, MatchStatus::NoResult { reason: "late".into() }));
        assert_eq!(m.phase(), Phase::Tracking);
        // A dwell timer armed under the old generation does nothing.
        assert!(!m.on_dwell_elapsed(ticket.generation));
    }

    #[test]
    fn test_stale_generation_rejected_for_frames() {
        let mut m = tracking(good_only(3));
        let before = m.generation();
        assert!(m.accepts_frames(before));
        m.reset();
        assert!(!m.accepts_frames(before));
        assert!(m.accepts_frames(m.generation()));
    }

    #[test]
    fn test_teardown_returns_to_idle() {
        let mut m = tracking(good_only(1));
        let Verdict::Capture(ticket) = m.on_fit(fit(0.9)) else {
            panic!("expected capture");
        };
        m.teardown();
        assert_eq!(m.phase(), Phase::Idle);
        assert!(!m.on_match_outcome(ticket, MatchStatus::NoResult { reason: "x".into() }));
        assert!(m.mark_ready());
    }

    #[test]
    fn test_fail_records_error() {
        let mut m = CaptureMachine::new(CapturePolicy::default());
        m.fail("camera permission denied");
        assert_eq!(m.phase(), Phase::Idle);
        assert_eq!(m.state().error.as_deref(), Some("camera permission denied"));
        m.mark_ready();
        assert!(m.state().error.is_none());
    }
}
