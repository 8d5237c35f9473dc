//! Result presentation.
//!
//! The driver renders a [`PresenterView`] after every event it handles.
//! Presenters only consume it; they never feed back into the loop. A
//! presenter is also the video sink the camera session attaches the live
//! stream to.

use faceguide_core::{FitResult, GuideRegion, MatchStatus, Phase};
use faceguide_hw::{FrameFeed, VideoSink};
use std::path::PathBuf;
use std::time::Duration;

/// Everything a frontend needs to draw one state of the kiosk.
#[derive(Debug, Clone, Copy)]
pub struct PresenterView<'a> {
    pub phase: Phase,
    /// Human-readable status line.
    pub status: &'a str,
    pub guide: Option<&'a GuideRegion>,
    pub fit: Option<&'a FitResult>,
    /// Qualifying frame count and the threshold it is measured against.
    pub progress: (u32, Option<u32>),
    /// JPEG still of the captured frame.
    pub preview: Option<&'a [u8]>,
    pub match_status: Option<&'a MatchStatus>,
    /// Time left before the result is cleared.
    pub remaining: Option<Duration>,
}

pub trait Presenter: VideoSink + Send {
    fn render(&mut self, view: &PresenterView<'_>);
}

/// Headless presenter: logs state transitions and optionally writes the
/// captured still to disk.
#[derive(Default)]
pub struct LogPresenter {
    feed: Option<FrameFeed>,
    preview_path: Option<PathBuf>,
    last_phase: Option<Phase>,
    last_status: String,
    wrote_preview: bool,
}

impl LogPresenter {
    pub fn new(preview_path: Option<PathBuf>) -> Self {
        Self {
            preview_path,
            ..Self::default()
        }
    }

    fn write_preview(&mut self, jpeg: &[u8]) {
        let Some(path) = &self.preview_path else {
            return;
        };
        match std::fs::write(path, jpeg) {
            Ok(()) => tracing::info!(path = %path.display(), bytes = jpeg.len(), "preview written"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to write preview"),
        }
    }
}

impl VideoSink for LogPresenter {
    fn attached_stream(&self) -> Option<u64> {
        self.feed.as_ref().map(|f| f.stream_id())
    }

    fn attach(&mut self, feed: FrameFeed) {
        tracing::debug!(stream = feed.stream_id(), "live view attached");
        self.feed = Some(feed);
    }

    fn detach(&mut self) {
        if self.feed.take().is_some() {
            tracing::debug!("live view detached");
        }
    }
}

impl Presenter for LogPresenter {
    fn render(&mut self, view: &PresenterView<'_>) {
        match view.preview {
            Some(jpeg) if !self.wrote_preview => {
                self.wrote_preview = true;
                self.write_preview(jpeg);
            }
            None => self.wrote_preview = false,
            _ => {}
        }

        if self.last_phase == Some(view.phase) && self.last_status == view.status {
            return;
        }
        self.last_phase = Some(view.phase);
        self.last_status = view.status.to_string();

        let (count, need) = view.progress;
        tracing::info!(
            phase = view.phase.as_str(),
            status = view.status,
            count,
            need = ?need,
            score = view.fit.map(|f| f.score),
            guide_ry = view.guide.map(|g| g.ry),
            result = view.match_status.map(|m| m.summary()).as_deref(),
            remaining_ms = view.remaining.map(|d| d.as_millis() as u64),
            "kiosk"
        );
    }
}
