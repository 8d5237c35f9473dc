//! Camera session manager.
//!
//! Acquires at most one live stream, hands it to whichever sink currently
//! renders it, and stops it exactly once when the session ends. Phase
//! changes in the capture loop never release the camera.

use crate::camera::{CameraError, CameraSource};
use crate::frame::Frame;
use crate::stream::{CameraStream, VideoSink};
use std::sync::Arc;
use std::time::Duration;

pub struct CameraSession<S> {
    source: S,
    stream: Option<CameraStream>,
    opens: u32,
    torn_down: bool,
}

impl<S: CameraSource> CameraSession<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            stream: None,
            opens: 0,
            torn_down: false,
        }
    }

    /// Number of camera-access requests issued so far.
    pub fn open_count(&self) -> u32 {
        self.opens
    }

    pub fn is_live(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.is_live())
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// The live stream, acquiring it on first use. A stream that is still
    /// live is never reacquired.
    pub async fn ensure_stream(&mut self) -> Result<&CameraStream, CameraError> {
        if self.torn_down {
            return Err(CameraError::TornDown);
        }
        if !self.is_live() {
            if let Some(mut dead) = self.stream.take() {
                tracing::warn!(stream = dead.id(), "camera stream ended; reacquiring");
                dead.stop();
            }
            self.opens += 1;
            let stream = self.source.open().await?;
            tracing::info!(stream = stream.id(), opens = self.opens, "camera stream acquired");
            self.stream = Some(stream);
        }
        self.stream.as_ref().ok_or(CameraError::TornDown)
    }

    /// Poll until the stream reports non-zero dimensions.
    pub async fn wait_ready(&mut self, attempts: u32, poll: Duration) -> Result<(u32, u32), CameraError> {
        for attempt in 1..=attempts {
            if let Some(dims) = self.ensure_stream().await?.dimensions() {
                tracing::info!(width = dims.0, height = dims.1, attempt, "camera ready");
                return Ok(dims);
            }
            tracing::debug!(attempt, attempts, "camera not ready yet");
            tokio::time::sleep(poll).await;
        }
        Err(CameraError::NotReady { attempts })
    }

    /// Give `sink` the live stream, replacing whatever it held.
    pub async fn attach<K: VideoSink + ?Sized>(&mut self, sink: &mut K) -> Result<(), CameraError> {
        let feed = self.ensure_stream().await?.feed();
        tracing::debug!(stream = feed.stream_id(), "attaching sink");
        sink.attach(feed);
        Ok(())
    }

    /// Re-attach after a view swap. No-op when `sink` already holds the
    /// live stream.
    pub async fn reattach<K: VideoSink + ?Sized>(&mut self, sink: &mut K) -> Result<(), CameraError> {
        let id = self.ensure_stream().await?.id();
        if sink.attached_stream() == Some(id) {
            return Ok(());
        }
        self.attach(sink).await
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.stream.as_ref().and_then(|s| s.latest())
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.stream.as_ref().and_then(|s| s.dimensions())
    }

    /// End the session: stop the stream once and refuse further use.
    pub fn teardown(&mut self, sink: Option<&mut dyn VideoSink>) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if let Some(sink) = sink {
            sink.detach();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        tracing::info!(opens = self.opens, "camera session torn down");
    }
}
