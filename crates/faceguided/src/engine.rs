use faceguide_core::{DetectionSample, Detector, DetectorError};
use faceguide_hw::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("failed to spawn detector thread: {0}")]
    Spawn(std::io::Error),
    #[error("detector thread exited")]
    ChannelClosed,
}

/// One frame waiting for inference.
struct DetectRequest {
    frame: Arc<Frame>,
    reply: oneshot::Sender<Result<Option<DetectionSample>, EngineError>>,
}

/// Clone-safe handle to the detector thread.
#[derive(Clone)]
pub struct DetectorHandle {
    tx: mpsc::Sender<DetectRequest>,
}

impl DetectorHandle {
    /// Run the detector on one frame.
    pub async fn detect(&self, frame: Arc<Frame>) -> Result<Option<DetectionSample>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DetectRequest {
                frame,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Move the detector onto a dedicated OS thread.
///
/// Inference is blocking and CPU-bound; keeping it off the runtime thread
/// lets the tick timer, commands and the dwell timer stay responsive.
pub fn spawn_detector<D: Detector + 'static>(mut detector: D) -> Result<DetectorHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<DetectRequest>(1);

    std::thread::Builder::new()
        .name("faceguide-detector".into())
        .spawn(move || {
            tracing::info!("detector thread started");
            while let Some(req) = rx.blocking_recv() {
                // Requester gone (view torn down): skip the inference entirely.
                if req.reply.is_closed() {
                    continue;
                }
                let frame = &req.frame;
                let result = detector
                    .detect(&frame.data, frame.width, frame.height)
                    .map_err(EngineError::from);
                if let Ok(Some(sample)) = &result {
                    tracing::trace!(
                        seq = frame.sequence,
                        confidence = sample.confidence,
                        "face detected"
                    );
                }
                let _ = req.reply.send(result);
            }
            tracing::info!("detector thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(DetectorHandle { tx })
}
