//! Live camera stream handle.
//!
//! A capture worker publishes frames through a [`FramePublisher`]; the
//! [`CameraStream`] it pairs with keeps the latest one. Sinks receive a
//! read-only [`FrameFeed`] and can never stop the stream.

use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

type Slot = Option<Arc<Frame>>;

/// Writer half, owned by the capture worker.
pub struct FramePublisher {
    tx: watch::Sender<Slot>,
    stopped: Arc<AtomicBool>,
}

impl FramePublisher {
    /// Publish a frame. Returns `false` once the stream has been stopped;
    /// the worker should exit then.
    pub fn publish(&self, frame: Frame) -> bool {
        if self.is_stopped() {
            return false;
        }
        self.tx.send_replace(Some(Arc::new(frame)));
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// Owner half. Only the camera session holds this.
pub struct CameraStream {
    id: u64,
    rx: watch::Receiver<Slot>,
    stopped: Arc<AtomicBool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

/// Create a connected publisher/stream pair.
pub fn channel() -> (FramePublisher, CameraStream) {
    let (tx, rx) = watch::channel(None);
    let stopped = Arc::new(AtomicBool::new(false));
    (
        FramePublisher {
            tx,
            stopped: Arc::clone(&stopped),
        },
        CameraStream {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            rx,
            stopped,
            worker: None,
        },
    )
}

impl CameraStream {
    /// Attach the worker thread so `stop` can join it.
    pub fn with_worker(mut self, worker: std::thread::JoinHandle<()>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Live until stopped or until the worker drops its publisher.
    pub fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::Acquire) && self.rx.has_changed().is_ok()
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.rx.borrow().clone()
    }

    /// Dimensions of the latest frame, once they are non-zero.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.rx.borrow().as_ref().and_then(|f| f.dimensions())
    }

    /// Read-only view for a sink.
    pub fn feed(&self) -> FrameFeed {
        FrameFeed {
            stream_id: self.id,
            rx: self.rx.clone(),
        }
    }

    /// Stop the worker. Returns `true` only for the call that stopped it.
    ///
    /// Inside a tokio runtime the worker is joined on the blocking pool, so
    /// a dequeue stuck in the driver never stalls the caller.
    pub(crate) fn stop(&mut self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(worker) = self.worker.take() {
            let id = self.id;
            let join = move || {
                if worker.join().is_err() {
                    tracing::warn!(stream = id, "camera worker panicked");
                }
            };
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => drop(rt.spawn_blocking(join)),
                Err(_) => join(),
            }
        }
        tracing::info!(stream = self.id, "camera stream stopped");
        true
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A sink's subscription to a stream.
#[derive(Clone)]
pub struct FrameFeed {
    stream_id: u64,
    rx: watch::Receiver<Slot>,
}

impl FrameFeed {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.rx.borrow().clone()
    }

    /// Wait for the next published frame. `None` once the stream ends.
    pub async fn next(&mut self) -> Option<Arc<Frame>> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }
}

/// Anything that renders the live stream.
pub trait VideoSink {
    /// Stream currently attached, if any.
    fn attached_stream(&self) -> Option<u64>;
    fn attach(&mut self, feed: FrameFeed);
    fn detach(&mut self);
}
