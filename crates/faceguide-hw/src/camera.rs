//! Camera acquisition: the [`CameraSource`] boundary and its V4L2 implementation.

use crate::frame::{Frame, PixelFormat};
use crate::stream::{self, CameraStream, FramePublisher};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Consecutive dequeue failures before the capture worker gives up.
const MAX_CAPTURE_FAILURES: u32 = 10;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("camera produced no usable frames after {attempts} attempts")]
    NotReady { attempts: u32 },
    #[error("camera session already torn down")]
    TornDown,
}

impl CameraError {
    /// Acquisition failures: the camera could not be opened at all.
    pub fn is_acquisition(&self) -> bool {
        matches!(
            self,
            CameraError::DeviceNotFound(_)
                | CameraError::PermissionDenied(_)
                | CameraError::DeviceBusy
                | CameraError::FormatNegotiationFailed(_)
                | CameraError::StreamingNotSupported
        )
    }
}

/// Something that can hand out a live camera stream.
///
/// Every `open` call is a fresh request for camera access. Opening may take
/// a while (device negotiation, a permission prompt); it suspends instead of
/// blocking the caller's thread.
pub trait CameraSource: Send {
    fn open(&mut self) -> impl Future<Output = Result<CameraStream, CameraError>> + Send;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// V4L2 capture device, streamed from a dedicated worker thread.
pub struct V4lCamera {
    device_path: String,
    width: u32,
    height: u32,
}

impl V4lCamera {
    pub fn new(device_path: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            device_path: device_path.into(),
            width,
            height,
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}

impl CameraSource for V4lCamera {
    async fn open(&mut self) -> Result<CameraStream, CameraError> {
        if !Path::new(&self.device_path).exists() {
            return Err(CameraError::DeviceNotFound(self.device_path.clone()));
        }

        let (publisher, stream) = stream::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let path = self.device_path.clone();
        let (width, height) = (self.width, self.height);

        let worker = std::thread::Builder::new()
            .name("faceguide-camera".into())
            .spawn(move || {
                match negotiate(&path, width, height) {
                    Ok(session) => {
                        let _ = ready_tx.send(Ok(()));
                        session.run(&publisher);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn camera thread: {e}")))?;

        // A failed negotiation leaves the worker exiting on its own.
        match ready_rx.await {
            Ok(Ok(())) => Ok(stream.with_worker(worker)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CameraError::CaptureFailed("camera thread exited during open".into())),
        }
    }
}

/// An opened device with its negotiated format.
struct Negotiated {
    device: Device,
    width: u32,
    height: u32,
    format: PixelFormat,
}

fn negotiate(path: &str, width: u32, height: u32) -> Result<Negotiated, CameraError> {
    let device = Device::with_path(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(format!("{path}: {e}")),
        _ if e.raw_os_error() == Some(16) => CameraError::DeviceBusy,
        _ => CameraError::DeviceNotFound(format!("{path}: {e}")),
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = width;
    fmt.height = height;
    let negotiated = device
        .set_format(&fmt)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

    let format = PixelFormat::from_fourcc(&negotiated.fourcc.repr).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format: {:?} (need YUYV, GREY, or Y16)",
            negotiated.fourcc
        ))
    })?;

    tracing::info!(
        device = path,
        card = %caps.card,
        width = negotiated.width,
        height = negotiated.height,
        fourcc = ?negotiated.fourcc,
        "camera opened"
    );

    Ok(Negotiated {
        device,
        width: negotiated.width,
        height: negotiated.height,
        format,
    })
}

impl Negotiated {
    /// Capture until the stream is stopped or the device keeps failing.
    fn run(self, publisher: &FramePublisher) {
        let mut stream = match MmapStream::with_buffers(&self.device, BufType::VideoCapture, 4) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to create mmap stream");
                return;
            }
        };

        let mut failures = 0u32;
        while !publisher.is_stopped() {
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(e) => {
                    failures += 1;
                    tracing::warn!(error = %e, failures, "failed to dequeue buffer");
                    if failures >= MAX_CAPTURE_FAILURES {
                        tracing::error!("camera keeps failing; ending stream");
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
            };
            failures = 0;

            let sequence = meta.sequence;
            match self.format.to_gray(buf, self.width, self.height) {
                Ok(gray) => {
                    if !publisher.publish(Frame::new(gray, self.width, self.height, sequence)) {
                        break;
                    }
                }
                Err(e) => tracing::debug!(error = %e, seq = sequence, "dropping malformed frame"),
            }
        }
        tracing::debug!("camera worker exiting");
    }
}
