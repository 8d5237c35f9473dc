//! faceguide-hw: Camera acquisition and stream lifecycle.
//!
//! V4L2 capture on a worker thread, a shared latest-frame stream handle,
//! and the session manager that owns it.

pub mod camera;
pub mod frame;
pub mod session;
pub mod stream;

pub use camera::{CameraError, CameraSource, DeviceInfo, V4lCamera};
pub use frame::{Frame, FrameError, PixelFormat};
pub use session::CameraSession;
pub use stream::{CameraStream, FrameFeed, FramePublisher, VideoSink};
