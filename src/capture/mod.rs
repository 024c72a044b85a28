//! Capture source module
//!
//! Abstraction over live video devices. A [`CaptureSource`] enumerates
//! devices and opens a [`FrameStream`]; the stream hands out RGBA frames with
//! latest-frame-wins semantics until it is closed.

pub mod camera;
pub mod mailbox;
pub mod pattern;

pub use camera::NokhwaSource;
pub use mailbox::FrameMailbox;
pub use pattern::TestPatternSource;

use async_trait::async_trait;

use crate::devices::{Device, DeviceId};
use crate::frame::Frame;

/// Capture failures. All of them end the current session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("camera permission was denied")]
    PermissionDenied,
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture not supported: {0}")]
    Unsupported(String),
    #[error("capture stream closed")]
    Closed,
}

/// A family of capture devices (native cameras, synthetic sources, ...)
#[async_trait]
pub trait CaptureSource: Send {
    /// List the devices this source can open, in display order
    fn enumerate(&self) -> Result<Vec<Device>, CaptureError>;

    /// Open a live stream on `device`.
    ///
    /// Returns once the device is actually streaming, or with the reason it
    /// could not be opened.
    async fn open(&mut self, device: &DeviceId) -> Result<Box<dyn FrameStream>, CaptureError>;
}

/// An open device stream
#[async_trait]
pub trait FrameStream: Send {
    /// Device this stream was opened on
    fn device(&self) -> &DeviceId;

    /// Wait for the next frame.
    ///
    /// If frames arrive faster than they are consumed, only the most recent
    /// one is returned. After [`close`](Self::close) this yields
    /// [`CaptureError::Closed`].
    async fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Release the device. Idempotent.
    fn close(&mut self);

    /// Frames overwritten before they could be delivered
    fn dropped_frames(&self) -> u64 {
        0
    }
}
