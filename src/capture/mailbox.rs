//! Single-slot frame handoff between a capture thread and the pipeline.
//!
//! The producer never blocks: publishing over an undelivered frame replaces
//! it and counts a drop. A producer that can no longer capture records why
//! with [`FrameMailbox::fail`], and the consumer receives that error.

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::CaptureError;
use crate::frame::Frame;

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    closed: bool,
    /// Why the producer stopped, if it failed
    error: Option<CaptureError>,
    published: u64,
    dropped: u64,
}

/// Latest-frame-wins mailbox
#[derive(Default)]
pub struct FrameMailbox {
    slot: Mutex<Slot>,
    notify: Notify,
}

impl FrameMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a frame, replacing any frame not yet taken.
    ///
    /// Returns `false` once the mailbox has been closed.
    pub fn publish(&self, frame: Frame) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot.closed {
                return false;
            }
            if slot.frame.replace(frame).is_some() {
                slot.dropped += 1;
            }
            slot.published += 1;
        }
        self.notify.notify_one();
        true
    }

    /// Wait for a frame.
    ///
    /// Once the mailbox is closed this returns the producer's failure, or
    /// [`CaptureError::Closed`] if it was closed normally.
    pub async fn recv(&self) -> Result<Frame, CaptureError> {
        loop {
            {
                let mut slot = self.slot.lock();
                if slot.closed {
                    return Err(slot.error.clone().unwrap_or(CaptureError::Closed));
                }
                if let Some(frame) = slot.frame.take() {
                    return Ok(frame);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Take a frame without waiting
    pub fn try_recv(&self) -> Option<Frame> {
        self.slot.lock().frame.take()
    }

    /// Close the mailbox and wake the consumer. Pending frames are discarded.
    pub fn close(&self) {
        {
            let mut slot = self.slot.lock();
            slot.closed = true;
            slot.frame = None;
        }
        self.notify.notify_one();
    }

    /// Close the mailbox on behalf of a producer that stopped capturing.
    ///
    /// Has no effect if the mailbox is already closed.
    pub fn fail(&self, error: CaptureError) {
        {
            let mut slot = self.slot.lock();
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.frame = None;
            slot.error = Some(error);
        }
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.slot.lock().closed
    }

    pub fn published(&self) -> u64 {
        self.slot.lock().published
    }

    pub fn dropped(&self) -> u64 {
        self.slot.lock().dropped
    }
}
