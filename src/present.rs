//! Presentation boundary
//!
//! A [`Presenter`] consumes finished frames and supplies the refresh signal
//! that paces the scheduler.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::{Interval, MissedTickBehavior};

use crate::frame::Frame;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresentError {
    /// The frame could not be shown; the next cycle may succeed
    #[error("presentation surface lost: {0}")]
    Lost(String),
    /// The display went away; the session should stop
    #[error("presentation surface closed")]
    Closed,
}

#[async_trait]
pub trait Presenter: Send {
    /// Show a completed frame
    async fn present(&mut self, frame: &Frame) -> Result<(), PresentError>;

    /// Wait for the next display refresh
    async fn next_refresh(&mut self);
}

/// Presenter without a display: ticks at a fixed refresh rate and keeps FPS
/// statistics.
pub struct HeadlessPresenter {
    ticker: Interval,
    frame_count: u64,
    fps: f64,
    last_fps_update: Instant,
    frames_since_update: u64,
    last_size: (u32, u32),
}

impl HeadlessPresenter {
    /// Must be called from within a tokio runtime
    pub fn new(refresh_hz: u32) -> Self {
        let period = Duration::from_nanos(1_000_000_000u64 / refresh_hz.max(1) as u64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            ticker,
            frame_count: 0,
            fps: 0.0,
            last_fps_update: Instant::now(),
            frames_since_update: 0,
            last_size: (0, 0),
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Frames presented per second, updated once a second
    pub fn fps(&self) -> f64 {
        self.fps
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;
        self.frames_since_update += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f64();
        if elapsed >= 1.0 {
            self.fps = self.frames_since_update as f64 / elapsed;
            self.frames_since_update = 0;
            self.last_fps_update = now;
            log::info!("Presenting at {:.1} fps ({} frames total)", self.fps, self.frame_count);
        }
    }
}

#[async_trait]
impl Presenter for HeadlessPresenter {
    async fn present(&mut self, frame: &Frame) -> Result<(), PresentError> {
        let size = (frame.width(), frame.height());
        if size != self.last_size {
            log::info!("Output size {}x{}", size.0, size.1);
            self.last_size = size;
        }
        self.update_fps();
        Ok(())
    }

    async fn next_refresh(&mut self) {
        self.ticker.tick().await;
    }
}
