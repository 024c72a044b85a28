//! Synthetic test-pattern source
//!
//! Produces a moving gradient at a fixed rate so the pipeline can run
//! without camera hardware. Luminance is adjustable to drive the flash path.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::{Interval, MissedTickBehavior};

use super::{CaptureError, CaptureSource, FrameStream};
use crate::devices::{Device, DeviceId};
use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Identifier of the single synthetic device
pub const TEST_PATTERN_DEVICE: &str = "test-pattern";

/// Capture source generating synthetic frames
#[derive(Clone, Debug)]
pub struct TestPatternSource {
    width: u32,
    height: u32,
    fps: u32,
    /// Peak channel value of the gradient (0-255)
    luminance: u8,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            luminance: 255,
        }
    }

    /// Cap the brightest channel value; low values simulate a dark room
    pub fn with_luminance(mut self, luminance: u8) -> Self {
        self.luminance = luminance;
        self
    }
}

#[async_trait]
impl CaptureSource for TestPatternSource {
    fn enumerate(&self) -> Result<Vec<Device>, CaptureError> {
        Ok(vec![Device::new(TEST_PATTERN_DEVICE, "Test Pattern")])
    }

    async fn open(&mut self, device: &DeviceId) -> Result<Box<dyn FrameStream>, CaptureError> {
        if !device.is_default() && device.as_str() != TEST_PATTERN_DEVICE {
            return Err(CaptureError::DeviceUnavailable(device.to_string()));
        }

        log::info!(
            "Test pattern opened ({}x{} @ {} fps)",
            self.width,
            self.height,
            self.fps
        );

        let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / self.fps as f64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Ok(Box::new(PatternStream {
            device: DeviceId::new(TEST_PATTERN_DEVICE),
            config: self.clone(),
            ticker,
            frame_number: 0,
            closed: false,
        }))
    }
}

struct PatternStream {
    device: DeviceId,
    config: TestPatternSource,
    ticker: Interval,
    frame_number: u64,
    closed: bool,
}

impl PatternStream {
    fn render(&self) -> Vec<u8> {
        let TestPatternSource {
            width,
            height,
            luminance,
            ..
        } = self.config;

        let mut data = vec![0u8; width as usize * height as usize * BYTES_PER_PIXEL];
        let bar_x = if width > 0 {
            (self.frame_number % width as u64) as u32
        } else {
            0
        };
        let peak = luminance as u32;

        for y in 0..height {
            for x in 0..width {
                let idx = (y as usize * width as usize + x as usize) * BYTES_PER_PIXEL;
                let (r, g, b) = if x == bar_x {
                    (peak, peak, peak)
                } else {
                    let gx = x * peak / width.max(1);
                    let gy = y * peak / height.max(1);
                    (gx, gy, peak / 2)
                };
                data[idx] = r as u8;
                data[idx + 1] = g as u8;
                data[idx + 2] = b as u8;
                data[idx + 3] = 255;
            }
        }

        data
    }
}

#[async_trait]
impl FrameStream for PatternStream {
    fn device(&self) -> &DeviceId {
        &self.device
    }

    async fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.closed {
            return Err(CaptureError::Closed);
        }

        self.ticker.tick().await;

        let mut frame = Frame::from_rgba(self.config.width, self.config.height, self.render())
            .map_err(|e| CaptureError::Unsupported(e.to_string()))?;
        frame.frame_number = self.frame_number;
        frame.timestamp = Instant::now();
        self.frame_number += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        if !self.closed {
            log::info!("Test pattern closed after {} frames", self.frame_number);
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pattern_frames() {
        let mut source = TestPatternSource::new(8, 4, 240);
        let devices = source.enumerate().unwrap();
        assert_eq!(devices.len(), 1);

        let mut stream = source.open(&devices[0].id).await.unwrap();
        let first = stream.next_frame().await.unwrap();
        let second = stream.next_frame().await.unwrap();

        assert_eq!(first.width(), 8);
        assert_eq!(first.height(), 4);
        assert_eq!(first.as_bytes().len(), 8 * 4 * 4);
        assert_eq!(second.frame_number, first.frame_number + 1);
        assert!(first.pixels().iter().all(|p| p.a == 255));
    }

    #[tokio::test]
    async fn test_luminance_caps_channels() {
        let mut source = TestPatternSource::new(16, 16, 240).with_luminance(20);
        let mut stream = source.open(&DeviceId::default_device()).await.unwrap();
        let frame = stream.next_frame().await.unwrap();
        assert!(frame.pixels().iter().all(|p| p.r <= 20 && p.g <= 20 && p.b <= 20));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut source = TestPatternSource::new(2, 2, 240);
        let mut stream = source.open(&DeviceId::new(TEST_PATTERN_DEVICE)).await.unwrap();
        stream.close();
        stream.close();
        assert_eq!(stream.next_frame().await.unwrap_err(), CaptureError::Closed);
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let mut source = TestPatternSource::new(2, 2, 240);
        let result = source.open(&DeviceId::new("0")).await;
        assert!(matches!(result, Err(CaptureError::DeviceUnavailable(_))));
    }
}
