//! Brightness / flash controller
//!
//! Samples the composited frame, decides whether the scene is too dark, and
//! when it is, washes the frame with a translucent white overlay to simulate a
//! front flash. Runs strictly after the compositor.

use crate::frame::Frame;

/// Mean of `(R + G + B) / 3` over every `stride`-th pixel, starting at pixel 0.
///
/// Deterministic for a given frame and stride. An empty frame samples as 0.
pub fn sample_brightness(frame: &Frame, stride: usize) -> f32 {
    let stride = stride.max(1);
    let (sum, count) = frame
        .pixels()
        .iter()
        .step_by(stride)
        .fold((0.0f64, 0usize), |(sum, count), px| (sum + px.luma() as f64, count + 1));

    if count == 0 {
        0.0
    } else {
        (sum / count as f64) as f32
    }
}

/// Flash is on strictly below the threshold
pub fn decide_flash(brightness: f32, threshold: f32) -> bool {
    brightness < threshold
}

/// Blend a uniform white layer of the given opacity over R, G, B.
///
/// Alpha is left as is; frames are treated as opaque.
pub fn apply_flash_overlay(frame: &mut Frame, opacity: f32) {
    let opacity = opacity.clamp(0.0, 1.0);
    let keep = 1.0 - opacity;
    let white = 255.0 * opacity;

    let blend = |c: u8| (c as f32 * keep + white).round_ties_even().clamp(0.0, 255.0) as u8;
    for pixel in frame.pixels_mut() {
        pixel.r = blend(pixel.r);
        pixel.g = blend(pixel.g);
        pixel.b = blend(pixel.b);
    }
}

/// Outcome of one controller step
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlashDecision {
    pub brightness: f32,
    pub flash: bool,
    /// Flash state differs from the previous cycle
    pub changed: bool,
}

/// Session-scoped flash state
#[derive(Clone, Debug)]
pub struct FlashController {
    threshold: f32,
    opacity: f32,
    stride: usize,
    /// Decision of the previous cycle
    flash_on: bool,
}

impl Default for FlashController {
    fn default() -> Self {
        Self::new(40.0, 0.2, 100)
    }
}

impl FlashController {
    pub fn new(threshold: f32, opacity: f32, stride: usize) -> Self {
        Self {
            threshold,
            opacity,
            stride: stride.max(1),
            flash_on: false,
        }
    }

    /// Flash state decided by the most recent cycle
    pub fn is_flash_on(&self) -> bool {
        self.flash_on
    }

    /// Forget the previous decision (new session)
    pub fn reset(&mut self) {
        self.flash_on = false;
    }

    /// Sample the composited frame, update the flash state, and apply the
    /// overlay if the flash is on.
    ///
    /// Sampling happens before the overlay, so the overlay never feeds back
    /// into the next decision.
    pub fn process(&mut self, frame: &mut Frame) -> FlashDecision {
        let brightness = sample_brightness(frame, self.stride);
        let flash = decide_flash(brightness, self.threshold);
        let changed = flash != self.flash_on;

        if changed {
            log::info!(
                "Flash {} (brightness {:.1}, threshold {:.1})",
                if flash { "on" } else { "off" },
                brightness,
                self.threshold
            );
        }
        self.flash_on = flash;

        if flash {
            apply_flash_overlay(frame, self.opacity);
        }

        FlashDecision {
            brightness,
            flash,
            changed,
        }
    }
}
