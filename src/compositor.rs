//! Compositor
//!
//! Applies the segmentation mask (background darkening) and then the face
//! landmarks (skin brightening) to a frame in place. The mask pass always runs
//! to completion before the landmark pass, so a pixel touched by both ends up
//! brightened from its darkened value.

use crate::frame::{ContractViolation, Frame};
use crate::inference::{FaceLandmarkSet, SegmentationMask};

/// Summary of what one `apply` call changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompositeReport {
    /// Background pixels attenuated by the mask pass
    pub darkened: usize,
    /// Distinct pixels brightened by the landmark pass
    pub brightened: usize,
    /// Landmarks that fell outside the frame
    pub skipped_landmarks: usize,
    /// Set when the mask was rejected for this cycle
    pub violation: Option<ContractViolation>,
}

/// Mask and landmark effects
#[derive(Clone, Debug)]
pub struct Compositor {
    /// Multiplier for background R, G, B
    attenuation: f32,
    /// Multiplier for landmark pixel R, G, B (clamped at 255)
    landmark_gain: f32,
    /// Scratch list of landmark pixel indices, reused across cycles
    touched: Vec<usize>,
}

impl Default for Compositor {
    fn default() -> Self {
        Self::new(0.25, 1.2)
    }
}

impl Compositor {
    pub fn new(attenuation: f32, landmark_gain: f32) -> Self {
        Self {
            attenuation,
            landmark_gain,
            touched: Vec::new(),
        }
    }

    pub fn attenuation(&self) -> f32 {
        self.attenuation
    }

    pub fn landmark_gain(&self) -> f32 {
        self.landmark_gain
    }

    /// Composite one frame in place.
    ///
    /// A mask whose length does not match the frame's pixel count is not
    /// applied at all; the landmark pass still runs.
    pub fn apply(
        &mut self,
        frame: &mut Frame,
        mask: Option<&SegmentationMask>,
        faces: Option<&[FaceLandmarkSet]>,
    ) -> CompositeReport {
        let mut report = CompositeReport::default();

        if let Some(mask) = mask {
            match self.darken_background(frame, mask) {
                Ok(darkened) => report.darkened = darkened,
                Err(violation) => {
                    log::warn!("Skipping background pass for frame {}: {}", frame.frame_number, violation);
                    report.violation = Some(violation);
                }
            }
        }

        if let Some(faces) = faces {
            let (brightened, skipped) = self.brighten_landmarks(frame, faces);
            report.brightened = brightened;
            report.skipped_landmarks = skipped;
        }

        report
    }

    /// Scale R, G, B of every background pixel by the attenuation factor
    pub fn darken_background(
        &self,
        frame: &mut Frame,
        mask: &SegmentationMask,
    ) -> Result<usize, ContractViolation> {
        let expected = frame.pixel_count();
        if mask.len() != expected {
            return Err(ContractViolation::MaskLength {
                expected,
                actual: mask.len(),
            });
        }

        let mut darkened = 0;
        for (pixel, &foreground) in frame.pixels_mut().iter_mut().zip(mask.as_slice()) {
            if !foreground {
                pixel.scale_rgb(self.attenuation);
                darkened += 1;
            }
        }
        Ok(darkened)
    }

    /// Brighten the pixel under each landmark.
    ///
    /// Coordinates are floored; anything outside the frame is skipped. A
    /// pixel hit by several landmarks is brightened once. Returns
    /// `(brightened, skipped)`.
    pub fn brighten_landmarks(&mut self, frame: &mut Frame, faces: &[FaceLandmarkSet]) -> (usize, usize) {
        self.touched.clear();
        let mut skipped = 0;

        for point in faces.iter().flat_map(|face| face.points.iter()) {
            let x = point.x.floor();
            let y = point.y.floor();

            // NaN fails both comparisons and is skipped too
            let in_bounds = x >= 0.0 && y >= 0.0 && x < frame.width() as f32 && y < frame.height() as f32;
            match in_bounds.then(|| frame.index_of(x as u32, y as u32)).flatten() {
                Some(index) => self.touched.push(index),
                None => skipped += 1,
            }
        }

        self.touched.sort_unstable();
        self.touched.dedup();

        let pixels = frame.pixels_mut();
        for &index in &self.touched {
            pixels[index].scale_rgb(self.landmark_gain);
        }

        (self.touched.len(), skipped)
    }
}
