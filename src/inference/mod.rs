//! ML inference module
//!
//! Person segmentation and face landmark detection are consumed through two
//! narrow async traits. The [`InferenceGateway`] runs both against the same
//! frame concurrently and absorbs their failures.

pub mod gateway;
pub mod onnx;

pub use gateway::{InferenceGateway, InferenceOutcome};
pub use onnx::{OnnxFaceMesh, OnnxSegmenter};

use std::time::Duration;

use async_trait::async_trait;

use crate::frame::Frame;

/// Per-cycle inference failures. Never fatal to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InferenceError {
    #[error("model unavailable: {0}")]
    Unavailable(String),
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),
    #[error("inference failed: {0}")]
    Backend(String),
}

/// Per-pixel person mask, one entry per frame pixel (`true` = foreground)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentationMask {
    data: Vec<bool>,
}

impl SegmentationMask {
    pub fn new(data: Vec<bool>) -> Self {
        Self { data }
    }

    /// Mask marking every pixel as foreground
    pub fn all_foreground(pixel_count: usize) -> Self {
        Self {
            data: vec![true; pixel_count],
        }
    }

    /// Mask marking every pixel as background
    pub fn all_background(pixel_count: usize) -> Self {
        Self {
            data: vec![false; pixel_count],
        }
    }

    /// Threshold a probability map and resample it (nearest neighbour) to
    /// `width` x `height`.
    ///
    /// `probabilities` is row-major with `src_width * src_height` entries;
    /// missing entries count as background.
    pub fn from_probabilities(
        probabilities: &[f32],
        src_width: u32,
        src_height: u32,
        width: u32,
        height: u32,
        threshold: f32,
    ) -> Self {
        let mut data = vec![false; width as usize * height as usize];
        if src_width == 0 || src_height == 0 {
            return Self { data };
        }

        let x_ratio = src_width as f32 / width.max(1) as f32;
        let y_ratio = src_height as f32 / height.max(1) as f32;

        for y in 0..height {
            let src_y = ((y as f32 * y_ratio) as u32).min(src_height - 1);
            for x in 0..width {
                let src_x = ((x as f32 * x_ratio) as u32).min(src_width - 1);
                let src_idx = src_y as usize * src_width as usize + src_x as usize;
                let value = probabilities.get(src_idx).copied().unwrap_or(0.0);
                data[y as usize * width as usize + x as usize] = value >= threshold;
            }
        }

        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_foreground(&self, index: usize) -> bool {
        self.data.get(index).copied().unwrap_or(false)
    }

    pub fn as_slice(&self) -> &[bool] {
        &self.data
    }

    pub fn foreground_count(&self) -> usize {
        self.data.iter().filter(|&&fg| fg).count()
    }
}

/// A facial landmark in frame pixel coordinates
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
}

impl Landmark {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Landmarks of one detected face, in model order
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FaceLandmarkSet {
    pub points: Vec<Landmark>,
}

impl FaceLandmarkSet {
    pub fn new(points: Vec<Landmark>) -> Self {
        Self { points }
    }
}

/// Person segmentation model
#[async_trait]
pub trait Segmenter: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a mask with one entry per pixel of `frame`
    async fn segment(&self, frame: &Frame) -> Result<SegmentationMask, InferenceError>;
}

/// Face landmark model
#[async_trait]
pub trait FaceDetector: Send + Sync {
    fn name(&self) -> &str;

    /// Detect zero or more faces in `frame`
    async fn detect_faces(&self, frame: &Frame) -> Result<Vec<FaceLandmarkSet>, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_probabilities_upscales() {
        // 2x2 map: left column person, right column background
        let probs = [0.9, 0.1, 0.8, 0.2];
        let mask = SegmentationMask::from_probabilities(&probs, 2, 2, 4, 2, 0.5);

        assert_eq!(mask.len(), 8);
        assert_eq!(
            mask.as_slice(),
            &[true, true, false, false, true, true, false, false]
        );
        assert_eq!(mask.foreground_count(), 4);
    }

    #[test]
    fn test_from_probabilities_threshold_inclusive() {
        let mask = SegmentationMask::from_probabilities(&[0.5], 1, 1, 1, 1, 0.5);
        assert!(mask.is_foreground(0));
    }

    #[test]
    fn test_from_probabilities_short_input() {
        let mask = SegmentationMask::from_probabilities(&[1.0], 2, 2, 2, 2, 0.5);
        assert_eq!(mask.as_slice(), &[true, false, false, false]);
    }

    #[test]
    fn test_is_foreground_out_of_range() {
        let mask = SegmentationMask::all_foreground(3);
        assert!(mask.is_foreground(2));
        assert!(!mask.is_foreground(3));
        assert_eq!(SegmentationMask::all_background(3).foreground_count(), 0);
    }
}
