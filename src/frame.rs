//! Frame buffer
//!
//! A single RGBA8 video frame. The pipeline owns one of these exclusively for
//! the duration of a processing cycle; the buffer length is always
//! `width * height * 4`.

use std::time::Instant;

use bytemuck::{Pod, Zeroable};

/// Bytes per interleaved RGBA8 pixel
pub const BYTES_PER_PIXEL: usize = 4;

/// One RGBA8 pixel, castable from the raw byte buffer
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Mean of the colour channels, alpha ignored
    pub fn luma(&self) -> f32 {
        (self.r as f32 + self.g as f32 + self.b as f32) / 3.0
    }

    /// Scale the colour channels by `factor`, rounding half to even and
    /// clamping to 0..=255
    pub fn scale_rgb(&mut self, factor: f32) {
        self.r = scale_channel(self.r, factor);
        self.g = scale_channel(self.g, factor);
        self.b = scale_channel(self.b, factor);
    }
}

/// Scale one channel value, rounding half to even and clamping
#[inline]
pub fn scale_channel(value: u8, factor: f32) -> u8 {
    (value as f32 * factor).round_ties_even().clamp(0.0, 255.0) as u8
}

/// Errors raised when a frame is built from a buffer of the wrong size
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    #[error("mask has {actual} entries but frame has {expected} pixels")]
    MaskLength { expected: usize, actual: usize },
    #[error("pixel buffer has {actual} bytes, expected {expected}")]
    BufferLength { expected: usize, actual: usize },
}

/// Captured video frame
#[derive(Clone, Debug)]
pub struct Frame {
    /// RGBA pixel data
    data: Vec<u8>,
    /// Frame width
    width: u32,
    /// Frame height
    height: u32,
    /// Sequence number assigned by the capture stream
    pub frame_number: u64,
    /// Capture timestamp
    pub timestamp: Instant,
}

impl Frame {
    /// Wrap an RGBA buffer, checking that its length matches the dimensions
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ContractViolation> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if data.len() != expected {
            return Err(ContractViolation::BufferLength {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            width,
            height,
            frame_number: 0,
            timestamp: Instant::now(),
        })
    }

    /// Create a frame filled with a single colour
    pub fn filled(width: u32, height: u32, color: Rgba) -> Self {
        let pixel_count = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixel_count * BYTES_PER_PIXEL);
        for _ in 0..pixel_count {
            data.extend_from_slice(&[color.r, color.g, color.b, color.a]);
        }

        Self {
            data,
            width,
            height,
            frame_number: 0,
            timestamp: Instant::now(),
        }
    }

    /// Tag the frame with its capture sequence number
    pub fn with_frame_number(mut self, frame_number: u64) -> Self {
        self.frame_number = frame_number;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Number of pixels (not bytes)
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Raw interleaved RGBA bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn pixels(&self) -> &[Rgba] {
        bytemuck::cast_slice(&self.data)
    }

    pub fn pixels_mut(&mut self) -> &mut [Rgba] {
        bytemuck::cast_slice_mut(&mut self.data)
    }

    /// Pixel at integer coordinates, `None` when out of bounds
    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        self.index_of(x, y).map(|i| self.pixels()[i])
    }

    /// Linear pixel index for `(x, y)` if it lies inside the frame
    pub fn index_of(&self, x: u32, y: u32) -> Option<usize> {
        if x < self.width && y < self.height {
            Some(y as usize * self.width as usize + x as usize)
        } else {
            None
        }
    }

    /// Nearest-neighbour resample into a tightly packed RGBA buffer.
    ///
    /// Used to feed fixed-size model inputs.
    pub fn downscale(&self, target_width: u32, target_height: u32) -> Vec<u8> {
        if self.width == target_width && self.height == target_height {
            return self.data.clone();
        }

        let mut output = vec![0u8; target_width as usize * target_height as usize * BYTES_PER_PIXEL];
        if self.width == 0 || self.height == 0 {
            return output;
        }

        let x_ratio = self.width as f32 / target_width as f32;
        let y_ratio = self.height as f32 / target_height as f32;

        for y in 0..target_height {
            for x in 0..target_width {
                let src_x = ((x as f32 * x_ratio) as u32).min(self.width - 1);
                let src_y = ((y as f32 * y_ratio) as u32).min(self.height - 1);
                let src_idx = (src_y as usize * self.width as usize + src_x as usize) * BYTES_PER_PIXEL;
                let dst_idx = (y as usize * target_width as usize + x as usize) * BYTES_PER_PIXEL;

                output[dst_idx..dst_idx + BYTES_PER_PIXEL]
                    .copy_from_slice(&self.data[src_idx..src_idx + BYTES_PER_PIXEL]);
            }
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgba_checks_length() {
        assert!(Frame::from_rgba(2, 2, vec![0; 16]).is_ok());

        let err = Frame::from_rgba(2, 2, vec![0; 15]).unwrap_err();
        assert_eq!(
            err,
            ContractViolation::BufferLength {
                expected: 16,
                actual: 15
            }
        );
    }

    #[test]
    fn test_pixel_access() {
        let mut frame = Frame::filled(3, 2, Rgba::new(1, 2, 3, 255));
        assert_eq!(frame.pixel_count(), 6);
        assert_eq!(frame.as_bytes().len(), 24);

        frame.pixels_mut()[4] = Rgba::new(9, 8, 7, 6);
        assert_eq!(frame.pixel(1, 1), Some(Rgba::new(9, 8, 7, 6)));
        assert_eq!(frame.pixel(3, 0), None);
        assert_eq!(frame.pixel(0, 2), None);
        assert_eq!(&frame.as_bytes()[16..20], &[9, 8, 7, 6]);
    }

    #[test]
    fn test_scale_channel_clamps() {
        assert_eq!(scale_channel(200, 0.25), 50);
        assert_eq!(scale_channel(250, 1.2), 255);
        assert_eq!(scale_channel(100, 1.2), 120);
        assert_eq!(scale_channel(0, 1.2), 0);
    }

    #[test]
    fn test_scale_channel_rounds_half_to_even() {
        // 0.5, 2.5 and 1.5 after attenuation
        assert_eq!(scale_channel(2, 0.25), 0);
        assert_eq!(scale_channel(10, 0.25), 2);
        assert_eq!(scale_channel(6, 0.25), 2);
        assert_eq!(scale_channel(18, 0.25), 4);

        let mut pixel = Rgba::new(2, 10, 6, 255);
        pixel.scale_rgb(0.25);
        assert_eq!(pixel, Rgba::new(0, 2, 2, 255));
    }

    #[test]
    fn test_downscale() {
        let mut frame = Frame::filled(4, 4, Rgba::new(0, 0, 0, 255));
        frame.pixels_mut()[0] = Rgba::new(255, 0, 0, 255);

        let small = frame.downscale(2, 2);
        assert_eq!(small.len(), 16);
        assert_eq!(&small[0..4], &[255, 0, 0, 255]);
        assert_eq!(&small[4..8], &[0, 0, 0, 255]);

        let same = frame.downscale(4, 4);
        assert_eq!(same, frame.as_bytes());
    }
}
