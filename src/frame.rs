//! Frame envelope and region-of-interest types shared across the pipeline.

use std::fmt;
use std::str::FromStr;

/// Pixel layout of a frame payload. Payloads are contiguous byte blocks with
/// no padding between rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale
    Mono8,
    /// 24-bit blue/green/red
    Bgr8,
    /// 24-bit red/green/blue
    Rgb8,
    /// 32-bit blue/green/red/alpha
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
            PixelFormat::Bgra8 => 4,
        }
    }
}

/// A borrowed frame delivered to observers.
///
/// The backing buffer is only guaranteed to stay valid for the synchronous
/// duration of the `on_frame` callback. Observers that need to retain pixel
/// data MUST copy it.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub width: i32,
    pub height: i32,
    pub format: PixelFormat,
    pub timestamp_ns: u64,
}

impl FrameView<'_> {
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Geometry of the frames a source produces, fixed for the duration of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageParams {
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    /// Payload size in bytes: `width * height * bytes_per_pixel`.
    pub frame_bytes: usize,
    /// Capacity of the frame rings, in frames.
    pub ring_capacity: usize,
}

impl ImageParams {
    pub fn mono8(width: usize, height: usize, ring_capacity: usize) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Mono8,
            frame_bytes: width * height,
            ring_capacity,
        }
    }
}

/// Axis-aligned region of interest in image coordinates.
///
/// All processing happens inside the ROI; pixels outside it are zeroed in the
/// output mask. The rectangle is live-editable and clipped to image bounds
/// before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// ROI covering the whole image.
    pub fn full(width: usize, height: usize) -> Self {
        Self {
            x: 0,
            y: 0,
            width: width as i32,
            height: height as i32,
        }
    }

    /// Intersect with the image bounds. The result may be empty.
    pub fn clip(self, image_width: usize, image_height: usize) -> Self {
        let x0 = self.x.clamp(0, image_width as i32);
        let y0 = self.y.clamp(0, image_height as i32);
        let x1 = (self.x + self.width).clamp(0, image_width as i32);
        let y1 = (self.y + self.height).clamp(0, image_height as i32);
        Self {
            x: x0,
            y: y0,
            width: (x1 - x0).max(0),
            height: (y1 - y0).max(0),
        }
    }

    pub fn area(self) -> i64 {
        self.width as i64 * self.height as i64
    }

    pub fn is_empty(self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for Roi {
    type Err = &'static str;

    /// Parses `"x,y,w,h"` decimal integers.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() != 4 {
            return Err("ROI must be four comma-separated integers");
        }
        let mut values = [0i32; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part
                .trim()
                .parse::<i32>()
                .map_err(|_| "ROI components must be decimal integers")?;
        }
        Ok(Roi::new(values[0], values[1], values[2], values[3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_keeps_inner_rect() {
        let roi = Roi::new(10, 5, 100, 50).clip(512, 96);
        assert_eq!(roi, Roi::new(10, 5, 100, 50));
    }

    #[test]
    fn clip_truncates_overhang() {
        let roi = Roi::new(500, 90, 100, 50).clip(512, 96);
        assert_eq!(roi, Roi::new(500, 90, 12, 6));
    }

    #[test]
    fn clip_negative_origin() {
        let roi = Roi::new(-10, -10, 30, 30).clip(512, 96);
        assert_eq!(roi, Roi::new(0, 0, 20, 20));
    }

    #[test]
    fn clip_disjoint_is_empty() {
        let roi = Roi::new(600, 0, 10, 10).clip(512, 96);
        assert!(roi.is_empty());
        assert_eq!(roi.area(), 0);
    }

    #[test]
    fn parse_roundtrip() {
        let roi: Roi = "4, 8, 100, 64".parse().unwrap();
        assert_eq!(roi, Roi::new(4, 8, 100, 64));
        assert_eq!(roi.to_string().parse::<Roi>().unwrap(), roi);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("1,2,3".parse::<Roi>().is_err());
        assert!("a,b,c,d".parse::<Roi>().is_err());
        assert!("1,2,3,4,5".parse::<Roi>().is_err());
    }

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(PixelFormat::Mono8.bytes_per_pixel(), 1);
        assert_eq!(PixelFormat::Bgr8.bytes_per_pixel(), 3);
        assert_eq!(PixelFormat::Bgra8.bytes_per_pixel(), 4);
    }
}
