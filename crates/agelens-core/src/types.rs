use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Channel layout of an 8-bit interleaved pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    Gray,
    Rgb,
    Rgba,
    Bgr,
    Bgra,
}

impl PixelLayout {
    /// Bytes per pixel.
    pub fn channels(self) -> usize {
        match self {
            PixelLayout::Gray => 1,
            PixelLayout::Rgb | PixelLayout::Bgr => 3,
            PixelLayout::Rgba | PixelLayout::Bgra => 4,
        }
    }

    /// Byte offsets of the red, green and blue samples within one pixel.
    ///
    /// Grayscale has a single sample, so all three offsets are 0.
    pub fn rgb_offsets(self) -> [usize; 3] {
        match self {
            PixelLayout::Gray => [0, 0, 0],
            PixelLayout::Rgb | PixelLayout::Rgba => [0, 1, 2],
            PixelLayout::Bgr | PixelLayout::Bgra => [2, 1, 0],
        }
    }
}

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image dimensions must be non-zero, got {width}x{height}")]
    ZeroDimensions { width: u32, height: u32 },
    #[error("pixel buffer length mismatch: expected {expected} bytes, got {actual}")]
    BufferLength { expected: usize, actual: usize },
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// An immutable interleaved 8-bit image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    data: Vec<u8>,
    width: u32,
    height: u32,
    layout: PixelLayout,
}

impl Image {
    pub fn new(data: Vec<u8>, width: u32, height: u32, layout: PixelLayout) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::ZeroDimensions { width, height });
        }
        let expected = width as usize * height as usize * layout.channels();
        if data.len() != expected {
            return Err(ImageError::BufferLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
        })
    }

    /// Decode an encoded picture (PNG, JPEG, ...) into an RGBA buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        let rgba = image::load_from_memory(bytes)?.to_rgba8();
        let (width, height) = rgba.dimensions();
        Self::new(rgba.into_raw(), width, height, PixelLayout::Rgba)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn channels(&self) -> usize {
        self.layout.channels()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Convert to 8-bit luma with the fixed-point BT.601 weights.
    pub fn to_luma(&self) -> Vec<u8> {
        let channels = self.channels();
        if self.layout == PixelLayout::Gray {
            return self.data.clone();
        }
        let [r, g, b] = self.layout.rgb_offsets();
        self.data
            .chunks_exact(channels)
            .map(|px| {
                let y = px[r] as u32 * 4899 + px[g] as u32 * 9617 + px[b] as u32 * 1868 + 8192;
                (y >> 14) as u8
            })
            .collect()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid face region {region} for {image_width}x{image_height} image: {reason}")]
pub struct InvalidRegion {
    pub region: FaceRegion,
    pub image_width: u32,
    pub image_height: u32,
    pub reason: &'static str,
}

/// Integer face rectangle in image pixel coordinates.
///
/// Coordinates are signed so that malformed input can be represented and
/// rejected by [`FaceRegion::validate`] instead of wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceRegion {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Check the region lies fully inside an image of the given size.
    pub fn validate(&self, image_width: u32, image_height: u32) -> Result<(), InvalidRegion> {
        let fail = |reason| InvalidRegion {
            region: *self,
            image_width,
            image_height,
            reason,
        };
        if self.width <= 0 || self.height <= 0 {
            return Err(fail("width and height must be positive"));
        }
        if self.x < 0 || self.y < 0 {
            return Err(fail("origin must be non-negative"));
        }
        if self.x as i64 + self.width as i64 > image_width as i64
            || self.y as i64 + self.height as i64 > image_height as i64
        {
            return Err(fail("region exceeds image bounds"));
        }
        Ok(())
    }
}

impl fmt::Display for FaceRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}x{})", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for FaceRegion {
    type Err = String;

    /// Parse `x,y,width,height`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [x, y, w, h] = parts[..] else {
            return Err(format!("expected x,y,width,height, got {s:?}"));
        };
        let parse = |v: &str| v.parse::<i32>().map_err(|e| format!("{v:?}: {e}"));
        Ok(Self::new(parse(x)?, parse(y)?, parse(w)?, parse(h)?))
    }
}

/// Network input: a batch-of-one planar float tensor (N, C, H, W).
#[derive(Debug, Clone)]
pub struct Tensor(Array4<f32>);

impl Tensor {
    pub(crate) fn from_array(array: Array4<f32>) -> Self {
        Self(array)
    }

    /// An all-zero tensor of the given shape.
    pub fn zeros(channels: usize, height: usize, width: usize) -> Self {
        Self(Array4::zeros((1, channels, height, width)))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    /// Arithmetic mean of one channel plane.
    pub fn channel_mean(&self, channel: usize) -> f32 {
        let plane = self.0.index_axis(ndarray::Axis(1), channel);
        let sum: f64 = plane.iter().map(|&v| v as f64).sum();
        (sum / plane.len() as f64) as f32
    }
}

/// Raw per-class network output, in class-index order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreVector(Vec<f32>);

impl ScoreVector {
    pub fn new(scores: Vec<f32>) -> Self {
        Self(scores)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Index of the maximum score from a single left-to-right scan.
    ///
    /// Only a strictly greater score replaces the current best, so the lowest
    /// index wins ties. Returns `None` for an empty vector or any NaN.
    pub fn argmax(&self) -> Option<usize> {
        let (first, rest) = self.0.split_first()?;
        if self.0.iter().any(|s| s.is_nan()) {
            return None;
        }
        let mut best_idx = 0;
        let mut best = *first;
        for (i, &score) in rest.iter().enumerate() {
            if score > best {
                best = score;
                best_idx = i + 1;
            }
        }
        Some(best_idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_rejects_zero_dimensions() {
        let result = Image::new(vec![], 0, 10, PixelLayout::Gray);
        assert!(matches!(result, Err(ImageError::ZeroDimensions { .. })));
    }

    #[test]
    fn test_image_rejects_short_buffer() {
        let result = Image::new(vec![0u8; 11], 2, 2, PixelLayout::Rgb);
        assert!(matches!(
            result,
            Err(ImageError::BufferLength { expected: 12, actual: 11 })
        ));
    }

    #[test]
    fn test_image_decode_png() {
        let mut png = Vec::new();
        let src = image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        image::DynamicImage::ImageRgb8(src)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let img = Image::decode(&png).unwrap();
        assert_eq!((img.width(), img.height()), (3, 2));
        assert_eq!(img.layout(), PixelLayout::Rgba);
        assert_eq!(&img.data()[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_image_decode_garbage() {
        assert!(matches!(Image::decode(b"not an image"), Err(ImageError::Decode(_))));
    }

    #[test]
    fn test_luma_weights() {
        // Pure white stays white, pure black stays black.
        let img = Image::new(vec![255, 255, 255, 255, 0, 0, 0, 255], 2, 1, PixelLayout::Rgba).unwrap();
        assert_eq!(img.to_luma(), vec![255, 0]);

        // Red and blue swap weights between RGB and BGR layouts.
        let rgb = Image::new(vec![200, 0, 0], 1, 1, PixelLayout::Rgb).unwrap();
        let bgr = Image::new(vec![200, 0, 0], 1, 1, PixelLayout::Bgr).unwrap();
        assert_eq!(rgb.to_luma(), vec![60]); // 200 * 0.299
        assert_eq!(bgr.to_luma(), vec![23]); // 200 * 0.114
    }

    #[test]
    fn test_region_validate_ok() {
        assert!(FaceRegion::new(0, 0, 10, 10).validate(10, 10).is_ok());
        assert!(FaceRegion::new(5, 3, 5, 7).validate(10, 10).is_ok());
    }

    #[test]
    fn test_region_validate_rejects() {
        assert!(FaceRegion::new(0, 0, -5, 10).validate(100, 100).is_err());
        assert!(FaceRegion::new(0, 0, 10, 0).validate(100, 100).is_err());
        assert!(FaceRegion::new(-1, 0, 10, 10).validate(100, 100).is_err());
        assert!(FaceRegion::new(95, 0, 10, 10).validate(100, 100).is_err());
        assert!(FaceRegion::new(0, 91, 10, 10).validate(100, 100).is_err());
        assert!(FaceRegion::new(i32::MAX, 0, i32::MAX, 1).validate(100, 100).is_err());
    }

    #[test]
    fn test_region_from_str() {
        let r: FaceRegion = "20, 0,50,70".parse().unwrap();
        assert_eq!(r, FaceRegion::new(20, 0, 50, 70));
        assert!("1,2,3".parse::<FaceRegion>().is_err());
        assert!("a,b,c,d".parse::<FaceRegion>().is_err());
    }

    #[test]
    fn test_argmax_unique_maximum() {
        let s = ScoreVector::new(vec![0.1, 0.05, 0.6, 0.05, 0.05, 0.05, 0.05, 0.05]);
        assert_eq!(s.argmax(), Some(2));
    }

    #[test]
    fn test_argmax_tie_keeps_lowest_index() {
        let s = ScoreVector::new(vec![0.1, 0.5, 0.1, 0.1, 0.5, 0.1, 0.05, 0.05]);
        assert_eq!(s.argmax(), Some(1));
    }

    #[test]
    fn test_argmax_empty_and_nan() {
        assert_eq!(ScoreVector::new(vec![]).argmax(), None);
        assert_eq!(ScoreVector::new(vec![0.2, f32::NAN]).argmax(), None);
    }

    #[test]
    fn test_argmax_negative_scores() {
        let s = ScoreVector::new(vec![-3.0, -1.0, -2.0]);
        assert_eq!(s.argmax(), Some(1));
    }
}
