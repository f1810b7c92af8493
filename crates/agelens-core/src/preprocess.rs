//! Face crop → network input tensor.
//!
//! Order matters: crop, bilinear resize to 227×227, channel reorder, then
//! per-channel mean subtraction into a planar tensor. Swapping any two steps
//! changes the numeric result.

use crate::types::{FaceRegion, Image, InvalidRegion, Tensor};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

// --- Named constants ---
pub const INPUT_SIZE: usize = 227;
pub const INPUT_CHANNELS: usize = 3;
const MEAN_BLUE: f32 = 114.895_847_746;
const MEAN_GREEN: f32 = 87.768_914_374_4;
const MEAN_RED: f32 = 78.426_337_760_3;

/// Channel order the network was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    #[default]
    Bgr,
    Rgb,
}

/// Per-channel constants subtracted from raw 0–255 samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelMeans {
    pub blue: f32,
    pub green: f32,
    pub red: f32,
}

impl Default for ChannelMeans {
    fn default() -> Self {
        Self {
            blue: MEAN_BLUE,
            green: MEAN_GREEN,
            red: MEAN_RED,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub channel_order: ChannelOrder,
    pub means: ChannelMeans,
}

impl PreprocessConfig {
    /// Source RGB index (0=red, 1=green, 2=blue) and mean for each tensor channel.
    fn plan(&self) -> [(usize, f32); 3] {
        let red = (0, self.means.red);
        let green = (1, self.means.green);
        let blue = (2, self.means.blue);
        match self.channel_order {
            ChannelOrder::Bgr => [blue, green, red],
            ChannelOrder::Rgb => [red, green, blue],
        }
    }
}

/// Crop `region` out of `image` and build the network input tensor.
pub fn preprocess(image: &Image, region: &FaceRegion, config: &PreprocessConfig) -> Result<Tensor, InvalidRegion> {
    region.validate(image.width(), image.height())?;

    let channels = image.channels();
    let crop = crop(image, region);
    let resized = resize_bilinear(
        &crop,
        region.width as usize,
        region.height as usize,
        channels,
        INPUT_SIZE,
        INPUT_SIZE,
    );

    let offsets = image.layout().rgb_offsets();
    let plan = config.plan();
    let mut tensor = Array4::<f32>::zeros((1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE));

    for y in 0..INPUT_SIZE {
        for x in 0..INPUT_SIZE {
            let px = &resized[(y * INPUT_SIZE + x) * channels..][..channels];
            for (c, &(rgb, mean)) in plan.iter().enumerate() {
                tensor[[0, c, y, x]] = px[offsets[rgb]] as f32 - mean;
            }
        }
    }

    tracing::trace!(%region, layout = ?image.layout(), "preprocessed face crop");
    Ok(Tensor::from_array(tensor))
}

/// Copy the pixels of a validated region into a tightly packed buffer.
fn crop(image: &Image, region: &FaceRegion) -> Vec<u8> {
    let channels = image.channels();
    let stride = image.width() as usize * channels;
    let (x, y) = (region.x as usize, region.y as usize);
    let (w, h) = (region.width as usize, region.height as usize);

    let mut out = Vec::with_capacity(w * h * channels);
    for row in y..y + h {
        let start = row * stride + x * channels;
        out.extend_from_slice(&image.data()[start..start + w * channels]);
    }
    out
}

/// Bilinear resize of an interleaved 8-bit buffer.
///
/// Samples at pixel centers, replicates edge pixels and rounds back to 8 bits.
pub(crate) fn resize_bilinear(
    src: &[u8],
    width: usize,
    height: usize,
    channels: usize,
    new_w: usize,
    new_h: usize,
) -> Vec<u8> {
    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;
    let mut out = vec![0u8; new_w * new_h * channels];

    for y in 0..new_h {
        let src_y = ((y as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (src_y.floor() as usize).min(height - 1);
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - y0 as f32).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = ((x as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (src_x.floor() as usize).min(width - 1);
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - x0 as f32).clamp(0.0, 1.0);

            for c in 0..channels {
                let tl = src[(y0 * width + x0) * channels + c] as f32;
                let tr = src[(y0 * width + x1) * channels + c] as f32;
                let bl = src[(y1 * width + x0) * channels + c] as f32;
                let br = src[(y1 * width + x1) * channels + c] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                out[(y * new_w + x) * channels + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelLayout;

    fn solid(width: u32, height: u32, layout: PixelLayout, px: &[u8]) -> Image {
        let data = px.iter().copied().cycle().take(width as usize * height as usize * px.len()).collect();
        Image::new(data, width, height, layout).unwrap()
    }

    #[test]
    fn test_zero_crop_channel_means_are_negated_constants() {
        let image = solid(227, 227, PixelLayout::Rgb, &[0, 0, 0]);
        let region = FaceRegion::new(0, 0, 227, 227);
        let tensor = preprocess(&image, &region, &PreprocessConfig::default()).unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 227, 227]);
        assert!((tensor.channel_mean(0) + 114.895_85).abs() < 1e-3, "blue {}", tensor.channel_mean(0));
        assert!((tensor.channel_mean(1) + 87.768_91).abs() < 1e-3, "green {}", tensor.channel_mean(1));
        assert!((tensor.channel_mean(2) + 78.426_34).abs() < 1e-3, "red {}", tensor.channel_mean(2));
    }

    #[test]
    fn test_shape_invariant_for_any_region_size() {
        let image = solid(400, 300, PixelLayout::Rgba, &[10, 20, 30, 255]);
        for region in [
            FaceRegion::new(0, 0, 1, 1),
            FaceRegion::new(5, 7, 3, 290),
            FaceRegion::new(100, 50, 65, 65),
            FaceRegion::new(0, 0, 400, 300),
        ] {
            let tensor = preprocess(&image, &region, &PreprocessConfig::default()).unwrap();
            assert_eq!(tensor.shape(), &[1, INPUT_CHANNELS, INPUT_SIZE, INPUT_SIZE], "region {region}");
        }
    }

    #[test]
    fn test_rgba_input_reordered_to_bgr() {
        let image = solid(50, 50, PixelLayout::Rgba, &[10, 20, 30, 255]);
        let region = FaceRegion::new(10, 10, 20, 20);
        let tensor = preprocess(&image, &region, &PreprocessConfig::default()).unwrap();
        let t = tensor.view();

        assert!((t[[0, 0, 100, 100]] - (30.0 - MEAN_BLUE)).abs() < 1e-4);
        assert!((t[[0, 1, 100, 100]] - (20.0 - MEAN_GREEN)).abs() < 1e-4);
        assert!((t[[0, 2, 100, 100]] - (10.0 - MEAN_RED)).abs() < 1e-4);
    }

    #[test]
    fn test_bgr_input_keeps_order() {
        let image = solid(8, 8, PixelLayout::Bgr, &[30, 20, 10]);
        let region = FaceRegion::new(0, 0, 8, 8);
        let tensor = preprocess(&image, &region, &PreprocessConfig::default()).unwrap();
        let t = tensor.view();

        assert!((t[[0, 0, 0, 0]] - (30.0 - MEAN_BLUE)).abs() < 1e-4);
        assert!((t[[0, 2, 0, 0]] - (10.0 - MEAN_RED)).abs() < 1e-4);
    }

    #[test]
    fn test_rgb_channel_order_option() {
        let image = solid(8, 8, PixelLayout::Rgba, &[10, 20, 30, 255]);
        let region = FaceRegion::new(0, 0, 8, 8);
        let config = PreprocessConfig {
            channel_order: ChannelOrder::Rgb,
            means: ChannelMeans { blue: 0.0, green: 0.0, red: 0.0 },
        };
        let tensor = preprocess(&image, &region, &config).unwrap();
        let t = tensor.view();

        assert_eq!(t[[0, 0, 3, 3]], 10.0);
        assert_eq!(t[[0, 1, 3, 3]], 20.0);
        assert_eq!(t[[0, 2, 3, 3]], 30.0);
    }

    #[test]
    fn test_gray_input_replicated() {
        let image = solid(16, 16, PixelLayout::Gray, &[100]);
        let region = FaceRegion::new(2, 2, 10, 10);
        let config = PreprocessConfig {
            means: ChannelMeans { blue: 0.0, green: 0.0, red: 0.0 },
            ..Default::default()
        };
        let tensor = preprocess(&image, &region, &config).unwrap();
        for c in 0..3 {
            assert!((tensor.channel_mean(c) - 100.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_no_clamping_or_scaling() {
        let image = solid(4, 4, PixelLayout::Rgb, &[255, 255, 255]);
        let region = FaceRegion::new(0, 0, 4, 4);
        let tensor = preprocess(&image, &region, &PreprocessConfig::default()).unwrap();
        // 255 - 78.43 is far outside [0, 1].
        assert!((tensor.view()[[0, 2, 0, 0]] - (255.0 - MEAN_RED)).abs() < 1e-4);
    }

    #[test]
    fn test_crop_selects_region_pixels() {
        // Left half red, right half blue; crop the right half only.
        let (w, h) = (20u32, 10u32);
        let data: Vec<u8> = (0..(w * h) as usize)
            .flat_map(|i| if (i as u32 % w) < 10 { [255, 0, 0] } else { [0, 0, 255] })
            .collect();
        let image = Image::new(data, w, h, PixelLayout::Rgb).unwrap();
        let config = PreprocessConfig {
            means: ChannelMeans { blue: 0.0, green: 0.0, red: 0.0 },
            ..Default::default()
        };
        let tensor = preprocess(&image, &FaceRegion::new(10, 0, 10, 10), &config).unwrap();

        assert!((tensor.channel_mean(0) - 255.0).abs() < 1e-4); // blue
        assert!(tensor.channel_mean(2).abs() < 1e-4); // red
    }

    #[test]
    fn test_invalid_region_rejected() {
        let image = solid(50, 50, PixelLayout::Rgb, &[0, 0, 0]);
        let config = PreprocessConfig::default();
        assert!(preprocess(&image, &FaceRegion::new(0, 0, -5, 10), &config).is_err());
        assert!(preprocess(&image, &FaceRegion::new(-1, 0, 10, 10), &config).is_err());
        assert!(preprocess(&image, &FaceRegion::new(45, 45, 10, 10), &config).is_err());
    }

    #[test]
    fn test_preprocess_deterministic() {
        let data: Vec<u8> = (0..64 * 48 * 3).map(|i| (i * 7 % 251) as u8).collect();
        let image = Image::new(data, 64, 48, PixelLayout::Rgb).unwrap();
        let region = FaceRegion::new(3, 5, 40, 33);
        let a = preprocess(&image, &region, &PreprocessConfig::default()).unwrap();
        let b = preprocess(&image, &region, &PreprocessConfig::default()).unwrap();
        assert_eq!(a.view(), b.view());
    }

    #[test]
    fn test_bilinear_resize_uniform() {
        let src = vec![128u8; 100 * 100];
        let out = resize_bilinear(&src, 100, 100, 1, 200, 200);
        assert!(out.iter().all(|&p| p == 128), "uniform resize should stay uniform");
    }

    #[test]
    fn test_bilinear_resize_identity() {
        let src: Vec<u8> = (0..5 * 4 * 3).map(|i| i as u8).collect();
        assert_eq!(resize_bilinear(&src, 5, 4, 3, 5, 4), src);
    }

    #[test]
    fn test_bilinear_resize_interpolates() {
        // 2x1 -> 4x1: centers map to -0.25, 0.25, 0.75, 1.25 in source space.
        let out = resize_bilinear(&[0, 100], 2, 1, 1, 4, 1);
        assert_eq!(out, vec![0, 25, 75, 100]);
    }
}
