use std::path::Path;

use image::{DynamicImage, ImageFormat, Rgb32FImage};

use crate::CompareError;
use crate::model::VisibilityMap;

pub const Y_COEFF_R: f32 = 0.2126;
pub const Y_COEFF_G: f32 = 0.7152;
pub const Y_COEFF_B: f32 = 0.0722;

/// Rec.709 relative luminance of a clamped RGB triple.
#[inline]
pub fn relative_luminance(rgb: [f32; 3]) -> f32 {
    Y_COEFF_R * clamp01(rgb[0]) + Y_COEFF_G * clamp01(rgb[1]) + Y_COEFF_B * clamp01(rgb[2])
}

pub fn load_rgb(path: &Path) -> Result<Rgb32FImage, CompareError> {
    let image = image::open(path)?;
    Ok(from_dynamic(image))
}

/// Converts any decoded image to clamped linear-range RGB floats. Luma
/// sources end up with equal channels.
pub fn from_dynamic(image: DynamicImage) -> Rgb32FImage {
    let mut rgb = image.to_rgb32f();
    for value in rgb.iter_mut() {
        *value = clamp01(*value);
    }
    rgb
}

pub fn save_visibility(
    map: &VisibilityMap,
    output_path: &Path,
    format: ImageFormat,
) -> Result<(), CompareError> {
    map.to_luma8()
        .save_with_format(output_path, format)
        .map_err(CompareError::from)
}

fn clamp01(value: f32) -> f32 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn luminance_weights_sum_to_one() {
        assert!((relative_luminance([1.0, 1.0, 1.0]) - 1.0).abs() < 1e-6);
        assert_eq!(relative_luminance([0.0, 0.0, 0.0]), 0.0);
        assert!((relative_luminance([0.0, 1.0, 0.0]) - Y_COEFF_G).abs() < 1e-6);
    }

    #[test]
    fn luminance_clamps_out_of_range_input() {
        assert_eq!(relative_luminance([2.0, 2.0, 2.0]), relative_luminance([1.0; 3]));
        assert_eq!(relative_luminance([-1.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn luma_source_becomes_grey_rgb() {
        let gray = GrayImage::from_pixel(2, 2, Luma([51u8]));
        let rgb = from_dynamic(DynamicImage::ImageLuma8(gray));
        assert_eq!(rgb.dimensions(), (2, 2));
        for px in rgb.pixels() {
            assert!((px[0] - 0.2).abs() < 1e-6);
            assert_eq!(px[0], px[1]);
            assert_eq!(px[1], px[2]);
        }
    }
}
