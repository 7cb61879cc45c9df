use std::f32::consts::PI;

use crate::csf::{REFERENCE_LUMINANCE, csf, csf_max};
use crate::params::ViewingParameters;

/// Number of luminance pyramid layers and CSF bands.
pub const NUM_BANDS: usize = 8;

/// Blur passes needed to fill every pyramid layer after the first.
pub const NUM_BLUR_LEVELS: usize = NUM_BANDS - 1;

/// Bands that carry a detection threshold. The two coarsest bands have none
/// and never enter the compose weighting.
pub const NUM_THRESHOLD_BANDS: usize = NUM_BANDS - 2;

/// Row-major `f32` map, one value per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    values: Vec<f32>,
}

impl Plane {
    pub fn zeroed(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            values: vec![0.0; width * height],
        }
    }

    /// Wraps an existing buffer; `None` when its length is not `width * height`.
    pub fn from_vec(width: usize, height: usize, values: Vec<f32>) -> Option<Self> {
        (width.checked_mul(height) == Some(values.len())).then_some(Self {
            width,
            height,
            values,
        })
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.values[y * self.width + x]
    }

    pub fn pixels(&self) -> &[f32] {
        &self.values
    }

    pub fn pixels_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }
}

/// One pyramid texel: signed luminance difference `Y_A - Y_B` and mean
/// luminance `(Y_A + Y_B) / 2`, blurred together.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LumTexel {
    pub diff: f32,
    pub mean: f32,
}

/// `NUM_BANDS` layers of `width * height` texels stored layer-major.
#[derive(Debug, Clone, PartialEq)]
pub struct LuminancePyramid {
    pub width: usize,
    pub height: usize,
    pub texels: Vec<LumTexel>,
}

impl LuminancePyramid {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            texels: vec![LumTexel::default(); width * height * NUM_BANDS],
        }
    }

    #[inline]
    pub fn layer_len(&self) -> usize {
        self.width * self.height
    }

    pub fn layer(&self, level: usize) -> &[LumTexel] {
        let len = self.layer_len();
        &self.texels[level * len..(level + 1) * len]
    }

    pub fn layer_mut(&mut self, level: usize) -> &mut [LumTexel] {
        let len = self.layer_len();
        &mut self.texels[level * len..(level + 1) * len]
    }

    /// Layer `level` for reading and layer `level + 1` for writing.
    pub fn split_level(&mut self, level: usize) -> (&[LumTexel], &mut [LumTexel]) {
        let len = self.layer_len();
        let (head, tail) = self.texels.split_at_mut((level + 1) * len);
        (&head[level * len..], &mut tail[..len])
    }
}

/// Final per-pixel visibility in `[0, 1]`; 1 means at least one
/// just-noticeable difference.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityMap {
    plane: Plane,
}

impl VisibilityMap {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            plane: Plane::zeroed(width, height),
        }
    }

    pub fn from_plane(plane: Plane) -> Self {
        Self { plane }
    }

    pub fn width(&self) -> usize {
        self.plane.width
    }

    pub fn height(&self) -> usize {
        self.plane.height
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.plane.get(x, y)
    }

    pub fn pixels(&self) -> &[f32] {
        self.plane.pixels()
    }

    pub fn pixels_mut(&mut self) -> &mut [f32] {
        self.plane.pixels_mut()
    }

    /// Quantises to 8 bits, rounding to nearest.
    pub fn to_luma8(&self) -> image::GrayImage {
        image::GrayImage::from_fn(self.width() as u32, self.height() as u32, |x, y| {
            let value = self.get(x as usize, y as usize).clamp(0.0, 1.0);
            image::Luma([(value * 255.0 + 0.5).floor() as u8])
        })
    }
}

/// Per-frame scalars derived from the viewing geometry and image width.
///
/// Recomputed from scratch every frame; callers get a fresh value and can
/// not mutate the tables in place.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedParams {
    pub image_width: usize,
    pub image_height: usize,
    pub field_of_view_degrees: f32,
    pub color_factor: f32,
    pub num_one_degree_pixels: f32,
    pub pixels_per_degree: f32,
    pub cpd: [f32; NUM_BANDS],
    /// Detection thresholds for bands `0..NUM_THRESHOLD_BANDS`. `+inf` where
    /// the band is too fine to be seen at all.
    pub frq: [Option<f32>; NUM_BANDS],
    pub adaptation_level: usize,
}

impl DerivedParams {
    /// Returns `None` for an empty image, in which case the frame is skipped.
    pub fn compute(width: usize, height: usize, viewing: &ViewingParameters) -> Option<Self> {
        if width == 0 || height == 0 {
            return None;
        }

        let fov = viewing.field_of_view_degrees();
        let num_one_degree_pixels = num_one_degree_pixels(fov);
        let pixels_per_degree = width as f32 / num_one_degree_pixels;

        let mut cpd = [0.0f32; NUM_BANDS];
        cpd[0] = 0.5 * pixels_per_degree;
        for i in 1..NUM_BANDS {
            cpd[i] = 0.5 * cpd[i - 1];
        }

        let peak = csf_max();
        let mut frq = [None; NUM_BANDS];
        for i in 0..NUM_THRESHOLD_BANDS {
            frq[i] = Some(peak / csf(cpd[i], REFERENCE_LUMINANCE));
        }

        Some(Self {
            image_width: width,
            image_height: height,
            field_of_view_degrees: fov,
            color_factor: viewing.color_factor(),
            num_one_degree_pixels,
            pixels_per_degree,
            cpd,
            frq,
            adaptation_level: adaptation_level(num_one_degree_pixels),
        })
    }

    pub fn band_threshold(&self, band: usize) -> Option<f32> {
        self.frq.get(band).copied().flatten()
    }

    /// Sensitivity `csf_max / frq[i]` for every thresholded band.
    pub fn band_sensitivities(&self) -> [f32; NUM_THRESHOLD_BANDS] {
        let peak = csf_max();
        let mut out = [0.0f32; NUM_THRESHOLD_BANDS];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = match self.frq[i] {
                Some(threshold) if threshold > 0.0 && threshold.is_finite() => peak / threshold,
                _ => 0.0,
            };
        }
        out
    }
}

/// Linear extent, in pixels of a unit-width image plane, of one degree of
/// visual angle for a horizontal field of view of `fov_degrees`.
pub fn num_one_degree_pixels(fov_degrees: f32) -> f32 {
    (fov_degrees * 0.5 * PI / 180.0).tan() * 2.0 * (180.0 / PI)
}

/// Index of the pyramid band whose blur support first exceeds one degree.
pub fn adaptation_level(num_one_degree_pixels: f32) -> usize {
    let mut level = 0;
    let mut num_pixels = 1.0f32;
    for i in 0..NUM_BANDS {
        level = i;
        if num_pixels > num_one_degree_pixels {
            break;
        }
        num_pixels *= 2.0;
    }
    level
}
