//! CPU implementation of the extract, blur and compose kernels.
//!
//! Each kernel is row-parallel and returns only after every row is written,
//! so consecutive calls observe each other's output. The WGSL kernels in
//! `wgpu/shaders/` implement the same arithmetic.

use image::Rgb32FImage;
use rayon::prelude::*;

use crate::color::relative_luminance;
use crate::model::{
    DerivedParams, LumTexel, LuminancePyramid, NUM_BANDS, NUM_BLUR_LEVELS, NUM_THRESHOLD_BANDS,
    Plane, VisibilityMap,
};
use crate::{CompareError, CompareResult};

/// Floor for the adapting luminance so dark regions do not divide by zero.
pub const MIN_ADAPTATION_LUMINANCE: f32 = 1e-4;

/// Binomial low-pass taps, applied separably with spacing `2^level`.
pub const BLUR_TAPS: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

const INV_SQRT_3: f32 = 0.577_350_26;

#[derive(Debug, Clone, Copy)]
pub struct ExtractArgs<'a> {
    pub image_a: &'a Rgb32FImage,
    pub image_b: &'a Rgb32FImage,
}

impl ExtractArgs<'_> {
    pub fn validate(&self, width: usize, height: usize) -> CompareResult<()> {
        let expected = (width as u32, height as u32);
        if self.image_a.dimensions() != expected || self.image_b.dimensions() != expected {
            return Err(CompareError::Message(format!(
                "extract inputs {:?} and {:?} do not match frame buffers {width}x{height}",
                self.image_a.dimensions(),
                self.image_b.dimensions()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlurArgs {
    /// Source layer; the kernel writes `level + 1`.
    pub level: usize,
}

impl BlurArgs {
    pub fn validate(&self) -> CompareResult<()> {
        if self.level >= NUM_BLUR_LEVELS {
            return Err(CompareError::Message(format!(
                "blur level {} out of range 0..{NUM_BLUR_LEVELS}",
                self.level
            )));
        }
        Ok(())
    }

    /// Distance between filter taps for this level.
    pub fn step(&self) -> usize {
        1 << self.level
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComposeArgs {
    pub sensitivities: [f32; NUM_THRESHOLD_BANDS],
    pub adaptation_level: usize,
    pub color_factor: f32,
}

impl ComposeArgs {
    pub fn from_derived(derived: &DerivedParams) -> Self {
        Self {
            sensitivities: derived.band_sensitivities(),
            adaptation_level: derived.adaptation_level,
            color_factor: derived.color_factor,
        }
    }

    pub fn validate(&self) -> CompareResult<()> {
        if self.adaptation_level >= NUM_BANDS {
            return Err(CompareError::Message(format!(
                "adaptation level {} out of range 0..{NUM_BANDS}",
                self.adaptation_level
            )));
        }
        if !(0.0..=1.0).contains(&self.color_factor) {
            return Err(CompareError::Message(format!(
                "color factor {} outside [0, 1]",
                self.color_factor
            )));
        }
        if self
            .sensitivities
            .iter()
            .any(|s| !s.is_finite() || *s < 0.0)
        {
            return Err(CompareError::Message(
                "band sensitivities must be finite and non-negative".into(),
            ));
        }
        Ok(())
    }
}

/// Writes the raw RGB distance and the unblurred luminance layer.
pub fn extract(args: &ExtractArgs<'_>, e_delta: &mut Plane, pyramid: &mut LuminancePyramid) {
    let width = e_delta.width;
    if width == 0 {
        return;
    }
    let a = args.image_a.as_raw();
    let b = args.image_b.as_raw();

    e_delta
        .pixels_mut()
        .par_chunks_mut(width)
        .zip(pyramid.layer_mut(0).par_chunks_mut(width))
        .enumerate()
        .for_each(|(y, (delta_row, lum_row))| {
            for (x, (delta, lum)) in delta_row.iter_mut().zip(lum_row.iter_mut()).enumerate() {
                let idx = (y * width + x) * 3;
                let rgb_a = [a[idx], a[idx + 1], a[idx + 2]];
                let rgb_b = [b[idx], b[idx + 1], b[idx + 2]];
                *delta = rgb_distance(rgb_a, rgb_b);
                let y_a = relative_luminance(rgb_a);
                let y_b = relative_luminance(rgb_b);
                *lum = LumTexel {
                    diff: y_a - y_b,
                    mean: 0.5 * (y_a + y_b),
                };
            }
        });
}

/// Low-pass filters layer `args.level` into layer `args.level + 1`.
pub fn blur_level(args: &BlurArgs, pyramid: &mut LuminancePyramid) {
    let width = pyramid.width;
    let height = pyramid.height;
    if width == 0 || height == 0 {
        return;
    }
    let step = args.step() as isize;
    let (src, dst) = pyramid.split_level(args.level);

    dst.par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let mut acc = LumTexel::default();
                for (ty, wy) in BLUR_TAPS.iter().enumerate() {
                    let sy = clamp_coord(y as isize + (ty as isize - 2) * step, height);
                    for (tx, wx) in BLUR_TAPS.iter().enumerate() {
                        let sx = clamp_coord(x as isize + (tx as isize - 2) * step, width);
                        let texel = src[sy * width + sx];
                        let w = wy * wx;
                        acc.diff += w * texel.diff;
                        acc.mean += w * texel.mean;
                    }
                }
                *out = acc;
            }
        });
}

/// Combines the raw delta, adaptation luminance and band thresholds into
/// the visibility map.
pub fn compose(
    args: &ComposeArgs,
    e_delta: &Plane,
    pyramid: &LuminancePyramid,
    visibility: &mut VisibilityMap,
) {
    let width = e_delta.width;
    if width == 0 {
        return;
    }
    let adaptation = pyramid.layer(args.adaptation_level);
    let layers: Vec<&[LumTexel]> = (0..=NUM_THRESHOLD_BANDS)
        .map(|level| pyramid.layer(level))
        .collect();

    visibility
        .pixels_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let idx = y * width + x;
                let la = adaptation[idx].mean.max(MIN_ADAPTATION_LUMINANCE);

                let mut weight = 0.0f32;
                let mut weighted = 0.0f32;
                for band in 0..NUM_THRESHOLD_BANDS {
                    let energy = (layers[band][idx].diff - layers[band + 1][idx].diff).abs();
                    weight += energy;
                    weighted += energy * args.sensitivities[band];
                }
                let sensitivity = if weight > 0.0 {
                    weighted / weight
                } else {
                    args.sensitivities[0]
                };

                let jnd = e_delta.pixels()[idx] / la * sensitivity;
                *out = (args.color_factor * jnd).clamp(0.0, 1.0);
            }
        });
}

fn rgb_distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dr = a[0] - b[0];
    let dg = a[1] - b[1];
    let db = a[2] - b[2];
    ((dr * dr + dg * dg + db * db).sqrt() * INV_SQRT_3).min(1.0)
}

#[inline]
fn clamp_coord(value: isize, len: usize) -> usize {
    value.clamp(0, len as isize - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ViewingParameters;
    use image::Rgb;

    fn solid(width: u32, height: u32, value: [f32; 3]) -> Rgb32FImage {
        Rgb32FImage::from_pixel(width, height, Rgb(value))
    }

    fn run_extract(a: &Rgb32FImage, b: &Rgb32FImage) -> (Plane, LuminancePyramid) {
        let (w, h) = (a.width() as usize, a.height() as usize);
        let mut e_delta = Plane::zeroed(w, h);
        let mut pyramid = LuminancePyramid::new(w, h);
        let args = ExtractArgs {
            image_a: a,
            image_b: b,
        };
        args.validate(w, h).unwrap();
        extract(&args, &mut e_delta, &mut pyramid);
        (e_delta, pyramid)
    }

    #[test]
    fn extract_writes_distance_and_luminance() {
        let a = solid(4, 3, [1.0, 1.0, 1.0]);
        let b = solid(4, 3, [0.0, 0.0, 0.0]);
        let (e_delta, pyramid) = run_extract(&a, &b);
        for &value in e_delta.pixels() {
            assert!((value - 1.0).abs() < 1e-6);
        }
        for texel in pyramid.layer(0) {
            assert!((texel.diff - 1.0).abs() < 1e-6);
            assert!((texel.mean - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn extract_rejects_mismatched_frame() {
        let a = solid(4, 4, [0.5; 3]);
        let b = solid(4, 4, [0.5; 3]);
        let args = ExtractArgs {
            image_a: &a,
            image_b: &b,
        };
        assert!(args.validate(4, 4).is_ok());
        assert!(args.validate(5, 4).is_err());
    }

    #[test]
    fn blur_preserves_constant_layers() {
        let a = solid(9, 7, [0.8, 0.6, 0.4]);
        let b = solid(9, 7, [0.1, 0.2, 0.3]);
        let (_, mut pyramid) = run_extract(&a, &b);
        let expected = pyramid.layer(0)[0];
        for level in 0..NUM_BLUR_LEVELS {
            let args = BlurArgs { level };
            args.validate().unwrap();
            blur_level(&args, &mut pyramid);
        }
        for level in 0..NUM_BANDS {
            for texel in pyramid.layer(level) {
                assert!((texel.diff - expected.diff).abs() < 1e-5);
                assert!((texel.mean - expected.mean).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn blur_spreads_an_impulse() {
        let mut pyramid = LuminancePyramid::new(9, 9);
        pyramid.layer_mut(0)[4 * 9 + 4].diff = 1.0;
        blur_level(&BlurArgs { level: 0 }, &mut pyramid);
        let out = pyramid.layer(1);
        let centre = out[4 * 9 + 4].diff;
        assert!((centre - 36.0 / 256.0).abs() < 1e-6);
        assert!(out[4 * 9 + 5].diff < centre);
        assert_eq!(out[0].diff, 0.0);
        let total: f32 = out.iter().map(|t| t.diff).sum();
        assert!((total - 1.0).abs() < 1e-5);
    }

    #[test]
    fn blur_level_range_is_checked() {
        assert!(BlurArgs { level: NUM_BLUR_LEVELS - 1 }.validate().is_ok());
        assert!(BlurArgs { level: NUM_BLUR_LEVELS }.validate().is_err());
        assert_eq!(BlurArgs { level: 3 }.step(), 8);
    }

    fn compose_frame(a: &Rgb32FImage, b: &Rgb32FImage, color_factor: f32) -> VisibilityMap {
        let (e_delta, mut pyramid) = run_extract(a, b);
        for level in 0..NUM_BLUR_LEVELS {
            blur_level(&BlurArgs { level }, &mut pyramid);
        }
        let viewing = ViewingParameters::new(45.0, color_factor).unwrap();
        let derived = DerivedParams::compute(e_delta.width, e_delta.height, &viewing).unwrap();
        let args = ComposeArgs::from_derived(&derived);
        args.validate().unwrap();
        let mut out = VisibilityMap::new(e_delta.width, e_delta.height);
        compose(&args, &e_delta, &pyramid, &mut out);
        out
    }

    #[test]
    fn identical_inputs_compose_to_zero() {
        let a = solid(16, 16, [0.3, 0.5, 0.7]);
        let out = compose_frame(&a, &a.clone(), 1.0);
        assert!(out.pixels().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn compose_output_is_bounded() {
        let a = solid(16, 16, [1.0, 1.0, 1.0]);
        let b = solid(16, 16, [0.0, 0.0, 0.0]);
        let out = compose_frame(&a, &b, 1.0);
        assert!(out.pixels().iter().all(|&v| (0.0..=1.0).contains(&v)));
        assert!(out.pixels().iter().any(|&v| v > 0.0));
    }

    #[test]
    fn equal_luminance_chroma_change_is_still_visible() {
        use crate::color::{Y_COEFF_B, Y_COEFF_R};

        // Raise red and lower blue so that luminance is unchanged.
        let a = solid(8, 8, [0.5, 0.5, 0.5]);
        let blue = 0.5 - Y_COEFF_R * 0.1 / Y_COEFF_B;
        let b = solid(8, 8, [0.6, 0.5, blue]);
        let (_, pyramid) = run_extract(&a, &b);
        assert!(pyramid.layer(0)[0].diff.abs() < 1e-6);

        let out = compose_frame(&a, &b, 1.0);
        assert!(out.pixels().iter().all(|&v| v.is_finite() && v > 0.0));
    }

    #[test]
    fn compose_args_validation() {
        let mut args = ComposeArgs {
            sensitivities: [1.0; NUM_THRESHOLD_BANDS],
            adaptation_level: NUM_BANDS - 1,
            color_factor: 0.5,
        };
        assert!(args.validate().is_ok());
        args.adaptation_level = NUM_BANDS;
        assert!(args.validate().is_err());
        args.adaptation_level = 0;
        args.sensitivities[2] = f32::NAN;
        assert!(args.validate().is_err());
    }
}
