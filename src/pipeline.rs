//! Per-frame orchestration: validates the image pair, owns the frame
//! buffers and runs extract, the blur levels and compose in order.

use image::Rgb32FImage;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::kernels::{self, BlurArgs, ComposeArgs, ExtractArgs};
use crate::model::{
    DerivedParams, LumTexel, LuminancePyramid, NUM_BANDS, NUM_BLUR_LEVELS, Plane, VisibilityMap,
};
use crate::params::{Device, ViewingParameters};
use crate::wgpu::{self as gpu, GpuContext, GpuFrame};
use crate::{CompareError, CompareResult};

/// Workgroup edge length used for grid sizing on every pass.
pub const WORKGROUP_SIZE: u32 = 8;

/// Why a frame was passed through instead of computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("image A is missing")]
    MissingImageA,
    #[error("image B is missing")]
    MissingImageB,
    #[error("images have zero area")]
    EmptyImage,
    #[error("image sizes differ: {a:?} vs {b:?}")]
    SizeMismatch { a: (u32, u32), b: (u32, u32) },
}

pub enum FrameOutput<'a> {
    Visibility(&'a VisibilityMap),
    /// Inputs were unusable; carries the first input unmodified.
    Passthrough(Option<&'a Rgb32FImage>),
}

impl<'a> FrameOutput<'a> {
    pub fn visibility(&self) -> Option<&'a VisibilityMap> {
        match self {
            FrameOutput::Visibility(map) => Some(map),
            FrameOutput::Passthrough(_) => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FrameOutput::Passthrough(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    pub width: usize,
    pub height: usize,
    pub max_visibility: f32,
    pub mean_visibility: f32,
    /// Share of pixels at or above one just-noticeable difference.
    pub visible_fraction: f32,
    /// Parameters the frame was computed with.
    pub derived: DerivedParams,
}

pub struct Comparator {
    gpu: Option<&'static GpuContext>,
    frame: Option<FrameState>,
    derived: Option<DerivedParams>,
    allocations: u64,
    // Set once buffer creation fails; every later frame reports it.
    failed_allocation: Option<String>,
}

struct FrameState {
    width: usize,
    height: usize,
    resources: FrameResources,
    visibility: VisibilityMap,
}

enum FrameResources {
    Cpu(CpuFrame),
    Gpu(GpuFrame),
}

struct CpuFrame {
    e_delta: Plane,
    pyramid: LuminancePyramid,
}

impl Comparator {
    pub fn new(device: Device) -> CompareResult<Self> {
        let gpu = match device {
            Device::Gpu => Some(gpu::context()?),
            Device::Cpu => None,
        };
        Ok(Self {
            gpu,
            frame: None,
            derived: None,
            allocations: 0,
            failed_allocation: None,
        })
    }

    /// Runs one frame. Invalid inputs are not an error: the first image is
    /// handed back unmodified and the frame buffers are left alone.
    pub fn compute_frame<'a>(
        &'a mut self,
        image_a: Option<&'a Rgb32FImage>,
        image_b: Option<&'a Rgb32FImage>,
        viewing: &ViewingParameters,
    ) -> CompareResult<FrameOutput<'a>> {
        let (a, b) = match validate_pair(image_a, image_b) {
            Ok(pair) => pair,
            Err(reason) => {
                debug!(%reason, "passing frame through");
                return Ok(FrameOutput::Passthrough(image_a));
            }
        };
        let (width, height) = (a.width() as usize, a.height() as usize);
        let Some(derived) = DerivedParams::compute(width, height, viewing) else {
            return Ok(FrameOutput::Passthrough(image_a));
        };
        debug!(
            ppd = derived.pixels_per_degree,
            adaptation_level = derived.adaptation_level,
            "derived frame parameters"
        );

        let extract_args = ExtractArgs {
            image_a: a,
            image_b: b,
        };
        let compose_args = ComposeArgs::from_derived(&derived);
        extract_args.validate(width, height)?;
        compose_args.validate()?;

        if let Some(message) = &self.failed_allocation {
            return Err(CompareError::Allocation(message.clone()));
        }
        let frame = match prepare_frame(
            &mut self.frame,
            &mut self.allocations,
            self.gpu,
            width,
            height,
        ) {
            Ok(frame) => frame,
            Err(CompareError::Allocation(message)) => {
                self.failed_allocation = Some(message.clone());
                return Err(CompareError::Allocation(message));
            }
            Err(err) => return Err(err),
        };
        frame.run(self.gpu, &extract_args, &compose_args)?;
        self.derived = Some(derived);

        Ok(FrameOutput::Visibility(&frame.visibility))
    }

    /// Parameters of the last computed frame.
    pub fn derived(&self) -> Option<&DerivedParams> {
        self.derived.as_ref()
    }

    /// Map of the last computed frame.
    pub fn visibility(&self) -> Option<&VisibilityMap> {
        self.derived.as_ref()?;
        self.frame.as_ref().map(|frame| &frame.visibility)
    }

    pub fn frame_stats(&self) -> Option<FrameStats> {
        let derived = self.derived.as_ref()?;
        let map = self.visibility()?;
        Some(summarize(map, derived))
    }

    /// Number of times frame buffers have been (re)allocated.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

/// Checks that both images are present, non-empty and the same size.
pub fn validate_pair<'a>(
    image_a: Option<&'a Rgb32FImage>,
    image_b: Option<&'a Rgb32FImage>,
) -> Result<(&'a Rgb32FImage, &'a Rgb32FImage), ConfigurationError> {
    let a = image_a.ok_or(ConfigurationError::MissingImageA)?;
    let b = image_b.ok_or(ConfigurationError::MissingImageB)?;
    if a.dimensions() != b.dimensions() {
        return Err(ConfigurationError::SizeMismatch {
            a: a.dimensions(),
            b: b.dimensions(),
        });
    }
    if a.width() == 0 || a.height() == 0 {
        return Err(ConfigurationError::EmptyImage);
    }
    Ok((a, b))
}

/// Workgroup counts covering a `width` x `height` grid.
pub fn dispatch_size(width: usize, height: usize) -> (u32, u32, u32) {
    (
        div_round_up(width, WORKGROUP_SIZE),
        div_round_up(height, WORKGROUP_SIZE),
        1,
    )
}

fn prepare_frame<'s>(
    slot: &'s mut Option<FrameState>,
    allocations: &mut u64,
    gpu: Option<&'static GpuContext>,
    width: usize,
    height: usize,
) -> CompareResult<&'s mut FrameState> {
    let reusable = matches!(slot, Some(frame) if frame.width == width && frame.height == height);
    if !reusable {
        // Release the old buffers before asking for new ones.
        *slot = None;
        let resources = match gpu {
            Some(ctx) => FrameResources::Gpu(GpuFrame::allocate(ctx, width, height)?),
            None => FrameResources::Cpu(CpuFrame::allocate(width, height)?),
        };
        let visibility = VisibilityMap::from_plane(zeroed_plane(width, height)?);
        *allocations += 1;
        info!(width, height, gpu = gpu.is_some(), "allocated frame buffers");
        *slot = Some(FrameState {
            width,
            height,
            resources,
            visibility,
        });
    }
    slot.as_mut()
        .ok_or_else(|| CompareError::Allocation("frame buffers missing after allocation".into()))
}

impl FrameState {
    fn run(
        &mut self,
        gpu: Option<&'static GpuContext>,
        extract: &ExtractArgs<'_>,
        compose: &ComposeArgs,
    ) -> CompareResult<()> {
        let groups = dispatch_size(self.width, self.height);
        match &mut self.resources {
            FrameResources::Cpu(cpu) => {
                trace!(?groups, "extract");
                kernels::extract(extract, &mut cpu.e_delta, &mut cpu.pyramid);
                for level in 0..NUM_BLUR_LEVELS {
                    let args = BlurArgs { level };
                    args.validate()?;
                    trace!(level, "blur");
                    kernels::blur_level(&args, &mut cpu.pyramid);
                }
                trace!(?groups, "compose");
                kernels::compose(compose, &cpu.e_delta, &cpu.pyramid, &mut self.visibility);
                Ok(())
            }
            FrameResources::Gpu(frame) => {
                let ctx = gpu.ok_or_else(|| {
                    CompareError::Gpu("frame holds device buffers but no context".into())
                })?;
                gpu::run_frame(ctx, frame, extract, compose, groups, &mut self.visibility)
            }
        }
    }
}

impl CpuFrame {
    fn allocate(width: usize, height: usize) -> CompareResult<Self> {
        let pixels = width
            .checked_mul(height)
            .ok_or_else(|| CompareError::Allocation(format!("{width}x{height} overflows")))?;
        let texels = pixels.checked_mul(NUM_BANDS).ok_or_else(|| {
            CompareError::Allocation(format!("{width}x{height}x{NUM_BANDS} overflows"))
        })?;
        Ok(Self {
            e_delta: zeroed_plane(width, height)?,
            pyramid: LuminancePyramid {
                width,
                height,
                texels: try_zeroed::<LumTexel>(texels)?,
            },
        })
    }
}

fn zeroed_plane(width: usize, height: usize) -> CompareResult<Plane> {
    let pixels = width
        .checked_mul(height)
        .ok_or_else(|| CompareError::Allocation(format!("{width}x{height} overflows")))?;
    Plane::from_vec(width, height, try_zeroed(pixels)?)
        .ok_or_else(|| CompareError::Allocation(format!("{width}x{height} plane size mismatch")))
}

fn try_zeroed<T: Clone + Default>(len: usize) -> CompareResult<Vec<T>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len)
        .map_err(|err| CompareError::Allocation(format!("{len} elements: {err}")))?;
    data.resize(len, T::default());
    Ok(data)
}

fn summarize(map: &VisibilityMap, derived: &DerivedParams) -> FrameStats {
    let pixels = map.pixels();
    let count = pixels.len().max(1) as f64;
    let mut max_visibility = 0.0f32;
    let mut sum = 0.0f64;
    let mut visible = 0usize;
    for &value in pixels {
        max_visibility = max_visibility.max(value);
        sum += value as f64;
        if value >= 1.0 {
            visible += 1;
        }
    }
    FrameStats {
        width: map.width(),
        height: map.height(),
        max_visibility,
        mean_visibility: (sum / count) as f32,
        visible_fraction: (visible as f64 / count) as f32,
        derived: derived.clone(),
    }
}

fn div_round_up(value: usize, divisor: u32) -> u32 {
    (value as u32).div_ceil(divisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32, shift: f32) -> Rgb32FImage {
        Rgb32FImage::from_fn(width, height, |x, y| {
            let v = ((x + y) as f32 / (width + height) as f32 + shift).clamp(0.0, 1.0);
            Rgb([v, v * 0.5, 1.0 - v])
        })
    }

    #[test]
    fn dispatch_covers_partial_tiles() {
        assert_eq!(dispatch_size(1, 1), (1, 1, 1));
        assert_eq!(dispatch_size(8, 16), (1, 2, 1));
        assert_eq!(dispatch_size(9, 17), (2, 3, 1));
        assert_eq!(dispatch_size(1920, 1080), (240, 135, 1));
    }

    #[test]
    fn validate_pair_reports_reason() {
        let a = Rgb32FImage::new(4, 4);
        let b = Rgb32FImage::new(2, 4);
        let empty = Rgb32FImage::new(0, 0);
        assert_eq!(
            validate_pair(None, Some(&a)).unwrap_err(),
            ConfigurationError::MissingImageA
        );
        assert_eq!(
            validate_pair(Some(&a), None).unwrap_err(),
            ConfigurationError::MissingImageB
        );
        assert_eq!(
            validate_pair(Some(&a), Some(&b)).unwrap_err(),
            ConfigurationError::SizeMismatch {
                a: (4, 4),
                b: (2, 4)
            }
        );
        assert_eq!(
            validate_pair(Some(&empty), Some(&empty)).unwrap_err(),
            ConfigurationError::EmptyImage
        );
        assert!(validate_pair(Some(&a), Some(&a)).is_ok());
    }

    #[test]
    fn buffers_are_reused_until_size_changes() {
        let mut comparator = Comparator::new(Device::Cpu).unwrap();
        let viewing = ViewingParameters::default();
        let a = gradient(16, 12, 0.0);
        let b = gradient(16, 12, 0.1);

        comparator.compute_frame(Some(&a), Some(&b), &viewing).unwrap();
        comparator.compute_frame(Some(&a), Some(&b), &viewing).unwrap();
        assert_eq!(comparator.allocations(), 1);

        let small = gradient(8, 8, 0.0);
        let output = comparator
            .compute_frame(Some(&small), Some(&a), &viewing)
            .unwrap();
        assert!(output.is_passthrough());
        assert_eq!(comparator.allocations(), 1);

        let c = gradient(8, 8, 0.2);
        let output = comparator
            .compute_frame(Some(&small), Some(&c), &viewing)
            .unwrap();
        assert_eq!(output.visibility().unwrap().width(), 8);
        assert_eq!(comparator.allocations(), 2);
    }

    #[test]
    fn passthrough_keeps_previous_result() {
        let mut comparator = Comparator::new(Device::Cpu).unwrap();
        let viewing = ViewingParameters::default();
        let a = gradient(10, 10, 0.0);
        let b = gradient(10, 10, 0.3);
        let first = comparator
            .compute_frame(Some(&a), Some(&b), &viewing)
            .unwrap()
            .visibility()
            .cloned()
            .unwrap();
        let derived = comparator.derived().cloned().unwrap();

        let narrow = viewing.with_field_of_view(10.0).unwrap();
        let output = comparator.compute_frame(Some(&a), None, &narrow).unwrap();
        match output {
            FrameOutput::Passthrough(Some(image)) => assert!(std::ptr::eq(image, &a)),
            _ => panic!("expected pass-through of image A"),
        }
        assert_eq!(comparator.visibility(), Some(&first));
        assert_eq!(comparator.derived(), Some(&derived));
    }

    #[test]
    fn stats_summarize_last_frame() {
        let mut comparator = Comparator::new(Device::Cpu).unwrap();
        assert!(comparator.frame_stats().is_none());
        let viewing = ViewingParameters::default();
        let a = Rgb32FImage::from_pixel(8, 8, Rgb([0.2, 0.2, 0.2]));
        let b = Rgb32FImage::from_pixel(8, 8, Rgb([0.8, 0.8, 0.8]));
        comparator.compute_frame(Some(&a), Some(&b), &viewing).unwrap();
        let stats = comparator.frame_stats().unwrap();
        assert_eq!((stats.width, stats.height), (8, 8));
        assert_eq!(stats.max_visibility, 1.0);
        assert_eq!(stats.visible_fraction, 1.0);
        assert_eq!(Some(&stats.derived), comparator.derived());

        let wide = viewing.with_field_of_view(80.0).unwrap();
        comparator.compute_frame(Some(&a), Some(&b), &wide).unwrap();
        let stats = comparator.frame_stats().unwrap();
        assert_eq!(stats.derived.field_of_view_degrees, 80.0);
        assert_eq!(Some(&stats.derived), comparator.derived());
    }

    #[test]
    fn allocation_failure_is_sticky() {
        let mut comparator = Comparator::new(Device::Cpu).unwrap();
        comparator.failed_allocation = Some("out of memory".into());
        let a = gradient(4, 4, 0.0);
        let err = comparator
            .compute_frame(Some(&a), Some(&a), &ViewingParameters::default())
            .err()
            .unwrap();
        assert!(matches!(err, CompareError::Allocation(_)));
        assert_eq!(comparator.allocations(), 0);

        let output = comparator
            .compute_frame(Some(&a), None, &ViewingParameters::default())
            .unwrap();
        assert!(output.is_passthrough());
    }

    #[test]
    fn cpu_allocation_rejects_overflowing_sizes() {
        assert!(matches!(
            CpuFrame::allocate(usize::MAX, 2),
            Err(CompareError::Allocation(_))
        ));
    }
}
