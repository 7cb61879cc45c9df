use std::fs;

use image::Rgb32FImage;
use thiserror::Error;
use tracing::info;

pub mod csf;
pub mod kernels;
pub mod model;
pub mod params;
pub mod pipeline;
pub mod wgpu;

mod color;

pub use color::{from_dynamic, load_rgb, relative_luminance};
pub use model::{
    DerivedParams, LumTexel, LuminancePyramid, NUM_BANDS, NUM_BLUR_LEVELS, NUM_THRESHOLD_BANDS,
    Plane, VisibilityMap,
};
pub use params::{
    CliArgs, CompareParams, Device, ParamsBuilder, ParamsError, ParamsResult, ViewingParameters,
    build_params,
};
pub use pipeline::{Comparator, ConfigurationError, FrameOutput, FrameStats};

pub type CompareResult<T> = Result<T, CompareError>;

#[derive(Debug, Error)]
pub enum CompareError {
    #[error("parameter error: {0}")]
    Params(#[from] ParamsError),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gpu error: {0}")]
    Gpu(String),
    #[error("failed to allocate frame buffers: {0}")]
    Allocation(String),
    #[error("image sizes differ: reference {reference:?}, candidate {candidate:?}")]
    Mismatch {
        reference: (u32, u32),
        candidate: (u32, u32),
    },
    #[error("{0}")]
    Message(String),
}

/// Loads both images, computes one frame and writes the 8-bit map.
pub fn compare(params: &CompareParams) -> CompareResult<FrameStats> {
    let (map, stats) = compare_files(params)?;

    if let Some(parent) = params.output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let format = resolve_format(params)?;
    color::save_visibility(&map, &params.output_path, format)?;
    info!(path = %params.output_path.display(), "wrote visibility map");

    Ok(stats)
}

pub fn compare_files(params: &CompareParams) -> CompareResult<(VisibilityMap, FrameStats)> {
    let reference = color::load_rgb(&params.reference_path)?;
    let candidate = color::load_rgb(&params.candidate_path)?;
    compare_images(&reference, &candidate, &params.viewing, params.device)
}

/// One-shot comparison. Unlike [`Comparator::compute_frame`], a size
/// mismatch is reported as an error instead of passing the input through.
pub fn compare_images(
    reference: &Rgb32FImage,
    candidate: &Rgb32FImage,
    viewing: &ViewingParameters,
    device: Device,
) -> CompareResult<(VisibilityMap, FrameStats)> {
    ensure_same_size(reference.dimensions(), candidate.dimensions())?;
    if reference.width() == 0 || reference.height() == 0 {
        return Err(CompareError::Message("input images are empty".into()));
    }

    let mut comparator = Comparator::new(device)?;
    let map = match comparator.compute_frame(Some(reference), Some(candidate), viewing)? {
        FrameOutput::Visibility(map) => map.clone(),
        FrameOutput::Passthrough(_) => {
            return Err(CompareError::Message(
                "pipeline skipped a validated image pair".into(),
            ));
        }
    };
    let stats = comparator
        .frame_stats()
        .ok_or_else(|| CompareError::Message("no frame statistics recorded".into()))?;
    Ok((map, stats))
}

/// Validates the inputs and returns the derived parameters without
/// decoding pixel data or touching a device.
pub fn dry_run(params: &CompareParams) -> CompareResult<DerivedParams> {
    let reference = image::image_dimensions(&params.reference_path)?;
    let candidate = image::image_dimensions(&params.candidate_path)?;
    ensure_same_size(reference, candidate)?;
    resolve_format(params)?;
    DerivedParams::compute(reference.0 as usize, reference.1 as usize, &params.viewing)
        .ok_or_else(|| CompareError::Message("input images are empty".into()))
}

fn ensure_same_size(reference: (u32, u32), candidate: (u32, u32)) -> CompareResult<()> {
    if reference != candidate {
        return Err(CompareError::Mismatch {
            reference,
            candidate,
        });
    }
    Ok(())
}

fn resolve_format(params: &CompareParams) -> CompareResult<image::ImageFormat> {
    if let Some(token) = params.output_format.as_deref() {
        parse_format_token(token)
    } else if let Some(ext) = params.output_path.extension() {
        parse_format_token(ext.to_string_lossy().as_ref())
    } else {
        Ok(image::ImageFormat::Png)
    }
}

fn parse_format_token(token: &str) -> CompareResult<image::ImageFormat> {
    let trimmed = token.trim().trim_start_matches('.');
    image::ImageFormat::from_extension(trimmed).ok_or_else(|| {
        CompareError::Message(format!("unsupported or unknown image format '{trimmed}'"))
    })
}
