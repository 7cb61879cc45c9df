use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;

pub const MIN_FIELD_OF_VIEW: f32 = 0.1;
pub const MAX_FIELD_OF_VIEW: f32 = 89.9;
pub const DEFAULT_FIELD_OF_VIEW: f32 = 45.0;
pub const DEFAULT_COLOR_FACTOR: f32 = 1.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum Device {
    Cpu,
    Gpu,
}

/// Assumed viewing geometry. Only constructible with values in range.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ViewingParameters {
    field_of_view_degrees: f32,
    color_factor: f32,
}

impl ViewingParameters {
    pub fn new(field_of_view_degrees: f32, color_factor: f32) -> ParamsResult<Self> {
        Ok(Self {
            field_of_view_degrees: ensure_field_of_view(field_of_view_degrees)?,
            color_factor: ensure_unit_interval(color_factor, "color-factor")?,
        })
    }

    pub fn field_of_view_degrees(&self) -> f32 {
        self.field_of_view_degrees
    }

    pub fn color_factor(&self) -> f32 {
        self.color_factor
    }

    pub fn with_field_of_view(self, field_of_view_degrees: f32) -> ParamsResult<Self> {
        Self::new(field_of_view_degrees, self.color_factor)
    }

    pub fn with_color_factor(self, color_factor: f32) -> ParamsResult<Self> {
        Self::new(self.field_of_view_degrees, color_factor)
    }
}

impl Default for ViewingParameters {
    fn default() -> Self {
        Self {
            field_of_view_degrees: DEFAULT_FIELD_OF_VIEW,
            color_factor: DEFAULT_COLOR_FACTOR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompareParams {
    pub reference_path: PathBuf,
    pub candidate_path: PathBuf,
    pub output_path: PathBuf,
    pub viewing: ViewingParameters,
    pub device: Device,
    pub output_format: Option<String>,
    pub dry_run: bool,
    pub explain: bool,
}

#[derive(Debug, Clone)]
pub struct ParamsBuilder {
    pub reference_path: PathBuf,
    pub candidate_path: PathBuf,
    pub output_path: PathBuf,
    pub field_of_view_degrees: f32,
    pub color_factor: f32,
    pub device: Device,
    pub output_format: Option<String>,
    pub dry_run: bool,
    pub explain: bool,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub reference_path: PathBuf,
    pub candidate_path: PathBuf,
    pub output_path: PathBuf,
    pub field_of_view_degrees: f64,
    pub color_factor: f64,
    pub device: Device,
    pub output_format: Option<String>,
    pub dry_run: bool,
    pub explain: bool,
}

#[derive(Debug, Clone)]
pub struct ParamsError {
    pub field: &'static str,
    pub message: String,
}

impl ParamsError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

pub type ParamsResult<T> = Result<T, ParamsError>;

impl fmt::Display for ParamsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ParamsError {}

impl ParamsBuilder {
    pub fn new(
        reference_path: impl Into<PathBuf>,
        candidate_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            reference_path: reference_path.into(),
            candidate_path: candidate_path.into(),
            output_path: output_path.into(),
            field_of_view_degrees: DEFAULT_FIELD_OF_VIEW,
            color_factor: DEFAULT_COLOR_FACTOR,
            device: Device::Cpu,
            output_format: None,
            dry_run: false,
            explain: false,
        }
    }

    pub fn build(self) -> ParamsResult<CompareParams> {
        let viewing = ViewingParameters::new(self.field_of_view_degrees, self.color_factor)?;
        let output_format = ensure_format(self.output_format)?;

        Ok(CompareParams {
            reference_path: self.reference_path,
            candidate_path: self.candidate_path,
            output_path: self.output_path,
            viewing,
            device: self.device,
            output_format,
            dry_run: self.dry_run,
            explain: self.explain,
        })
    }
}

impl TryFrom<CliArgs> for ParamsBuilder {
    type Error = ParamsError;

    fn try_from(args: CliArgs) -> ParamsResult<Self> {
        let field_of_view_degrees = to_finite_f32(args.field_of_view_degrees, "fov")?;
        let color_factor = to_finite_f32(args.color_factor, "color-factor")?;

        Ok(Self {
            reference_path: args.reference_path,
            candidate_path: args.candidate_path,
            output_path: args.output_path,
            field_of_view_degrees,
            color_factor,
            device: args.device,
            output_format: args.output_format,
            dry_run: args.dry_run,
            explain: args.explain,
        })
    }
}

pub fn build_params(args: CliArgs) -> ParamsResult<CompareParams> {
    ParamsBuilder::try_from(args)?.build()
}

fn ensure_field_of_view(value: f32) -> ParamsResult<f32> {
    if !value.is_finite() {
        return Err(ParamsError::new("fov", "value must be finite"));
    }
    if !(MIN_FIELD_OF_VIEW < value && value < MAX_FIELD_OF_VIEW) {
        return Err(ParamsError::new(
            "fov",
            format!(
                "field of view must lie in the open interval ({MIN_FIELD_OF_VIEW}, {MAX_FIELD_OF_VIEW}) degrees"
            ),
        ));
    }
    Ok(value)
}

fn ensure_unit_interval(value: f32, field: &'static str) -> ParamsResult<f32> {
    if !value.is_finite() {
        return Err(ParamsError::new(field, "value must be finite"));
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(ParamsError::new(field, "value must lie in [0, 1]"));
    }
    Ok(value)
}

fn ensure_format(token: Option<String>) -> ParamsResult<Option<String>> {
    let Some(token) = token else {
        return Ok(None);
    };
    let trimmed = token.trim().trim_start_matches('.');
    if trimmed.is_empty() {
        return Err(ParamsError::new("format", "format string cannot be empty"));
    }
    if image::ImageFormat::from_extension(trimmed).is_none() {
        return Err(ParamsError::new(
            "format",
            format!("unsupported or unknown image format '{trimmed}'"),
        ));
    }
    Ok(Some(trimmed.to_ascii_lowercase()))
}

fn to_finite_f32(value: f64, field: &'static str) -> ParamsResult<f32> {
    if !value.is_finite() {
        return Err(ParamsError::new(field, "value must be finite"));
    }
    if value.abs() > f32::MAX as f64 {
        return Err(ParamsError::new(
            field,
            "value is too large for single precision",
        ));
    }
    Ok(value as f32)
}
