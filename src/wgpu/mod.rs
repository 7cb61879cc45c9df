use std::sync::OnceLock;

use bytemuck::{Pod, Zeroable};
use pollster::block_on;
use tracing::{info, trace};

use crate::CompareError;
use crate::kernels::{BlurArgs, ComposeArgs, ExtractArgs};
use crate::model::{LumTexel, NUM_BANDS, NUM_BLUR_LEVELS, VisibilityMap};

const EXTRACT_SHADER: &str = include_str!("shaders/extract.wgsl");
const BLUR_SHADER: &str = include_str!("shaders/blur.wgsl");
const COMPOSE_SHADER: &str = include_str!("shaders/compose.wgsl");

static GPU_CONTEXT: OnceLock<GpuContext> = OnceLock::new();

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FrameUniforms {
    width: u32,
    height: u32,
    adaptation_level: u32,
    color_factor: f32,
    sensitivities: [[f32; 4]; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BlurUniforms {
    level: u32,
    step: u32,
    _pad: [u32; 2],
}

pub struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    extract_bind_group_layout: wgpu::BindGroupLayout,
    blur_bind_group_layout: wgpu::BindGroupLayout,
    compose_bind_group_layout: wgpu::BindGroupLayout,
    extract_pipeline: wgpu::ComputePipeline,
    blur_pipeline: wgpu::ComputePipeline,
    compose_pipeline: wgpu::ComputePipeline,
}

/// Device-side frame buffers plus the bind groups that reference them.
pub struct GpuFrame {
    width: usize,
    height: usize,
    image_a: wgpu::Buffer,
    image_b: wgpu::Buffer,
    visibility: wgpu::Buffer,
    staging: wgpu::Buffer,
    frame_uniforms: wgpu::Buffer,
    extract_bind_group: wgpu::BindGroup,
    blur_bind_groups: Vec<wgpu::BindGroup>,
    compose_bind_group: wgpu::BindGroup,
    // Only reached through the bind groups above.
    _e_delta: wgpu::Buffer,
    _pyramid: wgpu::Buffer,
    _blur_uniforms: Vec<wgpu::Buffer>,
}

pub fn context() -> Result<&'static GpuContext, CompareError> {
    if let Some(ctx) = GPU_CONTEXT.get() {
        return Ok(ctx);
    }
    let ctx = init()?;
    // A concurrent caller may have won the race; either context is usable.
    let _ = GPU_CONTEXT.set(ctx);
    GPU_CONTEXT
        .get()
        .ok_or_else(|| CompareError::Gpu("GPU context was not stored".into()))
}

fn init() -> Result<GpuContext, CompareError> {
    let instance = wgpu::Instance::default();
    let adapter = block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }))
    .ok_or_else(|| CompareError::Gpu("no compatible GPU adapter found".into()))?;
    info!(adapter = %adapter.get_info().name, "selected GPU adapter");

    // The pyramid is the largest binding; ask for whatever the adapter offers.
    let adapter_limits = adapter.limits();
    let required_limits = wgpu::Limits {
        max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
        max_buffer_size: adapter_limits.max_buffer_size,
        ..wgpu::Limits::default()
    };

    let (device, queue) = block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("imgcmp-device"),
            required_features: wgpu::Features::empty(),
            required_limits,
        },
        None,
    ))
    .map_err(|err| CompareError::Gpu(format!("request_device failed: {err}")))?;

    let shader = |label, source: &str| {
        device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        })
    };
    let extract_shader = shader("extract shader", EXTRACT_SHADER);
    let blur_shader = shader("blur shader", BLUR_SHADER);
    let compose_shader = shader("compose shader", COMPOSE_SHADER);

    let extract_bind_group_layout =
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("extract-bind-group-layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
                storage_entry(4, false),
            ],
        });

    let blur_bind_group_layout =
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("blur-bind-group-layout"),
            entries: &[uniform_entry(0), uniform_entry(1), storage_entry(2, false)],
        });

    let compose_bind_group_layout =
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("compose-bind-group-layout"),
            entries: &[
                uniform_entry(0),
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });

    let pipeline = |label, layout: &wgpu::BindGroupLayout, module: &wgpu::ShaderModule| {
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(label),
            bind_group_layouts: &[layout],
            push_constant_ranges: &[],
        });
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: Some(&pipeline_layout),
            module,
            entry_point: "main",
        })
    };

    let extract_pipeline = pipeline("extract-pipeline", &extract_bind_group_layout, &extract_shader);
    let blur_pipeline = pipeline("blur-pipeline", &blur_bind_group_layout, &blur_shader);
    let compose_pipeline = pipeline("compose-pipeline", &compose_bind_group_layout, &compose_shader);

    Ok(GpuContext {
        device,
        queue,
        extract_bind_group_layout,
        blur_bind_group_layout,
        compose_bind_group_layout,
        extract_pipeline,
        blur_pipeline,
        compose_pipeline,
    })
}

impl GpuFrame {
    /// Creates every buffer a frame of this size needs. Any device error
    /// raised while doing so is reported as an allocation failure.
    pub fn allocate(ctx: &GpuContext, width: usize, height: usize) -> Result<Self, CompareError> {
        let limits = ctx.device.limits();
        let pixels = (width as u64)
            .checked_mul(height as u64)
            .ok_or_else(|| CompareError::Allocation(format!("{width}x{height} overflows")))?;
        let f32_size = std::mem::size_of::<f32>() as u64;
        let image_bytes = checked_size(pixels, 3 * f32_size, &limits)?;
        let plane_bytes = checked_size(pixels, f32_size, &limits)?;
        let pyramid_bytes = checked_size(
            pixels,
            NUM_BANDS as u64 * std::mem::size_of::<LumTexel>() as u64,
            &limits,
        )?;

        ctx.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let storage = |label, size| {
            ctx.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_SRC
                    | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let image_a = storage("image-a-buffer", image_bytes);
        let image_b = storage("image-b-buffer", image_bytes);
        let e_delta = storage("e-delta-buffer", plane_bytes);
        let pyramid = storage("luminance-pyramid-buffer", pyramid_bytes);
        let visibility = storage("visibility-buffer", plane_bytes);

        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("visibility-staging"),
            size: plane_bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let frame_uniforms = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame-uniforms"),
            size: std::mem::size_of::<FrameUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let blur_uniforms: Vec<wgpu::Buffer> = (0..NUM_BLUR_LEVELS)
            .map(|level| {
                let args = BlurArgs { level };
                let uniforms = BlurUniforms {
                    level: level as u32,
                    step: args.step() as u32,
                    _pad: [0; 2],
                };
                let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("blur-uniforms"),
                    size: std::mem::size_of::<BlurUniforms>() as u64,
                    usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                ctx.queue
                    .write_buffer(&buffer, 0, bytemuck::bytes_of(&uniforms));
                buffer
            })
            .collect();

        let extract_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("extract-bind-group"),
            layout: &ctx.extract_bind_group_layout,
            entries: &[
                entry(0, &frame_uniforms),
                entry(1, &image_a),
                entry(2, &image_b),
                entry(3, &e_delta),
                entry(4, &pyramid),
            ],
        });

        let blur_bind_groups = blur_uniforms
            .iter()
            .map(|level_uniforms| {
                ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("blur-bind-group"),
                    layout: &ctx.blur_bind_group_layout,
                    entries: &[
                        entry(0, &frame_uniforms),
                        entry(1, level_uniforms),
                        entry(2, &pyramid),
                    ],
                })
            })
            .collect();

        let compose_bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("compose-bind-group"),
            layout: &ctx.compose_bind_group_layout,
            entries: &[
                entry(0, &frame_uniforms),
                entry(1, &e_delta),
                entry(2, &pyramid),
                entry(3, &visibility),
            ],
        });

        let validation = block_on(ctx.device.pop_error_scope());
        let out_of_memory = block_on(ctx.device.pop_error_scope());
        if let Some(err) = out_of_memory.or(validation) {
            return Err(CompareError::Allocation(err.to_string()));
        }

        Ok(Self {
            width,
            height,
            image_a,
            image_b,
            visibility,
            staging,
            frame_uniforms,
            extract_bind_group,
            blur_bind_groups,
            compose_bind_group,
            _e_delta: e_delta,
            _pyramid: pyramid,
            _blur_uniforms: blur_uniforms,
        })
    }
}

/// Uploads the pair, records extract, every blur level and compose into one
/// submission, then reads the visibility map back.
pub fn run_frame(
    ctx: &GpuContext,
    frame: &GpuFrame,
    extract: &ExtractArgs<'_>,
    compose: &ComposeArgs,
    groups: (u32, u32, u32),
    out: &mut VisibilityMap,
) -> Result<(), CompareError> {
    if out.width() != frame.width || out.height() != frame.height {
        return Err(CompareError::Gpu(
            "visibility map does not match device buffers".into(),
        ));
    }

    let uniforms = build_uniforms(frame, compose);
    ctx.queue
        .write_buffer(&frame.frame_uniforms, 0, bytemuck::bytes_of(&uniforms));
    ctx.queue.write_buffer(
        &frame.image_a,
        0,
        bytemuck::cast_slice(extract.image_a.as_raw().as_slice()),
    );
    ctx.queue.write_buffer(
        &frame.image_b,
        0,
        bytemuck::cast_slice(extract.image_b.as_raw().as_slice()),
    );

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("visibility-encoder"),
        });

    // One pass per dispatch so each pass sees the previous one's writes.
    {
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("extract-pass"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&ctx.extract_pipeline);
        cpass.set_bind_group(0, &frame.extract_bind_group, &[]);
        cpass.dispatch_workgroups(groups.0, groups.1, groups.2);
    }
    trace!(?groups, "encoded extract");

    for (level, bind_group) in frame.blur_bind_groups.iter().enumerate() {
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("blur-pass"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&ctx.blur_pipeline);
        cpass.set_bind_group(0, bind_group, &[]);
        cpass.dispatch_workgroups(groups.0, groups.1, groups.2);
        trace!(level, "encoded blur");
    }

    {
        let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("compose-pass"),
            timestamp_writes: None,
        });
        cpass.set_pipeline(&ctx.compose_pipeline);
        cpass.set_bind_group(0, &frame.compose_bind_group, &[]);
        cpass.dispatch_workgroups(groups.0, groups.1, groups.2);
    }
    trace!(?groups, "encoded compose");

    let out_bytes = frame.staging.size();
    encoder.copy_buffer_to_buffer(&frame.visibility, 0, &frame.staging, 0, out_bytes);
    ctx.queue.submit(std::iter::once(encoder.finish()));

    let buffer_slice = frame.staging.slice(..);
    let (sender, receiver) = std::sync::mpsc::channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |res| {
        sender.send(res).ok();
    });
    ctx.device.poll(wgpu::Maintain::Wait);
    receiver
        .recv()
        .map_err(|_| CompareError::Gpu("map_async callback was dropped".into()))?
        .map_err(|_| CompareError::Gpu("map_async failed for visibility output".into()))?;
    {
        let data = buffer_slice.get_mapped_range();
        let floats: &[f32] = bytemuck::cast_slice(&data);
        out.pixels_mut().copy_from_slice(floats);
    }
    frame.staging.unmap();

    Ok(())
}

fn build_uniforms(frame: &GpuFrame, compose: &ComposeArgs) -> FrameUniforms {
    let mut sensitivities = [[0.0f32; 4]; 2];
    for (band, value) in compose.sensitivities.iter().enumerate() {
        sensitivities[band / 4][band % 4] = *value;
    }
    FrameUniforms {
        width: frame.width as u32,
        height: frame.height as u32,
        adaptation_level: compose.adaptation_level as u32,
        color_factor: compose.color_factor,
        sensitivities,
    }
}

fn checked_size(pixels: u64, bytes_per_pixel: u64, limits: &wgpu::Limits) -> Result<u64, CompareError> {
    let size = pixels
        .checked_mul(bytes_per_pixel)
        .ok_or_else(|| CompareError::Allocation("buffer size overflows".into()))?;
    if size > limits.max_buffer_size || size > limits.max_storage_buffer_binding_size as u64 {
        return Err(CompareError::Allocation(format!(
            "{size} byte buffer exceeds device limits"
        )));
    }
    Ok(size)
}

fn uniform_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn entry(binding: u32, buffer: &wgpu::Buffer) -> wgpu::BindGroupEntry<'_> {
    wgpu::BindGroupEntry {
        binding,
        resource: buffer.as_entire_binding(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_layouts_match_wgsl() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 48);
        assert_eq!(std::mem::size_of::<BlurUniforms>(), 16);
        assert_eq!(std::mem::size_of::<LumTexel>(), 8);
    }

    #[test]
    fn size_check_respects_limits() {
        let limits = wgpu::Limits::default();
        assert_eq!(checked_size(16, 4, &limits).unwrap(), 64);
        assert!(matches!(
            checked_size(u64::MAX, 2, &limits),
            Err(CompareError::Allocation(_))
        ));
        let too_big = limits.max_storage_buffer_binding_size as u64 + 1;
        assert!(checked_size(too_big, 1, &limits).is_err());
    }
}
