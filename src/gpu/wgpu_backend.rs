//! wgpu implementation of [`GpuBackend`].

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};
use wgpu::util::DeviceExt;

use super::context::{DeviceHandles, GpuContext};
use super::reflect::{self, CONSTANTS_BINDING, FIRST_INPUT_BINDING, SAMPLER_BINDING};
use super::{ConstantLayout, GpuBackend, SurfaceKind};
use crate::command::{ShaderId, MAX_INPUTS};
use crate::error::{Result, ShaderError};
use crate::frame::{required_len, Precision, QuadVertex};

/// Full-screen quad vertex stage shared by every program.
const VERTEX_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}
"#;

/// Uniform buffers are never smaller than this.
const MIN_UNIFORM_SIZE: usize = 16;

pub struct WgpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

pub struct WgpuProgram {
    pipeline: wgpu::RenderPipeline,
}

/// Objects tied to one device generation.
struct DeviceState {
    handles: DeviceHandles,
    vertex_module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    placeholder: wgpu::TextureView,
}

impl DeviceState {
    fn new(handles: DeviceHandles, precision: Precision) -> Self {
        let device = &handles.device;

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(VERTEX_SHADER)),
        });

        let mut entries = vec![
            wgpu::BindGroupLayoutEntry {
                binding: CONSTANTS_BINDING,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: SAMPLER_BINDING,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
                count: None,
            },
        ];
        entries.extend((0..MAX_INPUTS as u32).map(|slot| wgpu::BindGroupLayoutEntry {
            binding: FIRST_INPUT_BINDING + slot,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: false },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        }));
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Shader Bind Group Layout"),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Shader Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });

        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Input Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        // Bound to input slots the command leaves empty.
        let placeholder = device
            .create_texture(&wgpu::TextureDescriptor {
                label: Some("Unbound Input"),
                size: wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: precision.texture_format(),
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            })
            .create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            handles,
            vertex_module,
            bind_group_layout,
            pipeline_layout,
            vertex_buffer,
            index_buffer,
            sampler,
            placeholder,
        }
    }
}

/// Renders through the shared [`GpuContext`] at a fixed [`Precision`].
pub struct WgpuBackend {
    context: Arc<GpuContext>,
    precision: Precision,
    state: DeviceState,
}

impl WgpuBackend {
    pub fn new(context: Arc<GpuContext>, precision: Precision) -> Self {
        let state = DeviceState::new(context.handles(), precision);
        Self {
            context,
            precision,
            state,
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// The device this backend built its objects on, unless it has been lost
    /// or replaced since.
    fn live(&self) -> Result<&DeviceState> {
        let handles = &self.state.handles;
        if handles.is_lost() || handles.generation != self.context.generation() {
            return Err(ShaderError::DeviceLost);
        }
        Ok(&self.state)
    }

    fn device_error(&self, what: &str, detail: impl std::fmt::Debug) -> ShaderError {
        if self.state.handles.is_lost() {
            ShaderError::DeviceLost
        } else {
            ShaderError::Device(format!("{what}: {detail:?}"))
        }
    }
}

impl GpuBackend for WgpuBackend {
    type Texture = WgpuTexture;
    type Program = WgpuProgram;

    fn bytes_per_pixel(&self) -> usize {
        self.precision.bytes_per_pixel()
    }

    fn create_texture(&mut self, kind: SurfaceKind, width: u32, height: u32) -> Result<WgpuTexture> {
        let state = self.live()?;
        let max = state.handles.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(ShaderError::Device(format!(
                "{width}x{height} texture is outside the device limit of 1..={max}"
            )));
        }
        let usage = match kind {
            SurfaceKind::Input => wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            SurfaceKind::RenderTarget => {
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
            }
        };
        let descriptor = wgpu::TextureDescriptor {
            label: Some(match kind {
                SurfaceKind::Input => "Input Texture",
                SurfaceKind::RenderTarget => "Render Target",
            }),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.precision.texture_format(),
            usage,
            view_formats: &[],
        };
        let device = &state.handles.device;
        let (texture, error) = validated(device, || device.create_texture(&descriptor));
        if let Some(error) = error {
            return Err(self.device_error("texture creation failed", error));
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        debug!(?kind, width, height, "texture created");
        Ok(WgpuTexture {
            texture,
            view,
            width,
            height,
        })
    }

    fn upload(
        &mut self,
        texture: &WgpuTexture,
        src: &[u8],
        src_pitch: usize,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let state = self.live()?;
        let (width, height) = (width.min(texture.width), height.min(texture.height));
        let bpp = self.precision.bytes_per_pixel();
        let row = width as usize * bpp;
        let needed = required_len(src_pitch, row, height as usize);
        if src.len() < needed {
            return Err(ShaderError::BufferTooSmall {
                needed,
                actual: src.len(),
            });
        }

        let start = Instant::now();
        let pitch = if src_pitch % bpp == 0 { src_pitch } else { row };
        let data = repack_rows(src, src_pitch, row, height as usize, pitch);
        state.handles.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data[..required_len(pitch, row, height as usize)],
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(pitch as u32),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        debug!("[Perf] Texture Upload: {:?}", start.elapsed());
        Ok(())
    }

    fn download(
        &mut self,
        texture: &WgpuTexture,
        dst: &mut [u8],
        dst_pitch: usize,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let state = self.live()?;
        let (width, height) = (width.min(texture.width), height.min(texture.height));
        let row = width as usize * self.precision.bytes_per_pixel();
        let needed = required_len(dst_pitch, row, height as usize);
        if dst.len() < needed {
            return Err(ShaderError::BufferTooSmall {
                needed,
                actual: dst.len(),
            });
        }

        let start = Instant::now();
        let device = &state.handles.device;
        let padded = padded_row(row);
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: (padded * height as usize) as wgpu::BufferAddress,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded as u32),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        state.handles.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: None,
            })
            .map_err(|e| self.device_error("poll failed", e))?;
        receiver
            .recv()
            .map_err(|e| self.device_error("readback never completed", e))?
            .map_err(|e| self.device_error("readback mapping failed", e))?;

        {
            let mapped = slice.get_mapped_range();
            for y in 0..height as usize {
                dst[y * dst_pitch..y * dst_pitch + row]
                    .copy_from_slice(&mapped[y * padded..y * padded + row]);
            }
        }
        readback.unmap();
        debug!("[Perf] GPU Readback: {:?}", start.elapsed());
        Ok(())
    }

    fn compile(&mut self, shader: &ShaderId) -> Result<(WgpuProgram, ConstantLayout)> {
        let loaded = reflect::load_shader(shader)?;
        let state = self.live()?;
        let device = &state.handles.device;

        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
        let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(shader.locator()),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(loaded.wgsl)),
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(shader.locator()),
            layout: Some(&state.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &state.vertex_module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some(&loaded.entry_point),
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.precision.texture_format(),
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });
        if let Some(error) = pollster::block_on(scope.pop()) {
            if self.state.handles.is_lost() {
                return Err(ShaderError::DeviceLost);
            }
            return Err(ShaderError::ShaderLoadFailed {
                shader: shader.to_string(),
                reason: error.to_string(),
            });
        }

        info!(%shader, constants = loaded.layout.len(), "render pipeline created");
        Ok((WgpuProgram { pipeline }, loaded.layout))
    }

    fn draw(
        &mut self,
        program: &WgpuProgram,
        inputs: [Option<&WgpuTexture>; MAX_INPUTS],
        constants: &[u8],
        target: &WgpuTexture,
    ) -> Result<()> {
        let state = self.live()?;
        let device = &state.handles.device;
        let start = Instant::now();
        let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);

        let mut contents = constants.to_vec();
        contents.resize(contents.len().max(MIN_UNIFORM_SIZE).next_multiple_of(MIN_UNIFORM_SIZE), 0);
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Constant Buffer"),
            contents: &contents,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: CONSTANTS_BINDING,
                resource: uniform_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: SAMPLER_BINDING,
                resource: wgpu::BindingResource::Sampler(&state.sampler),
            },
        ];
        entries.extend(inputs.iter().enumerate().map(|(slot, input)| wgpu::BindGroupEntry {
            binding: FIRST_INPUT_BINDING + slot as u32,
            resource: wgpu::BindingResource::TextureView(
                input.map_or(&state.placeholder, |texture| &texture.view),
            ),
        }));
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Shader Bind Group"),
            layout: &state.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Render Encoder"),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Shader Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            render_pass.set_pipeline(&program.pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, state.vertex_buffer.slice(..));
            render_pass.set_index_buffer(state.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..QuadVertex::INDICES.len() as u32, 0, 0..1);
        }
        state.handles.queue.submit(std::iter::once(encoder.finish()));
        if let Some(error) = pollster::block_on(scope.pop()) {
            return Err(self.device_error("draw rejected", error));
        }
        debug!("[Perf] Shader Dispatch: {:?}", start.elapsed());
        Ok(())
    }

    fn recreate_device(&mut self) -> Result<()> {
        self.context.recreate(self.state.handles.generation)?;
        self.state = DeviceState::new(self.context.handles(), self.precision);
        Ok(())
    }
}

/// Runs `create` inside a validation error scope so wgpu reports failures
/// instead of raising them as uncaptured errors.
fn validated<T>(device: &wgpu::Device, create: impl FnOnce() -> T) -> (T, Option<wgpu::Error>) {
    let scope = device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create();
    (value, pollster::block_on(scope.pop()))
}

/// Texture-to-buffer copies need rows aligned to
/// [`wgpu::COPY_BYTES_PER_ROW_ALIGNMENT`].
fn padded_row(row: usize) -> usize {
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT as usize;
    row.div_ceil(align) * align
}

/// Copies `rows` rows of `row` bytes from `src_pitch` spacing to
/// `dst_pitch` spacing, borrowing when the spacing already matches.
fn repack_rows(src: &[u8], src_pitch: usize, row: usize, rows: usize, dst_pitch: usize) -> Cow<'_, [u8]> {
    if src_pitch == dst_pitch {
        return Cow::Borrowed(src);
    }
    let mut packed = vec![0u8; required_len(dst_pitch, row, rows)];
    for y in 0..rows {
        let from = y * src_pitch;
        let to = y * dst_pitch;
        packed[to..to + row].copy_from_slice(&src[from..from + row]);
    }
    Cow::Owned(packed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readback_rows_are_aligned() {
        assert_eq!(padded_row(4), 256);
        assert_eq!(padded_row(256), 256);
        assert_eq!(padded_row(64 * 16), 1024);
        assert_eq!(padded_row(257), 512);
    }

    #[test]
    fn repacking_drops_row_padding() {
        let src = [1, 2, 0, 0, 3, 4, 0, 0, 5, 6];
        let packed = repack_rows(&src, 4, 2, 3, 2);
        assert_eq!(&packed[..], &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn repacking_matching_pitch_borrows() {
        let src = [7u8; 12];
        assert!(matches!(repack_rows(&src, 4, 4, 3, 4), Cow::Borrowed(_)));
    }
}
