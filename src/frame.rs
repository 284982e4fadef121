//! Frame buffers and the pixel precisions shaders operate on.

use bytemuck::{Pod, Zeroable};
use serde::Deserialize;

use crate::error::{Result, ShaderError};

/// Storage precision of shader frames: 8-bit, half-float or float RGBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Rgba8,
    Half,
    Float,
}

impl Precision {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            Precision::Rgba8 => 4,
            Precision::Half => 8,
            Precision::Float => 16,
        }
    }

    pub fn texture_format(&self) -> wgpu::TextureFormat {
        match self {
            Precision::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
            Precision::Half => wgpu::TextureFormat::Rgba16Float,
            Precision::Float => wgpu::TextureFormat::Rgba32Float,
        }
    }
}

/// Dimensions and precision of the frames a clip produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub precision: Precision,
}

impl FrameInfo {
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.precision.bytes_per_pixel()
    }
}

/// CPU-visible frame. Rows are `pitch` bytes apart, which may exceed the
/// packed row size.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameBuffer {
    pub width: u32,
    pub height: u32,
    pub pitch: usize,
    pub precision: Precision,
    pub data: Vec<u8>,
}

impl FrameBuffer {
    /// Zeroed frame with tightly packed rows.
    pub fn new(info: FrameInfo) -> Self {
        let pitch = info.row_bytes();
        Self {
            width: info.width,
            height: info.height,
            pitch,
            precision: info.precision,
            data: vec![0; pitch * info.height as usize],
        }
    }

    pub fn from_data(info: FrameInfo, pitch: usize, data: Vec<u8>) -> Result<Self> {
        let frame = Self {
            width: info.width,
            height: info.height,
            pitch,
            precision: info.precision,
            data,
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            width: self.width,
            height: self.height,
            precision: self.precision,
        }
    }

    fn validate(&self) -> Result<()> {
        let row = self.info().row_bytes();
        if self.pitch < row {
            return Err(ShaderError::FrameMismatch(format!(
                "pitch {} is smaller than a {row}-byte row",
                self.pitch
            )));
        }
        let needed = required_len(self.pitch, row, self.height as usize);
        if self.data.len() < needed {
            return Err(ShaderError::BufferTooSmall {
                needed,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Encodes an 8-bit RGBA image at `precision`. Float precisions map
    /// channels to the 0..1 range shaders expect.
    pub fn from_rgba_image(image: &image::RgbaImage, precision: Precision) -> Self {
        let info = FrameInfo {
            width: image.width(),
            height: image.height(),
            precision,
        };
        let mut frame = Self::new(info);
        let bpc = precision.bytes_per_pixel() / 4;
        for (channel, out) in image
            .as_raw()
            .iter()
            .zip(frame.data.chunks_exact_mut(bpc))
        {
            let unit = *channel as f32 / 255.0;
            match precision {
                Precision::Rgba8 => out[0] = *channel,
                Precision::Half => out.copy_from_slice(&half::f16::from_f32(unit).to_le_bytes()),
                Precision::Float => out.copy_from_slice(&unit.to_le_bytes()),
            }
        }
        frame
    }

    /// Decodes back to 8-bit RGBA, clamping float channels to 0..1.
    pub fn to_rgba_image(&self) -> Result<image::RgbaImage> {
        self.validate()?;
        let bpc = self.precision.bytes_per_pixel() / 4;
        let row = self.info().row_bytes();
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..self.height as usize {
            let start = y * self.pitch;
            for channel in self.data[start..start + row].chunks_exact(bpc) {
                let byte = match self.precision {
                    Precision::Rgba8 => channel[0],
                    Precision::Half => to_byte(half::f16::from_le_bytes([channel[0], channel[1]]).to_f32()),
                    Precision::Float => {
                        to_byte(f32::from_le_bytes([channel[0], channel[1], channel[2], channel[3]]))
                    }
                };
                pixels.push(byte);
            }
        }
        image::RgbaImage::from_raw(self.width, self.height, pixels).ok_or_else(|| {
            ShaderError::FrameMismatch("decoded pixel count does not match dimensions".into())
        })
    }
}

fn to_byte(unit: f32) -> u8 {
    (unit.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Bytes spanned by `rows` rows of `row` bytes placed `pitch` apart.
pub fn required_len(pitch: usize, row: usize, rows: usize) -> usize {
    match rows {
        0 => 0,
        n => pitch * (n - 1) + row,
    }
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub tex_coords: [f32; 2],
}

impl QuadVertex {
    /// Vertices for a full-screen quad.
    pub const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    /// Indices for the quad (two triangles).
    pub const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}
