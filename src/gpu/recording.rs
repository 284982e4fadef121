//! CPU stand-in for the GPU used by tests.
//!
//! Textures are byte vectors. A draw fills its target with the one-based
//! draw number so tests can tell which pass produced a readback.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::constants::{ConstantLayout, ConstantSlot, ConstantType};
use super::{GpuBackend, SurfaceKind};
use crate::command::{ShaderId, MAX_INPUTS};
use crate::error::{Result, ShaderError};

#[derive(Debug, Clone)]
pub struct RecordedTexture {
    id: usize,
    kind: SurfaceKind,
    width: u32,
    height: u32,
    pixels: Arc<Mutex<Vec<u8>>>,
}

impl RecordedTexture {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.pixels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct RecordedProgram {
    pub shader: ShaderId,
}

/// One draw as the backend saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub shader: ShaderId,
    /// Texture ids bound per input slot.
    pub inputs: [Option<usize>; MAX_INPUTS],
    pub target: usize,
    pub constants: Vec<u8>,
}

pub struct RecordingBackend {
    bytes_per_pixel: usize,
    next_texture: usize,
    textures_created: usize,
    compiles: usize,
    uploads: usize,
    device_recreations: usize,
    draws: Vec<DrawCall>,
    layouts: HashMap<String, ConstantLayout>,
    failing: HashSet<String>,
    lose_on_draw: Option<usize>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new(4)
    }
}

impl RecordingBackend {
    pub fn new(bytes_per_pixel: usize) -> Self {
        Self {
            bytes_per_pixel,
            next_texture: 0,
            textures_created: 0,
            compiles: 0,
            uploads: 0,
            device_recreations: 0,
            draws: Vec::new(),
            layouts: HashMap::new(),
            failing: HashSet::new(),
            lose_on_draw: None,
        }
    }

    /// Layout reported for shaders at `locator`. Unlisted shaders declare a
    /// single `gain: vec4<f32>`.
    pub fn with_layout(mut self, locator: &str, layout: ConstantLayout) -> Self {
        self.layouts.insert(locator.to_string(), layout);
        self
    }

    pub fn fail_compile(&mut self, locator: &str) {
        self.failing.insert(locator.to_string());
    }

    /// Reports device loss on the `n`th draw from now, once.
    pub fn lose_device_on_draw(&mut self, n: usize) {
        self.lose_on_draw = Some(self.draws.len() + n);
    }

    pub fn draws(&self) -> &[DrawCall] {
        &self.draws
    }

    pub fn textures_created(&self) -> usize {
        self.textures_created
    }

    pub fn compiles(&self) -> usize {
        self.compiles
    }

    pub fn uploads(&self) -> usize {
        self.uploads
    }

    pub fn device_recreations(&self) -> usize {
        self.device_recreations
    }

    fn default_layout() -> ConstantLayout {
        let mut layout = ConstantLayout::new(16);
        layout.insert(
            "gain",
            ConstantSlot {
                offset: 0,
                ty: ConstantType::Float(4),
            },
        );
        layout
    }
}

impl GpuBackend for RecordingBackend {
    type Texture = RecordedTexture;
    type Program = RecordedProgram;

    fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    fn create_texture(&mut self, kind: SurfaceKind, width: u32, height: u32) -> Result<RecordedTexture> {
        self.next_texture += 1;
        self.textures_created += 1;
        let len = width as usize * height as usize * self.bytes_per_pixel;
        Ok(RecordedTexture {
            id: self.next_texture,
            kind,
            width,
            height,
            pixels: Arc::new(Mutex::new(vec![0; len])),
        })
    }

    fn upload(
        &mut self,
        texture: &RecordedTexture,
        src: &[u8],
        src_pitch: usize,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let row = width.min(texture.width) as usize * self.bytes_per_pixel;
        let dst_pitch = texture.width as usize * self.bytes_per_pixel;
        let mut pixels = texture.lock();
        for y in 0..height.min(texture.height) as usize {
            let from = &src[y * src_pitch..y * src_pitch + row];
            pixels[y * dst_pitch..y * dst_pitch + row].copy_from_slice(from);
        }
        self.uploads += 1;
        Ok(())
    }

    fn download(
        &mut self,
        texture: &RecordedTexture,
        dst: &mut [u8],
        dst_pitch: usize,
        width: u32,
        height: u32,
    ) -> Result<()> {
        if texture.kind != SurfaceKind::RenderTarget {
            return Err(ShaderError::Device("download from an input texture".into()));
        }
        let row = width.min(texture.width) as usize * self.bytes_per_pixel;
        let src_pitch = texture.width as usize * self.bytes_per_pixel;
        let pixels = texture.lock();
        for y in 0..height.min(texture.height) as usize {
            dst[y * dst_pitch..y * dst_pitch + row]
                .copy_from_slice(&pixels[y * src_pitch..y * src_pitch + row]);
        }
        Ok(())
    }

    fn compile(&mut self, shader: &ShaderId) -> Result<(RecordedProgram, ConstantLayout)> {
        if self.failing.contains(shader.locator()) {
            return Err(ShaderError::ShaderLoadFailed {
                shader: shader.to_string(),
                reason: "rejected by test backend".into(),
            });
        }
        self.compiles += 1;
        let layout = self
            .layouts
            .get(shader.locator())
            .cloned()
            .unwrap_or_else(Self::default_layout);
        Ok((
            RecordedProgram {
                shader: shader.clone(),
            },
            layout,
        ))
    }

    fn draw(
        &mut self,
        program: &RecordedProgram,
        inputs: [Option<&RecordedTexture>; MAX_INPUTS],
        constants: &[u8],
        target: &RecordedTexture,
    ) -> Result<()> {
        if self.lose_on_draw == Some(self.draws.len() + 1) {
            self.lose_on_draw = None;
            return Err(ShaderError::DeviceLost);
        }
        self.draws.push(DrawCall {
            shader: program.shader.clone(),
            inputs: inputs.map(|t| t.map(|t| t.id)),
            target: target.id,
            constants: constants.to_vec(),
        });
        let marker = self.draws.len() as u8;
        target.lock().fill(marker);
        Ok(())
    }

    fn recreate_device(&mut self) -> Result<()> {
        self.device_recreations += 1;
        Ok(())
    }
}
