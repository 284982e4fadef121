//! GPU side of the pipeline.
//!
//! `resources` owns the texture pools and shader cache and drives a
//! [`GpuBackend`]. `wgpu_backend` is the real backend, sharing a process-wide
//! [`GpuContext`]; `reflect` loads shaders and extracts their constant tables.

mod constants;
mod context;
#[cfg(test)]
pub(crate) mod recording;
mod reflect;
mod resources;
mod wgpu_backend;

pub use constants::{ConstantLayout, ConstantSlot, ConstantType};
pub use context::{DeviceHandles, GpuContext, GpuOptions, PowerPreference};
pub use reflect::{load_shader, LoadedShader};
pub use resources::{
    PoolConfig, ResourceManager, ShaderCacheEntry, ShaderKey, SlotTag, TextureSlot,
    DEFAULT_POOL_CAPACITY,
};
pub use wgpu_backend::WgpuBackend;

use crate::command::{ShaderId, MAX_INPUTS};
use crate::error::Result;

/// What a texture is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    /// Filled from the CPU and sampled by shaders.
    Input,
    /// Drawn into, sampled by later commands and read back to the CPU.
    RenderTarget,
}

/// Opaque GPU operations the resource manager is built on.
///
/// Every call is synchronous from the caller's point of view. Operations
/// report [`ShaderError::DeviceLost`](crate::error::ShaderError::DeviceLost)
/// when the device became invalid; the manager then calls
/// [`GpuBackend::recreate_device`].
pub trait GpuBackend {
    type Texture;
    type Program;

    /// Size of one texel of every texture the backend creates.
    fn bytes_per_pixel(&self) -> usize;

    fn create_texture(&mut self, kind: SurfaceKind, width: u32, height: u32)
        -> Result<Self::Texture>;

    /// Copies `height` rows of `width` pixels from `src`, rows `src_pitch`
    /// bytes apart.
    fn upload(
        &mut self,
        texture: &Self::Texture,
        src: &[u8],
        src_pitch: usize,
        width: u32,
        height: u32,
    ) -> Result<()>;

    /// Copies the top-left `width` x `height` pixels into `dst`, rows
    /// `dst_pitch` bytes apart.
    fn download(
        &mut self,
        texture: &Self::Texture,
        dst: &mut [u8],
        dst_pitch: usize,
        width: u32,
        height: u32,
    ) -> Result<()>;

    fn compile(&mut self, shader: &ShaderId) -> Result<(Self::Program, ConstantLayout)>;

    /// Full-frame pass of `program` into `target`.
    fn draw(
        &mut self,
        program: &Self::Program,
        inputs: [Option<&Self::Texture>; MAX_INPUTS],
        constants: &[u8],
        target: &Self::Texture,
    ) -> Result<()>;

    /// Replaces a lost device. Every texture and program created before is
    /// invalid afterwards.
    fn recreate_device(&mut self) -> Result<()>;
}
