//! Texture pools, shader cache and constant staging on top of a [`GpuBackend`].

use std::collections::HashMap;

use tracing::{debug, error, warn};

use super::constants::{self, ConstantLayout};
use super::{GpuBackend, SurfaceKind};
use crate::command::{ClipId, ShaderId, MAX_INPUTS};
use crate::error::{PoolKind, Result, ShaderError};
use crate::frame::required_len;
use crate::param::ParamValue;

pub const DEFAULT_POOL_CAPACITY: usize = 50;

/// Pool sizing. The capacity applies to input textures and render targets
/// separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

/// Ownership of a pool slot within the current epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTag {
    Free,
    /// Render target handed out but not yet registered under a clip.
    Claimed,
    Clip(ClipId),
}

/// Handle to a pooled texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSlot {
    kind: SurfaceKind,
    index: usize,
}

impl TextureSlot {
    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

struct Slot<T> {
    texture: Option<T>,
    width: u32,
    height: u32,
    tag: SlotTag,
}

struct Pool<T> {
    kind: SurfaceKind,
    capacity: usize,
    slots: Vec<Slot<T>>,
}

impl<T> Pool<T> {
    fn new(kind: SurfaceKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity,
            slots: Vec::new(),
        }
    }

    fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.tag = SlotTag::Free;
        }
    }

    fn invalidate(&mut self) {
        for slot in &mut self.slots {
            slot.texture = None;
            slot.tag = SlotTag::Free;
        }
    }

    fn find_tagged(&self, clip: ClipId) -> Option<usize> {
        self.slots.iter().position(|s| s.tag == SlotTag::Clip(clip))
    }

    /// Picks a free slot, preferring one whose storage already has the
    /// requested size, then a never-used slot, then any free slot.
    fn claim(&mut self, width: u32, height: u32) -> Result<usize> {
        let free = |s: &Slot<T>| s.tag == SlotTag::Free;
        if let Some(index) = self
            .slots
            .iter()
            .position(|s| free(s) && s.texture.is_some() && s.width == width && s.height == height)
        {
            return Ok(index);
        }
        if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                texture: None,
                width: 0,
                height: 0,
                tag: SlotTag::Free,
            });
            return Ok(self.slots.len() - 1);
        }
        self.slots
            .iter()
            .position(free)
            .ok_or(ShaderError::PoolExhausted {
                kind: self.pool_kind(),
                capacity: self.capacity,
            })
    }

    fn needs_storage(&self, index: usize, width: u32, height: u32) -> bool {
        let slot = &self.slots[index];
        slot.texture.is_none() || slot.width != width || slot.height != height
    }

    fn texture(&self, index: usize) -> Result<&T> {
        self.slots
            .get(index)
            .and_then(|s| s.texture.as_ref())
            .ok_or_else(|| ShaderError::Device(format!("{} slot {index} has no storage", self.pool_kind())))
    }

    fn pool_kind(&self) -> PoolKind {
        match self.kind {
            SurfaceKind::Input => PoolKind::InputTexture,
            SurfaceKind::RenderTarget => PoolKind::RenderTarget,
        }
    }
}

/// Index of a loaded shader in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShaderKey(usize);

/// Loaded program, its constant table and the constants staged for the
/// next draw.
pub struct ShaderCacheEntry<P> {
    id: ShaderId,
    program: P,
    layout: ConstantLayout,
    staging: Vec<u8>,
}

impl<P> ShaderCacheEntry<P> {
    pub fn id(&self) -> &ShaderId {
        &self.id
    }

    pub fn layout(&self) -> &ConstantLayout {
        &self.layout
    }

    pub fn staged_constants(&self) -> &[u8] {
        &self.staging
    }
}

/// Owns the backend, the input texture and render target pools and the
/// shader cache.
///
/// Pool slots are tagged with the clip they hold. Tags live for one epoch:
/// [`ResourceManager::reset_epoch`] frees every slot but keeps its storage
/// for reuse.
pub struct ResourceManager<B: GpuBackend> {
    backend: B,
    config: PoolConfig,
    inputs: Pool<B::Texture>,
    targets: Pool<B::Texture>,
    shaders: Vec<ShaderCacheEntry<B::Program>>,
    shader_index: HashMap<ShaderId, ShaderKey>,
    epoch: u64,
}

impl<B: GpuBackend> ResourceManager<B> {
    pub fn new(backend: B, config: PoolConfig) -> Self {
        Self {
            backend,
            config,
            inputs: Pool::new(SurfaceKind::Input, config.capacity),
            targets: Pool::new(SurfaceKind::RenderTarget, config.capacity),
            shaders: Vec::new(),
            shader_index: HashMap::new(),
            epoch: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Frees every slot. Call once before each independent materialization.
    pub fn reset_epoch(&mut self) {
        self.inputs.reset();
        self.targets.reset();
        self.epoch += 1;
    }

    pub fn acquire_input_texture(
        &mut self,
        clip: ClipId,
        width: u32,
        height: u32,
    ) -> Result<TextureSlot> {
        check_size(width, height)?;
        let index = match self.inputs.find_tagged(clip) {
            Some(index) => index,
            None => self.inputs.claim(width, height)?,
        };
        self.ensure_storage(SurfaceKind::Input, index, width, height)?;
        self.inputs.slots[index].tag = SlotTag::Clip(clip);
        debug!(%clip, index, width, height, "input texture acquired");
        Ok(TextureSlot {
            kind: SurfaceKind::Input,
            index,
        })
    }

    pub fn acquire_render_target(&mut self, width: u32, height: u32) -> Result<TextureSlot> {
        check_size(width, height)?;
        let index = self.targets.claim(width, height)?;
        self.ensure_storage(SurfaceKind::RenderTarget, index, width, height)?;
        self.targets.slots[index].tag = SlotTag::Claimed;
        debug!(index, width, height, "render target acquired");
        Ok(TextureSlot {
            kind: SurfaceKind::RenderTarget,
            index,
        })
    }

    /// Registers a drawn render target under `clip`. A target previously
    /// registered under the same clip in this epoch is released.
    pub fn tag_render_target(&mut self, slot: TextureSlot, clip: ClipId) -> Result<()> {
        self.expect_target(slot)?;
        if let Some(previous) = self.targets.find_tagged(clip) {
            if previous != slot.index {
                self.targets.slots[previous].tag = SlotTag::Free;
            }
        }
        self.targets.slots[slot.index].tag = SlotTag::Clip(clip);
        Ok(())
    }

    /// Render target registered under `clip` in the current epoch.
    pub fn render_target_for(&self, clip: ClipId) -> Option<TextureSlot> {
        self.targets.find_tagged(clip).map(|index| TextureSlot {
            kind: SurfaceKind::RenderTarget,
            index,
        })
    }

    pub fn slot_tag(&self, slot: TextureSlot) -> Option<SlotTag> {
        let pool = pool_for(&self.inputs, &self.targets, slot.kind);
        pool.slots.get(slot.index).map(|s| s.tag)
    }

    pub fn slot_size(&self, slot: TextureSlot) -> Option<(u32, u32)> {
        let pool = pool_for(&self.inputs, &self.targets, slot.kind);
        pool.slots.get(slot.index).map(|s| (s.width, s.height))
    }

    pub fn upload_to_texture(
        &mut self,
        slot: TextureSlot,
        src: &[u8],
        src_pitch: usize,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.check_buffer(src.len(), src_pitch, width, height)?;
        let result = match pool_for(&self.inputs, &self.targets, slot.kind).texture(slot.index) {
            Ok(texture) => self.backend.upload(texture, src, src_pitch, width, height),
            Err(err) => Err(err),
        };
        self.checked(result)
    }

    pub fn download_from_target(
        &mut self,
        slot: TextureSlot,
        dst: &mut [u8],
        dst_pitch: usize,
        width: u32,
        height: u32,
    ) -> Result<()> {
        self.expect_target(slot)?;
        self.check_buffer(dst.len(), dst_pitch, width, height)?;
        let result = match self.targets.texture(slot.index) {
            Ok(texture) => self.backend.download(texture, dst, dst_pitch, width, height),
            Err(err) => Err(err),
        };
        self.checked(result)
    }

    /// Returns the cached entry for `shader`, loading it on first use. The
    /// entry's staged constants are cleared either way.
    pub fn get_or_compile_shader(&mut self, shader: &ShaderId) -> Result<ShaderKey> {
        if let Some(key) = self.shader_index.get(shader).copied() {
            debug!(%shader, "shader cache hit");
            self.shaders[key.0].staging.fill(0);
            return Ok(key);
        }

        let compiled = self.backend.compile(shader);
        let (program, layout) = self.checked(compiled)?;
        debug!(%shader, constants = layout.len(), "shader loaded");
        let key = ShaderKey(self.shaders.len());
        self.shaders.push(ShaderCacheEntry {
            id: shader.clone(),
            program,
            staging: vec![0; layout.size() as usize],
            layout,
        });
        self.shader_index.insert(shader.clone(), key);
        Ok(key)
    }

    pub fn shader(&self, key: ShaderKey) -> Option<&ShaderCacheEntry<B::Program>> {
        self.shaders.get(key.0)
    }

    pub fn cached_shaders(&self) -> usize {
        self.shaders.len()
    }

    /// Stages a constant for the next draw with `key`. Names the shader does
    /// not declare are ignored.
    pub fn bind_constant(&mut self, key: ShaderKey, name: &str, value: &ParamValue) -> Result<()> {
        let entry = self.shaders.get_mut(key.0).ok_or_else(|| stale_key(key))?;
        let Some(slot) = entry.layout.get(name).copied() else {
            debug!(shader = %entry.id, name, "shader does not declare constant, ignoring");
            return Ok(());
        };
        if !slot.ty.accepts(value.kind()) {
            return Err(ShaderError::ConstantTypeMismatch {
                name: name.to_string(),
                expected: slot.ty.to_string(),
                found: value.kind().name(),
            });
        }
        constants::pack(&mut entry.staging, &slot, value);
        Ok(())
    }

    pub fn draw(
        &mut self,
        key: ShaderKey,
        inputs: [Option<TextureSlot>; MAX_INPUTS],
        target: TextureSlot,
    ) -> Result<()> {
        self.expect_target(target)?;
        let result = (|| {
            let entry = self.shaders.get(key.0).ok_or_else(|| stale_key(key))?;
            let target = self.targets.texture(target.index)?;
            let mut bound: [Option<&B::Texture>; MAX_INPUTS] = [None; MAX_INPUTS];
            for (dst, slot) in bound.iter_mut().zip(inputs) {
                if let Some(slot) = slot {
                    *dst = Some(pool_for(&self.inputs, &self.targets, slot.kind).texture(slot.index)?);
                }
            }
            self.backend.draw(&entry.program, bound, &entry.staging, target)
        })();
        self.checked(result)
    }

    fn ensure_storage(&mut self, kind: SurfaceKind, index: usize, width: u32, height: u32) -> Result<()> {
        let pool = match kind {
            SurfaceKind::Input => &mut self.inputs,
            SurfaceKind::RenderTarget => &mut self.targets,
        };
        if !pool.needs_storage(index, width, height) {
            return Ok(());
        }
        let created = self.backend.create_texture(kind, width, height);
        let texture = self.checked(created)?;
        let pool = match kind {
            SurfaceKind::Input => &mut self.inputs,
            SurfaceKind::RenderTarget => &mut self.targets,
        };
        let slot = &mut pool.slots[index];
        slot.texture = Some(texture);
        slot.width = width;
        slot.height = height;
        Ok(())
    }

    /// A CPU buffer must hold `height` rows of `width` texels `pitch` apart.
    fn check_buffer(&self, len: usize, pitch: usize, width: u32, height: u32) -> Result<()> {
        let row = width as usize * self.backend.bytes_per_pixel();
        if pitch < row {
            return Err(ShaderError::FrameMismatch(format!(
                "pitch {pitch} is smaller than a {row}-byte row"
            )));
        }
        let needed = required_len(pitch, row, height as usize);
        if len < needed {
            return Err(ShaderError::BufferTooSmall { needed, actual: len });
        }
        Ok(())
    }

    fn expect_target(&self, slot: TextureSlot) -> Result<()> {
        if slot.kind != SurfaceKind::RenderTarget || slot.index >= self.targets.slots.len() {
            return Err(ShaderError::Device(format!(
                "{:?} slot {} is not a render target",
                slot.kind, slot.index
            )));
        }
        Ok(())
    }

    /// Passes `result` through, rebuilding the device and dropping every
    /// device resource when it reports device loss.
    fn checked<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ShaderError::DeviceLost) = &result {
            warn!(epoch = self.epoch, "GPU device lost, recreating");
            self.inputs.invalidate();
            self.targets.invalidate();
            self.shaders.clear();
            self.shader_index.clear();
            self.epoch += 1;
            if let Err(err) = self.backend.recreate_device() {
                error!("failed to recreate GPU device: {err}");
            }
        }
        result
    }
}

fn pool_for<'a, T>(inputs: &'a Pool<T>, targets: &'a Pool<T>, kind: SurfaceKind) -> &'a Pool<T> {
    match kind {
        SurfaceKind::Input => inputs,
        SurfaceKind::RenderTarget => targets,
    }
}

fn check_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(ShaderError::FrameMismatch(format!(
            "cannot create a {width}x{height} texture"
        )));
    }
    Ok(())
}

fn stale_key(key: ShaderKey) -> ShaderError {
    ShaderError::Device(format!("shader {} is no longer cached", key.0))
}
