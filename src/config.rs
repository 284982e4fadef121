//! YAML description of a shader chain.
//!
//! ```yaml
//! precision: half
//! gpu:
//!   power_preference: high
//!   pool_capacity: 50
//! inputs:
//!   - clip: 1
//!     path: photo.png
//! stages:
//!   - shader: shaders/tint.wgsl
//!     shader_model: wgsl
//!     entry_point: fs_main
//!     params: ["gain=1.5f", "tint=1,0.8,0.6,1f"]
//!     output: 10
//!   - shader: shaders/blur.spv
//!     inputs: [10]
//!     output: 11
//!     width: 640
//!     height: 360
//! ```
//!
//! Relative paths are resolved against the directory of the config file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::command::{ClipId, Invocation, ShaderId, MAX_INPUTS, MAX_PARAMS};
use crate::error::{Result, ShaderError};
use crate::frame::Precision;
use crate::gpu::{GpuOptions, PoolConfig, PowerPreference, DEFAULT_POOL_CAPACITY};
use crate::input::ImageSource;
use crate::pipeline::{ChainRoot, CommandSource, FrameSource, ShaderStage, DEFAULT_DEVICE_RETRIES};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_device_retries")]
    pub device_retries: u32,
    #[serde(default)]
    pub gpu: GpuConfig,
    #[serde(default)]
    pub inputs: Vec<InputConfig>,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GpuConfig {
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
    pub pool_capacity: usize,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            power_preference: PowerPreference::default(),
            force_fallback_adapter: false,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl GpuConfig {
    pub fn options(&self) -> GpuOptions {
        GpuOptions {
            power_preference: self.power_preference,
            force_fallback_adapter: self.force_fallback_adapter,
        }
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.pool_capacity,
        }
    }
}

/// An image file bound to a clip id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputConfig {
    pub clip: u32,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    /// Source file, or a SPIR-V blob when `shader_model` is absent.
    pub shader: PathBuf,
    pub shader_model: Option<String>,
    pub entry_point: Option<String>,
    #[serde(default)]
    pub params: Vec<String>,
    /// Defaults to the previous stage's output, or the first input for the
    /// first stage. `~` leaves a slot unbound.
    pub inputs: Option<Vec<Option<u32>>>,
    pub output: u32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

fn default_device_retries() -> u32 {
    DEFAULT_DEVICE_RETRIES
}

impl ChainConfig {
    /// Reads, resolves and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::parse(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        info!(path = %path.display(), stages = config.stages.len(), "chain config loaded");
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(content).map_err(|e| ShaderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the chain description. Run again after overriding fields.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(ShaderError::Config("at least one stage is required".into()));
        }
        if self.gpu.pool_capacity == 0 {
            return Err(ShaderError::Config("pool_capacity must be positive".into()));
        }
        let mut seen = BTreeMap::new();
        for input in &self.inputs {
            if let Some(previous) = seen.insert(input.clip, &input.path) {
                return Err(ShaderError::Config(format!(
                    "clip {} is bound to both {} and {}",
                    input.clip,
                    previous.display(),
                    input.path.display()
                )));
            }
        }
        for (index, stage) in self.stages.iter().enumerate() {
            if stage.params.len() > MAX_PARAMS {
                return Err(ShaderError::Config(format!(
                    "stage {index} has {} params, at most {MAX_PARAMS} are supported",
                    stage.params.len()
                )));
            }
            if stage.inputs.as_ref().is_some_and(|inputs| inputs.len() > MAX_INPUTS) {
                return Err(ShaderError::Config(format!(
                    "stage {index} has more than {MAX_INPUTS} inputs"
                )));
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        self.inputs.iter_mut().for_each(|input| resolve(&mut input.path));
        self.stages.iter_mut().for_each(|stage| resolve(&mut stage.shader));
    }

    /// One invocation per stage, with default input bindings filled in.
    pub fn invocations(&self) -> Vec<Invocation> {
        let mut previous = self.inputs.first().map(|input| input.clip);
        self.stages
            .iter()
            .map(|stage| {
                let inputs = match &stage.inputs {
                    Some(inputs) => inputs.iter().map(|clip| clip.map(ClipId)).collect(),
                    None => previous.map(|clip| vec![Some(ClipId(clip))]).unwrap_or_default(),
                };
                previous = Some(stage.output);
                Invocation {
                    shader: stage.shader_id(),
                    params: stage.params.clone(),
                    inputs,
                    output: ClipId(stage.output),
                    width: stage.width,
                    height: stage.height,
                }
            })
            .collect()
    }

    /// Builds the stages in order. Parameter errors surface here.
    pub fn build_chain(&self) -> Result<ShaderStage> {
        let mut last: Option<ShaderStage> = None;
        for invocation in self.invocations() {
            let upstream: &dyn CommandSource = match &last {
                Some(stage) => stage,
                None => &ChainRoot,
            };
            last = Some(ShaderStage::new(upstream, &invocation)?);
        }
        last.ok_or_else(|| ShaderError::Config("at least one stage is required".into()))
    }

    /// Opens every configured input at the chain's precision.
    pub fn open_inputs(&self) -> Result<BTreeMap<ClipId, Arc<dyn FrameSource>>> {
        self.inputs
            .iter()
            .map(|input| {
                let source: Arc<dyn FrameSource> =
                    Arc::new(ImageSource::open(&input.path, self.precision)?);
                Ok((ClipId(input.clip), source))
            })
            .collect()
    }
}

impl StageConfig {
    pub fn shader_id(&self) -> ShaderId {
        let locator = self.shader.to_string_lossy().into_owned();
        match &self.shader_model {
            Some(model) => {
                let entry_point = self.entry_point.clone().unwrap_or_else(|| {
                    if model.to_ascii_lowercase().starts_with("glsl") {
                        "main".to_string()
                    } else {
                        "fs_main".to_string()
                    }
                });
                ShaderId::Source {
                    locator,
                    entry_point,
                    shader_model: model.clone(),
                }
            }
            None => ShaderId::Precompiled { locator },
        }
    }
}
