//! Pull-graph nodes that carry command logs and produce frames.
//!
//! Shader stages only extend the command log they pull from their upstream
//! node. The GPU runs when an [`ExecuteShader`] node is asked for a frame.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::command::{build_command, ClipId, CommandDescriptor, CommandLog, Invocation};
use crate::error::{Result, ShaderError};
use crate::executor::{self, Plan};
use crate::frame::{FrameBuffer, FrameInfo, Precision};
use crate::gpu::{GpuBackend, ResourceManager};

/// A node that carries a command log downstream.
pub trait CommandSource {
    fn command_log(&self) -> CommandLog;
}

/// A node that produces frames on request.
pub trait FrameSource: Send + Sync {
    fn info(&self) -> FrameInfo;
    fn get_frame(&self, n: u64) -> Result<FrameBuffer>;
}

/// Start of a shader chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChainRoot;

impl CommandSource for ChainRoot {
    fn command_log(&self) -> CommandLog {
        CommandLog::new()
    }
}

/// Appends one shader invocation to its upstream chain.
#[derive(Debug, Clone)]
pub struct ShaderStage {
    descriptor: CommandDescriptor,
    log: CommandLog,
}

impl ShaderStage {
    /// Builds the command immediately so configuration errors surface before
    /// any frame is requested.
    pub fn new(upstream: &dyn CommandSource, invocation: &Invocation) -> Result<Self> {
        let (descriptor, log) = build_command(invocation, &upstream.command_log())?;
        debug!(
            sequence = descriptor.sequence_index,
            shader = %descriptor.shader,
            "shader stage added"
        );
        Ok(Self { descriptor, log })
    }

    pub fn descriptor(&self) -> &CommandDescriptor {
        &self.descriptor
    }
}

impl CommandSource for ShaderStage {
    fn command_log(&self) -> CommandLog {
        self.log.clone()
    }
}

/// Serves the same frame for every request.
#[derive(Debug, Clone)]
pub struct MemorySource {
    frame: FrameBuffer,
}

impl MemorySource {
    pub fn new(frame: FrameBuffer) -> Self {
        Self { frame }
    }
}

impl FrameSource for MemorySource {
    fn info(&self) -> FrameInfo {
        self.frame.info()
    }

    fn get_frame(&self, _n: u64) -> Result<FrameBuffer> {
        Ok(self.frame.clone())
    }
}

pub const DEFAULT_DEVICE_RETRIES: u32 = 1;

/// Terminal node: materializes a chain for every requested frame.
pub struct ExecuteShader<B: GpuBackend> {
    plan: Plan,
    info: FrameInfo,
    inputs: BTreeMap<ClipId, Arc<dyn FrameSource>>,
    resources: Arc<Mutex<ResourceManager<B>>>,
    device_retries: u32,
}

impl<B: GpuBackend> ExecuteShader<B> {
    /// Binds the external clips of `commands` to frame sources. Fails when
    /// the chain reads a clip nothing provides or when a source's precision
    /// differs from `precision`.
    pub fn new(
        commands: &dyn CommandSource,
        inputs: BTreeMap<ClipId, Arc<dyn FrameSource>>,
        resources: Arc<Mutex<ResourceManager<B>>>,
        precision: Precision,
    ) -> Result<Self> {
        let bpp = lock(&resources).backend().bytes_per_pixel();
        if bpp != precision.bytes_per_pixel() {
            return Err(ShaderError::FrameMismatch(format!(
                "backend texels are {bpp} bytes, {precision:?} needs {}",
                precision.bytes_per_pixel()
            )));
        }

        let mut infos = BTreeMap::new();
        for (clip, source) in &inputs {
            let info = source.info();
            if info.precision != precision {
                return Err(ShaderError::FrameMismatch(format!(
                    "clip {clip} is {:?}, the chain runs at {precision:?}",
                    info.precision
                )));
            }
            infos.insert(*clip, info);
        }

        let plan = executor::plan(&commands.command_log(), &infos)?;
        let (width, height) = plan.output_size();
        Ok(Self {
            plan,
            info: FrameInfo {
                width,
                height,
                precision,
            },
            inputs,
            resources,
            device_retries: DEFAULT_DEVICE_RETRIES,
        })
    }

    /// How often a frame is re-run from scratch after device loss.
    pub fn with_device_retries(mut self, retries: u32) -> Self {
        self.device_retries = retries;
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn resources(&self) -> &Arc<Mutex<ResourceManager<B>>> {
        &self.resources
    }
}

impl<B> FrameSource for ExecuteShader<B>
where
    B: GpuBackend,
    ResourceManager<B>: Send,
{
    fn info(&self) -> FrameInfo {
        self.info
    }

    fn get_frame(&self, n: u64) -> Result<FrameBuffer> {
        // Upstream sources may run chains of their own on the same resources,
        // so they are pulled before taking the lock.
        let mut frames = BTreeMap::new();
        for clip in self.plan.external_inputs() {
            let source = self
                .inputs
                .get(&clip)
                .ok_or_else(|| ShaderError::Config(format!("no source bound to clip {clip}")))?;
            let frame = source.get_frame(n)?;
            let expected = source.info();
            if frame.info() != expected {
                return Err(ShaderError::FrameMismatch(format!(
                    "clip {clip} frame {n} is {}x{} {:?}, expected {}x{} {:?}",
                    frame.width,
                    frame.height,
                    frame.precision,
                    expected.width,
                    expected.height,
                    expected.precision
                )));
            }
            frames.insert(clip, frame);
        }

        let mut output = FrameBuffer::new(self.info);
        let mut attempt = 0;
        loop {
            let result = executor::execute(
                &mut lock(&self.resources),
                &self.plan,
                &frames,
                &mut output.data,
                output.pitch,
            );
            match result {
                Ok(()) => return Ok(output),
                Err(ShaderError::DeviceLost) if attempt < self.device_retries => {
                    attempt += 1;
                    warn!(frame = n, attempt, "device lost during materialization, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn lock<B: GpuBackend>(resources: &Mutex<ResourceManager<B>>) -> MutexGuard<'_, ResourceManager<B>> {
    resources.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ShaderId;
    use crate::error::ErrorKind;
    use crate::gpu::recording::RecordingBackend;
    use crate::gpu::PoolConfig;

    fn invocation(shader: &str, inputs: &[u32], output: u32, params: &[&str]) -> Invocation {
        Invocation {
            shader: ShaderId::Precompiled {
                locator: shader.into(),
            },
            params: params.iter().map(|p| p.to_string()).collect(),
            inputs: inputs.iter().map(|clip| Some(ClipId(*clip))).collect(),
            output: ClipId(output),
            width: 0,
            height: 0,
        }
    }

    fn source(size: u32) -> Arc<dyn FrameSource> {
        Arc::new(MemorySource::new(FrameBuffer::new(FrameInfo {
            width: size,
            height: size,
            precision: Precision::Rgba8,
        })))
    }

    fn resources() -> Arc<Mutex<ResourceManager<RecordingBackend>>> {
        Arc::new(Mutex::new(ResourceManager::new(
            RecordingBackend::default(),
            PoolConfig::default(),
        )))
    }

    #[test]
    fn stages_extend_their_upstream_log_only() {
        let a = ShaderStage::new(&ChainRoot, &invocation("a.spv", &[1], 10, &[])).unwrap();
        let b = ShaderStage::new(&a, &invocation("b.spv", &[10], 11, &[])).unwrap();
        // A second branch off the same stage.
        let c = ShaderStage::new(&a, &invocation("c.spv", &[10], 12, &[])).unwrap();

        assert_eq!(a.command_log().len(), 1);
        assert_eq!(b.descriptor().sequence_index, 1);
        assert_eq!(c.descriptor().sequence_index, 1);
        let b_log = b.command_log().descriptors().unwrap();
        let c_log = c.command_log().descriptors().unwrap();
        assert_eq!(b_log[1].shader.locator(), "b.spv");
        assert_eq!(c_log[1].shader.locator(), "c.spv");
        assert_eq!(b_log[0], c_log[0]);
    }

    #[test]
    fn bad_parameters_fail_at_construction() {
        let err = ShaderStage::new(&ChainRoot, &invocation("a.spv", &[1], 10, &["", "x=zzb", "y=1q"]))
            .unwrap_err();
        assert!(err.to_string().contains("parameter 3: y=1q"), "{err}");
        assert_eq!(err.kind(), ErrorKind::MalformedParameter);
    }

    #[test]
    fn execute_shader_produces_frames_of_the_planned_size() {
        let a = ShaderStage::new(&ChainRoot, &invocation("a.spv", &[1], 10, &[])).unwrap();
        let b = ShaderStage::new(&a, &invocation("b.spv", &[10], 11, &[])).unwrap();
        let node = ExecuteShader::new(
            &b,
            BTreeMap::from([(ClipId(1), source(64))]),
            resources(),
            Precision::Rgba8,
        )
        .unwrap();

        assert_eq!(node.info().width, 64);
        for n in 0..3 {
            let frame = node.get_frame(n).unwrap();
            assert_eq!((frame.width, frame.height), (64, 64));
            assert!(frame.data.iter().all(|b| *b == (2 * n + 2) as u8));
        }
        assert_eq!(lock(node.resources()).backend().compiles(), 2);
    }

    #[test]
    fn dangling_references_fail_at_construction() {
        let a = ShaderStage::new(&ChainRoot, &invocation("a.spv", &[7], 10, &[])).unwrap();
        let result = ExecuteShader::new(
            &a,
            BTreeMap::from([(ClipId(1), source(8))]),
            resources(),
            Precision::Rgba8,
        );
        assert!(matches!(
            result.map(|_| ()),
            Err(ShaderError::DanglingInputReference { sequence: 0, clip: 7 })
        ));
    }

    #[test]
    fn precision_mismatch_is_rejected() {
        let a = ShaderStage::new(&ChainRoot, &invocation("a.spv", &[1], 10, &[])).unwrap();
        let result = ExecuteShader::new(
            &a,
            BTreeMap::from([(ClipId(1), source(8))]),
            resources(),
            Precision::Float,
        );
        assert!(matches!(result.map(|_| ()), Err(ShaderError::FrameMismatch(_))));
    }

    #[test]
    fn device_loss_is_retried_from_scratch() {
        let a = ShaderStage::new(&ChainRoot, &invocation("a.spv", &[1], 10, &[])).unwrap();
        let b = ShaderStage::new(&a, &invocation("b.spv", &[10], 11, &[])).unwrap();
        let shared = resources();
        let node = ExecuteShader::new(
            &b,
            BTreeMap::from([(ClipId(1), source(16))]),
            shared.clone(),
            Precision::Rgba8,
        )
        .unwrap();

        lock(&shared).backend_mut().lose_device_on_draw(2);
        let frame = node.get_frame(0).unwrap();
        let resources = lock(&shared);
        let backend = resources.backend();
        assert_eq!(backend.device_recreations(), 1);
        // One draw before the loss, then both draws again.
        assert_eq!(backend.draws().len(), 3);
        assert_eq!(backend.compiles(), 4);
        assert!(frame.data.iter().all(|b| *b == 3));
    }

    #[test]
    fn without_retries_device_loss_fails_only_that_frame() {
        let a = ShaderStage::new(&ChainRoot, &invocation("a.spv", &[1], 10, &[])).unwrap();
        let shared = resources();
        let node = ExecuteShader::new(
            &a,
            BTreeMap::from([(ClipId(1), source(16))]),
            shared.clone(),
            Precision::Rgba8,
        )
        .unwrap()
        .with_device_retries(0);

        lock(&shared).backend_mut().lose_device_on_draw(1);
        let err = node.get_frame(0).unwrap_err();
        assert!(err.is_retryable());
        node.get_frame(1).unwrap();
    }

    #[test]
    fn concurrent_pulls_run_one_chain_at_a_time() {
        let a = ShaderStage::new(&ChainRoot, &invocation("a.spv", &[1], 10, &[])).unwrap();
        let b = ShaderStage::new(&a, &invocation("b.spv", &[10], 11, &[])).unwrap();
        let shared = resources();
        let node = ExecuteShader::new(
            &b,
            BTreeMap::from([(ClipId(1), source(32))]),
            shared.clone(),
            Precision::Rgba8,
        )
        .unwrap();

        let threads = 4;
        let frames: Vec<FrameBuffer> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|n| {
                    let node = &node;
                    scope.spawn(move || node.get_frame(n).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Each frame is the second draw of its own run, never a mix of runs.
        let mut markers: Vec<u8> = frames
            .iter()
            .map(|frame| {
                let marker = frame.data[0];
                assert!(frame.data.iter().all(|b| *b == marker));
                marker
            })
            .collect();
        markers.sort_unstable();
        assert_eq!(markers, vec![2, 4, 6, 8]);
        assert_eq!(lock(&shared).backend().draws().len(), 2 * threads as usize);
    }

    #[test]
    fn nested_chains_share_resources() {
        let shared = resources();
        let inner_chain = ShaderStage::new(&ChainRoot, &invocation("blur.spv", &[1], 2, &[])).unwrap();
        let inner: Arc<dyn FrameSource> = Arc::new(
            ExecuteShader::new(
                &inner_chain,
                BTreeMap::from([(ClipId(1), source(8))]),
                shared.clone(),
                Precision::Rgba8,
            )
            .unwrap(),
        );

        let outer_chain =
            ShaderStage::new(&ChainRoot, &invocation("mix.spv", &[5, 6], 7, &["gain=1f"])).unwrap();
        let outer = ExecuteShader::new(
            &outer_chain,
            BTreeMap::from([(ClipId(5), inner), (ClipId(6), source(8))]),
            shared.clone(),
            Precision::Rgba8,
        )
        .unwrap();

        let frame = outer.get_frame(0).unwrap();
        assert!(frame.data.iter().all(|b| *b == 2));
        let resources = lock(&shared);
        let draws = resources.backend().draws();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].shader.locator(), "blur.spv");
        assert_eq!(draws[1].shader.locator(), "mix.spv");
    }
}
