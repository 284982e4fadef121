//! Replays a command log against a [`ResourceManager`].
//!
//! Execution happens in two phases. [`plan`] checks that every input a
//! command reads is produced by an earlier command or supplied from outside
//! and resolves output sizes, without touching the GPU. [`execute`] then
//! issues the draws strictly in sequence order and reads back the final
//! command's output.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, trace};

use crate::command::{ClipId, CommandDescriptor, CommandLog, MAX_INPUTS};
use crate::error::{Result, ShaderError};
use crate::frame::{FrameBuffer, FrameInfo};
use crate::gpu::{GpuBackend, ResourceManager};

/// A command with its output size resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCommand {
    pub descriptor: CommandDescriptor,
    pub width: u32,
    pub height: u32,
}

/// A validated command log, ready to execute.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    commands: Vec<PlannedCommand>,
    external: BTreeSet<ClipId>,
}

impl Plan {
    pub fn commands(&self) -> &[PlannedCommand] {
        &self.commands
    }

    /// Clips read from outside the log, in id order.
    pub fn external_inputs(&self) -> impl Iterator<Item = ClipId> + '_ {
        self.external.iter().copied()
    }

    /// Size of the frame the final command produces.
    pub fn output_size(&self) -> (u32, u32) {
        self.commands
            .last()
            .map_or((0, 0), |command| (command.width, command.height))
    }

    pub fn output_clip(&self) -> Option<ClipId> {
        self.commands.last().map(|command| command.descriptor.output)
    }
}

/// Validates `log` against the clips supplied from outside.
///
/// A command may only read clips that an earlier command produced or that
/// `external` describes; a produced clip shadows an external one of the same
/// id. A zero output dimension is taken from the command's input 0.
pub fn plan(log: &CommandLog, external: &BTreeMap<ClipId, FrameInfo>) -> Result<Plan> {
    let descriptors = log.descriptors()?;
    if descriptors.is_empty() {
        return Err(ShaderError::Config("command log is empty".into()));
    }

    let mut produced: HashMap<ClipId, (u32, u32)> = HashMap::new();
    let mut referenced = BTreeSet::new();
    let mut commands = Vec::with_capacity(descriptors.len());
    for descriptor in descriptors {
        let mut sizes = [None; MAX_INPUTS];
        for (slot, clip) in descriptor.bound_inputs() {
            let size = match produced.get(&clip) {
                Some(size) => *size,
                None => {
                    let info = external.get(&clip).ok_or(ShaderError::DanglingInputReference {
                        sequence: descriptor.sequence_index,
                        clip: clip.0,
                    })?;
                    referenced.insert(clip);
                    (info.width, info.height)
                }
            };
            sizes[slot] = Some(size);
        }

        let inherit = |requested: u32, pick: fn((u32, u32)) -> u32| match requested {
            0 => sizes[0].map(pick).ok_or(ShaderError::UnresolvedOutputSize {
                sequence: descriptor.sequence_index,
            }),
            n => Ok(n),
        };
        let width = inherit(descriptor.output_width, |(w, _)| w)?;
        let height = inherit(descriptor.output_height, |(_, h)| h)?;
        if width == 0 || height == 0 {
            return Err(ShaderError::UnresolvedOutputSize {
                sequence: descriptor.sequence_index,
            });
        }

        produced.insert(descriptor.output, (width, height));
        commands.push(PlannedCommand {
            descriptor,
            width,
            height,
        });
    }

    Ok(Plan {
        commands,
        external: referenced,
    })
}

/// Runs `plan` and copies the final output into `output`, rows `pitch`
/// bytes apart.
///
/// Starts a new resource epoch. Any failure aborts the whole run and leaves
/// `output` untouched.
pub fn execute<B: GpuBackend>(
    resources: &mut ResourceManager<B>,
    plan: &Plan,
    inputs: &BTreeMap<ClipId, FrameBuffer>,
    output: &mut [u8],
    pitch: usize,
) -> Result<()> {
    resources.reset_epoch();
    let mut uploaded = HashSet::new();

    for command in &plan.commands {
        let descriptor = &command.descriptor;
        trace!(
            sequence = descriptor.sequence_index,
            shader = %descriptor.shader,
            output = %descriptor.output,
            "executing command"
        );

        let mut bound = [None; MAX_INPUTS];
        for (slot, clip) in descriptor.bound_inputs() {
            let texture = match resources.render_target_for(clip) {
                Some(target) => target,
                None => {
                    let frame = inputs.get(&clip).ok_or(ShaderError::DanglingInputReference {
                        sequence: descriptor.sequence_index,
                        clip: clip.0,
                    })?;
                    let texture = resources.acquire_input_texture(clip, frame.width, frame.height)?;
                    if uploaded.insert(clip) {
                        resources.upload_to_texture(
                            texture,
                            &frame.data,
                            frame.pitch,
                            frame.width,
                            frame.height,
                        )?;
                    }
                    texture
                }
            };
            bound[slot] = Some(texture);
        }

        let target = resources.acquire_render_target(command.width, command.height)?;
        let shader = resources.get_or_compile_shader(&descriptor.shader)?;
        for param in descriptor.bound_params() {
            resources.bind_constant(shader, &param.name, &param.value)?;
        }
        resources.draw(shader, bound, target)?;
        resources.tag_render_target(target, descriptor.output)?;
    }

    let (width, height) = plan.output_size();
    let last = plan
        .output_clip()
        .and_then(|clip| resources.render_target_for(clip))
        .ok_or_else(|| ShaderError::Config("plan produced no output".into()))?;
    resources.download_from_target(last, output, pitch, width, height)?;
    debug!(commands = plan.commands.len(), width, height, "chain materialized");
    Ok(())
}

/// Plans `log` against `inputs` and executes it in one step.
pub fn materialize<B: GpuBackend>(
    resources: &mut ResourceManager<B>,
    log: &CommandLog,
    inputs: &BTreeMap<ClipId, FrameBuffer>,
    output: &mut [u8],
    pitch: usize,
) -> Result<()> {
    let infos = inputs.iter().map(|(clip, frame)| (*clip, frame.info())).collect();
    let plan = plan(log, &infos)?;
    execute(resources, &plan, inputs, output, pitch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{build_command, Invocation, ShaderId};
    use crate::error::ErrorKind;
    use crate::frame::Precision;
    use crate::gpu::recording::RecordingBackend;
    use crate::gpu::{ConstantLayout, ConstantSlot, ConstantType, PoolConfig};

    fn stage(shader: &str, inputs: &[u32], output: u32, size: u32, params: &[&str]) -> Invocation {
        Invocation {
            shader: ShaderId::Source {
                locator: shader.into(),
                entry_point: "fs_main".into(),
                shader_model: "wgsl".into(),
            },
            params: params.iter().map(|p| p.to_string()).collect(),
            inputs: inputs.iter().map(|clip| Some(ClipId(*clip))).collect(),
            output: ClipId(output),
            width: size,
            height: size,
        }
    }

    fn chain(stages: &[Invocation]) -> CommandLog {
        stages.iter().fold(CommandLog::new(), |log, invocation| {
            build_command(invocation, &log).unwrap().1
        })
    }

    fn frame(size: u32) -> FrameBuffer {
        FrameBuffer::new(FrameInfo {
            width: size,
            height: size,
            precision: Precision::Rgba8,
        })
    }

    fn manager(capacity: usize) -> ResourceManager<RecordingBackend> {
        ResourceManager::new(RecordingBackend::default(), PoolConfig { capacity })
    }

    #[test]
    fn two_stage_chain_draws_in_order_and_reads_back_the_last_target() {
        let log = chain(&[
            stage("a.wgsl", &[1], 10, 64, &[]),
            stage("b.wgsl", &[10], 11, 64, &[]),
        ]);
        let inputs = BTreeMap::from([(ClipId(1), frame(64))]);
        let mut resources = manager(8);
        let mut output = vec![0u8; 64 * 64 * 4];
        materialize(&mut resources, &log, &inputs, &mut output, 64 * 4).unwrap();

        let draws = resources.backend().draws();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].shader.locator(), "a.wgsl");
        assert_eq!(draws[1].shader.locator(), "b.wgsl");
        assert_eq!(draws[1].inputs[0], Some(draws[0].target));
        // The recording backend fills each target with its draw number.
        assert!(output.iter().all(|b| *b == 2));
    }

    #[test]
    fn swapped_stages_fail_before_any_draw() {
        let log = chain(&[
            stage("b.wgsl", &[10], 11, 64, &[]),
            stage("a.wgsl", &[1], 10, 64, &[]),
        ]);
        let inputs = BTreeMap::from([(ClipId(1), frame(64))]);
        let mut resources = manager(8);
        let mut output = vec![0u8; 64 * 64 * 4];
        let err = materialize(&mut resources, &log, &inputs, &mut output, 64 * 4).unwrap_err();

        assert!(matches!(
            err,
            ShaderError::DanglingInputReference { sequence: 0, clip: 10 }
        ));
        assert_eq!(err.kind(), ErrorKind::DanglingInputReference);
        assert!(resources.backend().draws().is_empty());
    }

    #[test]
    fn later_dangling_references_also_fail_before_any_draw() {
        let log = chain(&[
            stage("a.wgsl", &[1], 10, 64, &[]),
            stage("b.wgsl", &[20], 11, 64, &[]),
        ]);
        let inputs = BTreeMap::from([(ClipId(1), frame(64))]);
        let mut resources = manager(8);
        let mut output = vec![0u8; 64 * 64 * 4];
        let err = materialize(&mut resources, &log, &inputs, &mut output, 64 * 4).unwrap_err();

        assert!(matches!(
            err,
            ShaderError::DanglingInputReference { sequence: 1, clip: 20 }
        ));
        assert!(resources.backend().draws().is_empty());
        assert_eq!(resources.backend().uploads(), 0);
    }

    #[test]
    fn zero_size_inherits_from_input_zero() {
        let log = chain(&[stage("a.wgsl", &[1], 10, 0, &[])]);
        let external = BTreeMap::from([(ClipId(1), frame(32).info())]);
        let plan = plan(&log, &external).unwrap();
        assert_eq!(plan.output_size(), (32, 32));
        assert_eq!(plan.external_inputs().collect::<Vec<_>>(), vec![ClipId(1)]);

        let log = chain(&[stage("gen.wgsl", &[], 10, 0, &[])]);
        assert!(matches!(
            super::plan(&log, &BTreeMap::new()),
            Err(ShaderError::UnresolvedOutputSize { sequence: 0 })
        ));
    }

    #[test]
    fn produced_clips_shadow_external_inputs() {
        let log = chain(&[
            stage("a.wgsl", &[1], 2, 16, &[]),
            stage("b.wgsl", &[2], 3, 16, &[]),
        ]);
        let inputs = BTreeMap::from([(ClipId(1), frame(16)), (ClipId(2), frame(8))]);
        let plan = plan(&log, &inputs.iter().map(|(c, f)| (*c, f.info())).collect()).unwrap();
        assert_eq!(plan.external_inputs().collect::<Vec<_>>(), vec![ClipId(1)]);

        let mut resources = manager(8);
        let mut output = vec![0u8; 16 * 16 * 4];
        execute(&mut resources, &plan, &inputs, &mut output, 16 * 4).unwrap();
        let draws = resources.backend().draws();
        assert_eq!(draws[1].inputs[0], Some(draws[0].target));
        assert_eq!(resources.backend().uploads(), 1);
    }

    #[test]
    fn shared_inputs_upload_once_per_run() {
        let log = chain(&[
            stage("a.wgsl", &[1], 10, 16, &[]),
            stage("mix.wgsl", &[10, 1], 11, 16, &[]),
        ]);
        let inputs = BTreeMap::from([(ClipId(1), frame(16))]);
        let mut resources = manager(8);
        let mut output = vec![0u8; 16 * 16 * 4];

        materialize(&mut resources, &log, &inputs, &mut output, 16 * 4).unwrap();
        assert_eq!(resources.backend().uploads(), 1);
        let draws = resources.backend().draws();
        assert_eq!(draws[0].inputs[0], draws[1].inputs[1]);

        // A second run reuses every texture but uploads fresh frame data.
        let created = resources.backend().textures_created();
        materialize(&mut resources, &log, &inputs, &mut output, 16 * 4).unwrap();
        assert_eq!(resources.backend().uploads(), 2);
        assert_eq!(resources.backend().textures_created(), created);
        assert_eq!(resources.backend().compiles(), 2);
    }

    #[test]
    fn parameters_reach_the_draw() {
        let log = chain(&[stage("a.wgsl", &[1], 10, 4, &["gain=0.5,1,2f", "unused=3i"])]);
        let inputs = BTreeMap::from([(ClipId(1), frame(4))]);
        let mut resources = manager(4);
        let mut output = vec![0u8; 4 * 4 * 4];
        materialize(&mut resources, &log, &inputs, &mut output, 4 * 4).unwrap();

        let constants = &resources.backend().draws()[0].constants;
        let gain: Vec<f32> = constants
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(gain, vec![0.5, 1.0, 2.0, 0.0]);
    }

    #[test]
    fn bool_parameters_fill_flag_arrays_one_word_per_flag() {
        let mut layout = ConstantLayout::new(48);
        layout.insert(
            "flags",
            ConstantSlot {
                offset: 16,
                ty: ConstantType::FlagArray(2),
            },
        );
        let backend = RecordingBackend::default().with_layout("flags.wgsl", layout);
        let mut resources = ResourceManager::new(backend, PoolConfig { capacity: 4 });
        let log = chain(&[stage("flags.wgsl", &[1], 10, 4, &["flags=1,0,1,1,0,1b"])]);
        let inputs = BTreeMap::from([(ClipId(1), frame(4))]);
        let mut output = vec![0u8; 4 * 4 * 4];
        materialize(&mut resources, &log, &inputs, &mut output, 4 * 4).unwrap();

        let constants = &resources.backend().draws()[0].constants;
        assert_eq!(constants.len(), 48);
        let words: Vec<u32> = constants
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(words[..4], [0, 0, 0, 0]);
        assert_eq!(words[4..], [1, 0, 1, 1, 0, 1, 0, 0]);
    }

    #[test]
    fn type_mismatch_aborts_without_output() {
        let log = chain(&[stage("a.wgsl", &[1], 10, 4, &["gain=1i"])]);
        let inputs = BTreeMap::from([(ClipId(1), frame(4))]);
        let mut resources = manager(4);
        let mut output = vec![7u8; 4 * 4 * 4];
        let err = materialize(&mut resources, &log, &inputs, &mut output, 4 * 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstantTypeMismatch);
        assert!(resources.backend().draws().is_empty());
        assert!(output.iter().all(|b| *b == 7));
    }

    #[test]
    fn padded_output_rows_keep_their_padding() {
        let log = chain(&[stage("a.wgsl", &[1], 10, 2, &[])]);
        let inputs = BTreeMap::from([(ClipId(1), frame(2))]);
        let mut resources = manager(4);
        let pitch = 2 * 4 + 4;
        let mut output = vec![0xAA; pitch * 2];
        materialize(&mut resources, &log, &inputs, &mut output, pitch).unwrap();
        assert_eq!(&output[..8], &[1; 8]);
        assert_eq!(&output[8..12], &[0xAA; 4]);
        assert_eq!(&output[12..20], &[1; 8]);
    }

    #[test]
    fn chains_needing_more_targets_than_capacity_exhaust_the_pool() {
        let log = chain(&[
            stage("a.wgsl", &[1], 10, 8, &[]),
            stage("b.wgsl", &[10], 11, 8, &[]),
        ]);
        let inputs = BTreeMap::from([(ClipId(1), frame(8))]);
        let mut resources = manager(1);
        let mut output = vec![0u8; 8 * 8 * 4];
        let err = materialize(&mut resources, &log, &inputs, &mut output, 8 * 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert_eq!(resources.backend().draws().len(), 1);
    }

    #[test]
    fn short_output_buffers_are_rejected() {
        let log = chain(&[stage("a.wgsl", &[1], 10, 8, &[])]);
        let inputs = BTreeMap::from([(ClipId(1), frame(8))]);
        let mut resources = manager(4);
        let mut output = vec![0u8; 10];
        assert!(matches!(
            materialize(&mut resources, &log, &inputs, &mut output, 8 * 4),
            Err(ShaderError::BufferTooSmall { .. })
        ));
    }
}
