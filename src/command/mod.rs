//! Shader invocation descriptors and the log that chains them.
//!
//! Building a command is pure metadata work: parameters are decoded and the
//! descriptor is appended to a copy of the upstream log. Nothing touches the
//! GPU until an [`executor`](crate::executor) replays the log.

mod log;
pub mod record;

pub use log::CommandLog;
pub use record::{CommandRecord, RECORD_SIZE};

use crate::error::{ParamError, Result, ShaderError};
use crate::param::{self, ParamValue, ShaderParam};

/// Number of parameter slots per command.
pub const MAX_PARAMS: usize = 9;
/// Number of input bindings per command.
pub const MAX_INPUTS: usize = 9;

/// Logical identifier of a frame producer or of a command's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClipId(pub u32);

impl std::fmt::Display for ClipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a shader program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShaderId {
    /// Source code to compile: file locator, entry point and shading model
    /// (`wgsl` or `glsl`).
    Source {
        locator: String,
        entry_point: String,
        shader_model: String,
    },
    /// An already compiled SPIR-V blob.
    Precompiled { locator: String },
}

impl ShaderId {
    pub fn locator(&self) -> &str {
        match self {
            ShaderId::Source { locator, .. } | ShaderId::Precompiled { locator } => locator,
        }
    }
}

impl std::fmt::Display for ShaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderId::Source {
                locator,
                entry_point,
                shader_model,
            } => write!(f, "{locator}:{entry_point} ({shader_model})"),
            ShaderId::Precompiled { locator } => write!(f, "{locator} (precompiled)"),
        }
    }
}

/// One shader invocation, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDescriptor {
    pub shader: ShaderId,
    pub params: [Option<ShaderParam>; MAX_PARAMS],
    pub inputs: [Option<ClipId>; MAX_INPUTS],
    pub output: ClipId,
    /// Zero inherits the size of input 0.
    pub output_width: u32,
    pub output_height: u32,
    pub sequence_index: u32,
}

impl CommandDescriptor {
    pub fn bound_inputs(&self) -> impl Iterator<Item = (usize, ClipId)> + '_ {
        self.inputs
            .iter()
            .enumerate()
            .filter_map(|(slot, clip)| clip.map(|clip| (slot, clip)))
    }

    pub fn bound_params(&self) -> impl Iterator<Item = &ShaderParam> {
        self.params.iter().flatten()
    }
}

/// Configuration of a shader invocation before it is placed in a log.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub shader: ShaderId,
    /// Raw parameter strings; empty strings leave their slot unused.
    pub params: Vec<String>,
    pub inputs: Vec<Option<ClipId>>,
    pub output: ClipId,
    pub width: u32,
    pub height: u32,
}

/// Decodes `invocation` into a descriptor positioned after `prior` and
/// returns it together with the extended log. `prior` itself is unchanged.
pub fn build_command(
    invocation: &Invocation,
    prior: &CommandLog,
) -> Result<(CommandDescriptor, CommandLog)> {
    if invocation.params.len() > MAX_PARAMS {
        return Err(ShaderError::TooManyBindings {
            what: "parameters",
            count: invocation.params.len(),
            max: MAX_PARAMS,
        });
    }
    if invocation.inputs.len() > MAX_INPUTS {
        return Err(ShaderError::TooManyBindings {
            what: "inputs",
            count: invocation.inputs.len(),
            max: MAX_INPUTS,
        });
    }

    let mut params: [Option<ShaderParam>; MAX_PARAMS] = Default::default();
    for (slot, raw) in invocation.params.iter().enumerate() {
        if raw.is_empty() {
            continue;
        }
        let parsed = param::parse(raw)
            .and_then(|parsed| fits_record(raw, parsed))
            .map_err(|source| ShaderError::Parameter {
                slot: slot + 1,
                raw: raw.clone(),
                source,
            })?;
        params[slot] = Some(parsed);
    }

    let mut inputs = [None; MAX_INPUTS];
    for (slot, clip) in inputs.iter_mut().zip(&invocation.inputs) {
        if let Some(clip) = clip {
            reject_reserved(*clip)?;
        }
        *slot = *clip;
    }
    reject_reserved(invocation.output)?;

    let descriptor = CommandDescriptor {
        shader: invocation.shader.clone(),
        params,
        inputs,
        output: invocation.output,
        output_width: invocation.width,
        output_height: invocation.height,
        sequence_index: prior.len() as u32,
    };
    let log = prior.appended(CommandRecord::encode(&descriptor)?);
    Ok((descriptor, log))
}

/// A decoded parameter must also fit its fixed-size record slot.
fn fits_record(raw: &str, parsed: ShaderParam) -> std::result::Result<ShaderParam, ParamError> {
    if parsed.name.len() > record::PARAM_NAME_LEN || parsed.name.contains('\0') {
        return Err(ParamError::Malformed {
            raw: raw.to_string(),
            reason: format!(
                "name must be at most {} bytes without NUL characters",
                record::PARAM_NAME_LEN
            ),
        });
    }
    if let ParamValue::Bool(flags) = &parsed.value {
        if flags.len() > record::MAX_BOOL_COMPONENTS {
            return Err(ParamError::TooManyComponents {
                count: flags.len(),
                max: record::MAX_BOOL_COMPONENTS,
            });
        }
    }
    Ok(parsed)
}

fn reject_reserved(clip: ClipId) -> Result<()> {
    if clip.0 == record::UNBOUND_CLIP {
        return Err(ShaderError::ReservedClipId(clip.0));
    }
    Ok(())
}
