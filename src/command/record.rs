//! Fixed-size binary form of a [`CommandDescriptor`].
//!
//! Records have no trailing variable-length data, so a command log is a plain
//! contiguous array of them and can be copied as bytes across any boundary.

use bytemuck::{Pod, Zeroable};

use super::{ClipId, CommandDescriptor, ShaderId, MAX_INPUTS, MAX_PARAMS};
use crate::error::{Result, ShaderError};
use crate::param::{ParamValue, ShaderParam};

pub const PARAM_NAME_LEN: usize = 32;
pub const SHADER_LOCATOR_LEN: usize = 256;
pub const ENTRY_POINT_LEN: usize = 64;
pub const SHADER_MODEL_LEN: usize = 16;
/// Boolean flags are stored as a bitmask in the four data words.
pub const MAX_BOOL_COMPONENTS: usize = 128;
/// Marks an input binding that is not used.
pub const UNBOUND_CLIP: u32 = u32::MAX;

const PARAM_NONE: u32 = 0;
const PARAM_FLOAT: u32 = 1;
const PARAM_INT: u32 = 2;
const PARAM_BOOL: u32 = 3;

const SHADER_SOURCE: u32 = 1;
const SHADER_PRECOMPILED: u32 = 2;

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct ParamRecord {
    pub name: [u8; PARAM_NAME_LEN],
    pub kind: u32,
    pub count: u32,
    pub data: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CommandRecord {
    pub sequence_index: u32,
    pub shader_kind: u32,
    pub output_clip: u32,
    pub output_width: u32,
    pub output_height: u32,
    pub input_clips: [u32; MAX_INPUTS],
    pub params: [ParamRecord; MAX_PARAMS],
    pub shader_locator: [u8; SHADER_LOCATOR_LEN],
    pub entry_point: [u8; ENTRY_POINT_LEN],
    pub shader_model: [u8; SHADER_MODEL_LEN],
}

pub const RECORD_SIZE: usize = std::mem::size_of::<CommandRecord>();

impl CommandRecord {
    pub fn encode(command: &CommandDescriptor) -> Result<Self> {
        let mut record = CommandRecord::zeroed();
        record.sequence_index = command.sequence_index;
        record.output_clip = command.output.0;
        record.output_width = command.output_width;
        record.output_height = command.output_height;

        for (slot, input) in record.input_clips.iter_mut().zip(&command.inputs) {
            *slot = input.map_or(UNBOUND_CLIP, |clip| clip.0);
        }
        for (slot, param) in record.params.iter_mut().zip(&command.params) {
            if let Some(param) = param {
                *slot = encode_param(param)?;
            }
        }

        match &command.shader {
            ShaderId::Source {
                locator,
                entry_point,
                shader_model,
            } => {
                record.shader_kind = SHADER_SOURCE;
                write_str(&mut record.shader_locator, locator, "shader locator")?;
                write_str(&mut record.entry_point, entry_point, "entry point")?;
                write_str(&mut record.shader_model, shader_model, "shading model")?;
            }
            ShaderId::Precompiled { locator } => {
                record.shader_kind = SHADER_PRECOMPILED;
                write_str(&mut record.shader_locator, locator, "shader locator")?;
            }
        }
        Ok(record)
    }

    pub fn decode(&self) -> Result<CommandDescriptor> {
        let locator = read_str(&self.shader_locator)?;
        let shader = match self.shader_kind {
            SHADER_SOURCE => ShaderId::Source {
                locator,
                entry_point: read_str(&self.entry_point)?,
                shader_model: read_str(&self.shader_model)?,
            },
            SHADER_PRECOMPILED => ShaderId::Precompiled { locator },
            other => return Err(corrupt(format!("unknown shader kind {other}"))),
        };

        let mut params: [Option<ShaderParam>; MAX_PARAMS] = Default::default();
        for (slot, param) in params.iter_mut().zip(&self.params) {
            *slot = decode_param(param)?;
        }

        let inputs = self
            .input_clips
            .map(|clip| (clip != UNBOUND_CLIP).then_some(ClipId(clip)));

        if self.output_clip == UNBOUND_CLIP {
            return Err(corrupt("command has no output clip".into()));
        }

        Ok(CommandDescriptor {
            shader,
            params,
            inputs,
            output: ClipId(self.output_clip),
            output_width: self.output_width,
            output_height: self.output_height,
            sequence_index: self.sequence_index,
        })
    }
}

fn encode_param(param: &ShaderParam) -> Result<ParamRecord> {
    let mut record = ParamRecord::zeroed();
    write_str(&mut record.name, &param.name, "parameter name")?;
    match &param.value {
        ParamValue::Float { values, len } => {
            record.kind = PARAM_FLOAT;
            record.count = *len as u32;
            record.data = values.map(f32::to_bits);
        }
        ParamValue::Int { values, len } => {
            record.kind = PARAM_INT;
            record.count = *len as u32;
            record.data = values.map(|v| v as u32);
        }
        ParamValue::Bool(flags) => {
            if flags.len() > MAX_BOOL_COMPONENTS {
                return Err(ShaderError::TooManyBindings {
                    what: "boolean flags",
                    count: flags.len(),
                    max: MAX_BOOL_COMPONENTS,
                });
            }
            record.kind = PARAM_BOOL;
            record.count = flags.len() as u32;
            for (i, _) in flags.iter().enumerate().filter(|(_, set)| **set) {
                record.data[i / 32] |= 1 << (i % 32);
            }
        }
    }
    Ok(record)
}

fn decode_param(record: &ParamRecord) -> Result<Option<ShaderParam>> {
    let count = record.count as usize;
    let value = match record.kind {
        PARAM_NONE => return Ok(None),
        PARAM_FLOAT if count <= 4 => ParamValue::Float {
            values: record.data.map(f32::from_bits),
            len: count,
        },
        PARAM_INT if count <= 4 => ParamValue::Int {
            values: record.data.map(|v| v as i32),
            len: count,
        },
        PARAM_BOOL if count <= MAX_BOOL_COMPONENTS => ParamValue::Bool(
            (0..count)
                .map(|i| record.data[i / 32] & (1 << (i % 32)) != 0)
                .collect(),
        ),
        kind => {
            return Err(corrupt(format!(
                "parameter kind {kind} with {count} components"
            )))
        }
    };
    Ok(Some(ShaderParam {
        name: read_str(&record.name)?,
        value,
    }))
}

fn write_str(dst: &mut [u8], value: &str, field: &'static str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(ShaderError::InvalidIdentifier { field });
    }
    if value.len() > dst.len() {
        return Err(ShaderError::IdentifierTooLong {
            field,
            len: value.len(),
            max: dst.len(),
        });
    }
    dst[..value.len()].copy_from_slice(value.as_bytes());
    Ok(())
}

fn read_str(src: &[u8]) -> Result<String> {
    let end = src.iter().position(|b| *b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end])
        .map(str::to_owned)
        .map_err(|err| corrupt(format!("identifier is not UTF-8: {err}")))
}

fn corrupt(reason: String) -> ShaderError {
    ShaderError::CorruptRecord { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::parse;

    fn descriptor() -> CommandDescriptor {
        let mut params: [Option<ShaderParam>; MAX_PARAMS] = Default::default();
        params[0] = Some(parse("gain=1.5,2.5f").unwrap());
        params[4] = Some(parse("flags=1,0,0,1,1,0b").unwrap());
        params[8] = Some(parse("taps=-3,4i").unwrap());
        let mut inputs = [None; MAX_INPUTS];
        inputs[0] = Some(ClipId(1));
        inputs[3] = Some(ClipId(10));
        CommandDescriptor {
            shader: ShaderId::Source {
                locator: "shaders/blur.wgsl".into(),
                entry_point: "fs_main".into(),
                shader_model: "wgsl".into(),
            },
            params,
            inputs,
            output: ClipId(11),
            output_width: 64,
            output_height: 32,
            sequence_index: 3,
        }
    }

    #[test]
    fn record_size_is_fixed() {
        assert_eq!(RECORD_SIZE, 896);
        assert_eq!(std::mem::size_of::<ParamRecord>(), 56);
    }

    #[test]
    fn record_preserves_every_field() {
        let command = descriptor();
        let record = CommandRecord::encode(&command).unwrap();
        assert_eq!(record.input_clips[1], UNBOUND_CLIP);
        assert_eq!(record.params[1].kind, PARAM_NONE);
        assert_eq!(record.decode().unwrap(), command);
    }

    #[test]
    fn precompiled_shaders_are_distinguishable() {
        let mut command = descriptor();
        command.shader = ShaderId::Precompiled {
            locator: "shaders/blur.wgsl".into(),
        };
        let record = CommandRecord::encode(&command).unwrap();
        assert_eq!(record.shader_kind, SHADER_PRECOMPILED);
        assert_eq!(record.decode().unwrap().shader, command.shader);
    }

    #[test]
    fn long_identifiers_are_rejected() {
        let mut command = descriptor();
        command.shader = ShaderId::Precompiled {
            locator: "x".repeat(SHADER_LOCATOR_LEN + 1),
        };
        assert!(matches!(
            CommandRecord::encode(&command),
            Err(ShaderError::IdentifierTooLong { field: "shader locator", .. })
        ));
    }

    #[test]
    fn unknown_tags_are_corrupt() {
        let mut record = CommandRecord::encode(&descriptor()).unwrap();
        record.params[2].kind = 9;
        assert!(matches!(
            record.decode(),
            Err(ShaderError::CorruptRecord { .. })
        ));
    }
}
