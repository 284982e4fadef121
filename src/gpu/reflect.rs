//! Shader loading through naga: parsing, validation, binding checks and
//! reflection of the constant block.
//!
//! Every shader is handed to wgpu as WGSL. GLSL sources and SPIR-V blobs are
//! translated with naga's WGSL backend.

use std::fs;

use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};
use naga::{
    AddressSpace, ArraySize, Binding, Handle, ImageClass, ImageDimension, ResourceBinding, Scalar,
    ScalarKind, ShaderStage, Type, TypeInner, VectorSize,
};
use tracing::debug;

use super::constants::{ConstantLayout, ConstantSlot, ConstantType};
use crate::command::{ShaderId, MAX_INPUTS};
use crate::error::{Result, ShaderError};

/// Binding of the constant block in group 0.
pub const CONSTANTS_BINDING: u32 = 0;
/// Binding of the shared sampler in group 0.
pub const SAMPLER_BINDING: u32 = 1;
/// Binding of input 0; input `n` is at `FIRST_INPUT_BINDING + n`.
pub const FIRST_INPUT_BINDING: u32 = 2;

/// A shader ready for pipeline creation.
#[derive(Debug, Clone)]
pub struct LoadedShader {
    pub wgsl: String,
    pub entry_point: String,
    pub layout: ConstantLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Language {
    Wgsl,
    Glsl,
}

fn language_of(shader_model: &str) -> Option<Language> {
    let model = shader_model.to_ascii_lowercase();
    if model.starts_with("wgsl") {
        Some(Language::Wgsl)
    } else if model.starts_with("glsl") {
        Some(Language::Glsl)
    } else {
        None
    }
}

/// Reads, validates and reflects the shader `shader` refers to.
pub fn load_shader(shader: &ShaderId) -> Result<LoadedShader> {
    let fail = |reason: String| ShaderError::ShaderLoadFailed {
        shader: shader.to_string(),
        reason,
    };
    match shader {
        ShaderId::Source {
            locator,
            entry_point,
            shader_model,
        } => {
            let language = language_of(shader_model)
                .ok_or_else(|| fail(format!("unsupported shader model {shader_model:?}")))?;
            let source = fs::read_to_string(locator)
                .map_err(|e| fail(format!("cannot read {locator}: {e}")))?;
            compile_source(&source, language, entry_point).map_err(fail)
        }
        ShaderId::Precompiled { locator } => {
            let blob = fs::read(locator).map_err(|e| fail(format!("cannot read {locator}: {e}")))?;
            compile_spirv(&blob).map_err(fail)
        }
    }
}

fn compile_source(
    source: &str,
    language: Language,
    entry_point: &str,
) -> std::result::Result<LoadedShader, String> {
    match language {
        Language::Wgsl => {
            let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;
            validate(&module).map_err(|e| e.emit_to_string(source))?;
            let entry_point = fragment_entry(&module, Some(entry_point))?;
            check_bindings(&module)?;
            Ok(LoadedShader {
                wgsl: source.to_string(),
                entry_point,
                layout: reflect_constants(&module),
            })
        }
        Language::Glsl => {
            if entry_point != "main" {
                return Err(format!("GLSL entry point must be main, not {entry_point:?}"));
            }
            let mut frontend = naga::front::glsl::Frontend::default();
            let options = naga::front::glsl::Options::from(ShaderStage::Fragment);
            let module = frontend
                .parse(&options, source)
                .map_err(|e| format!("GLSL parse error: {e:?}"))?;
            let info = validate(&module).map_err(|e| e.emit_to_string(source))?;
            translate(&module, &info, Some(entry_point))
        }
    }
}

fn compile_spirv(blob: &[u8]) -> std::result::Result<LoadedShader, String> {
    let module = naga::front::spv::parse_u8_slice(blob, &naga::front::spv::Options::default())
        .map_err(|e| format!("SPIR-V parse error: {e:?}"))?;
    let info = validate(&module).map_err(|e| format!("validation error: {e:?}"))?;
    translate(&module, &info, None)
}

/// Emits WGSL for a module parsed from a foreign language.
fn translate(
    module: &naga::Module,
    info: &ModuleInfo,
    entry_point: Option<&str>,
) -> std::result::Result<LoadedShader, String> {
    let entry_point = fragment_entry(module, entry_point)?;
    check_bindings(module)?;
    let wgsl = naga::back::wgsl::write_string(module, info, naga::back::wgsl::WriterFlags::EXPLICIT_TYPES)
        .map_err(|e| format!("WGSL generation error: {e:?}"))?;
    Ok(LoadedShader {
        wgsl,
        entry_point,
        layout: reflect_constants(module),
    })
}

fn validate(
    module: &naga::Module,
) -> std::result::Result<ModuleInfo, naga::WithSpan<naga::valid::ValidationError>> {
    Validator::new(ValidationFlags::all(), Capabilities::all()).validate(module)
}

/// Name of the requested fragment entry point, or of the first one when no
/// name is given.
fn fragment_entry(module: &naga::Module, name: Option<&str>) -> std::result::Result<String, String> {
    let entry = module
        .entry_points
        .iter()
        .filter(|ep| ep.stage == ShaderStage::Fragment)
        .find(|ep| name.map_or(true, |name| ep.name == name))
        .ok_or_else(|| match name {
            Some(name) => format!("no fragment entry point named {name:?}"),
            None => "no fragment entry point".to_string(),
        })?;
    check_interface(module, &entry.function)
        .map_err(|reason| format!("fragment entry point {:?}: {reason}", entry.name))?;
    Ok(entry.name.clone())
}

/// The shared vertex stage only provides texture coordinates at location 0,
/// and the pipeline has a single float color target at location 0.
fn check_interface(module: &naga::Module, function: &naga::Function) -> std::result::Result<(), String> {
    for argument in &function.arguments {
        for (location, ty) in locations(module, argument.ty, argument.binding.as_ref()) {
            let fits = location == 0
                && matches!(
                    module.types[ty].inner,
                    TypeInner::Scalar(Scalar::F32)
                        | TypeInner::Vector {
                            size: VectorSize::Bi,
                            scalar: Scalar::F32,
                        }
                );
            if !fits {
                return Err(format!(
                    "input at location {location} is not provided, only vec2<f32> texture coordinates at location 0 are"
                ));
            }
        }
    }

    let outputs = function
        .result
        .as_ref()
        .map(|result| locations(module, result.ty, result.binding.as_ref()))
        .unwrap_or_default();
    let mut color = false;
    for (location, ty) in outputs {
        let fits = location == 0
            && matches!(
                module.types[ty].inner,
                TypeInner::Vector {
                    size: VectorSize::Quad,
                    scalar: Scalar::F32,
                }
            );
        if !fits {
            return Err(format!(
                "output at location {location} must be a vec4<f32> at location 0"
            ));
        }
        color = true;
    }
    if !color {
        return Err("no color output at location 0".to_string());
    }
    Ok(())
}

/// User-defined locations of a value, looking through struct members.
fn locations(
    module: &naga::Module,
    ty: Handle<Type>,
    binding: Option<&Binding>,
) -> Vec<(u32, Handle<Type>)> {
    match binding {
        Some(Binding::Location { location, .. }) => vec![(*location, ty)],
        Some(Binding::BuiltIn(_)) => Vec::new(),
        None => match &module.types[ty].inner {
            TypeInner::Struct { members, .. } => members
                .iter()
                .flat_map(|member| locations(module, member.ty, member.binding.as_ref()))
                .collect(),
            _ => Vec::new(),
        },
    }
}

/// Resources must sit where the pipeline layout expects them: constants at
/// binding 0, a non-comparison sampler at 1 and 2D float textures after.
fn check_bindings(module: &naga::Module) -> std::result::Result<(), String> {
    let last_input = FIRST_INPUT_BINDING + MAX_INPUTS as u32 - 1;
    for (_, var) in module.global_variables.iter() {
        let Some(ResourceBinding { group, binding }) = var.binding else {
            continue;
        };
        let name = var.name.as_deref().unwrap_or("<unnamed>");
        if group != 0 {
            return Err(format!("{name} is in bind group {group}, only group 0 is bound"));
        }
        let inner = &module.types[var.ty].inner;
        let fits = match binding {
            CONSTANTS_BINDING => var.space == AddressSpace::Uniform,
            SAMPLER_BINDING => matches!(inner, TypeInner::Sampler { comparison: false }),
            b if (FIRST_INPUT_BINDING..=last_input).contains(&b) => matches!(
                inner,
                TypeInner::Image {
                    dim: ImageDimension::D2,
                    arrayed: false,
                    class: ImageClass::Sampled {
                        kind: ScalarKind::Float,
                        multi: false
                    },
                }
            ),
            _ => false,
        };
        if !fits {
            return Err(format!("{name} at binding {binding} does not match the pipeline layout"));
        }
    }
    Ok(())
}

/// Member table of the uniform at group 0, binding 0. A shader without one
/// gets an empty layout.
fn reflect_constants(module: &naga::Module) -> ConstantLayout {
    let block = module.global_variables.iter().map(|(_, var)| var).find(|var| {
        var.space == AddressSpace::Uniform
            && var.binding
                == Some(ResourceBinding {
                    group: 0,
                    binding: CONSTANTS_BINDING,
                })
    });
    let Some(block) = block else {
        return ConstantLayout::default();
    };

    let inner = &module.types[block.ty].inner;
    let mut layout = ConstantLayout::new(inner.size(module.to_ctx()));
    match inner {
        TypeInner::Struct { members, .. } => {
            for member in members {
                let Some(name) = &member.name else { continue };
                match constant_type(module, member.ty) {
                    Some(ty) => layout.insert(
                        name.clone(),
                        ConstantSlot {
                            offset: member.offset,
                            ty,
                        },
                    ),
                    None => debug!(name, "constant has an unsupported type and cannot be set"),
                }
            }
        }
        _ => {
            if let (Some(name), Some(ty)) = (&block.name, constant_type(module, block.ty)) {
                layout.insert(name.clone(), ConstantSlot { offset: 0, ty });
            }
        }
    }
    layout
}

fn constant_type(module: &naga::Module, ty: Handle<Type>) -> Option<ConstantType> {
    match module.types[ty].inner {
        TypeInner::Scalar(scalar) => scalar_type(scalar, 1),
        TypeInner::Vector { size, scalar } => scalar_type(scalar, size as u8),
        TypeInner::Array {
            base,
            size: ArraySize::Constant(len),
            ..
        } => match module.types[base].inner {
            TypeInner::Vector {
                size: VectorSize::Quad,
                scalar: Scalar::U32,
            } => Some(ConstantType::FlagArray(len.get())),
            _ => None,
        },
        _ => None,
    }
}

fn scalar_type(scalar: Scalar, components: u8) -> Option<ConstantType> {
    if scalar.width != 4 {
        return None;
    }
    match scalar.kind {
        ScalarKind::Float => Some(ConstantType::Float(components)),
        ScalarKind::Sint => Some(ConstantType::Int(components)),
        ScalarKind::Uint => Some(ConstantType::Uint(components)),
        _ => None,
    }
}
