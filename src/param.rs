//! Typed shader parameters.
//!
//! A parameter is configured as `Name=v1[,v2[,v3[,v4]]]T` where the trailing
//! `T` selects the type: `f` for floats, `i` for integers and `b` for
//! booleans. Float and integer values form a vector of up to four components
//! (unused components are zero). Booleans are a flat list of flags of any
//! length, `0` meaning false and anything else true.

use crate::error::ParamError;

/// Maximum number of components of a float or integer parameter.
pub const MAX_VECTOR_COMPONENTS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Float,
    Int,
    Bool,
}

impl ParamKind {
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Float => "float",
            ParamKind::Int => "int",
            ParamKind::Bool => "bool",
        }
    }
}

/// Decoded parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    /// `len` components were given, the rest of `values` is zero.
    Float { values: [f32; 4], len: usize },
    Int { values: [i32; 4], len: usize },
    Bool(Vec<bool>),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Float { .. } => ParamKind::Float,
            ParamValue::Int { .. } => ParamKind::Int,
            ParamValue::Bool(_) => ParamKind::Bool,
        }
    }

    /// Number of components that were actually configured.
    pub fn len(&self) -> usize {
        match self {
            ParamValue::Float { len, .. } | ParamValue::Int { len, .. } => *len,
            ParamValue::Bool(flags) => flags.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named constant as configured for one shader invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderParam {
    pub name: String,
    pub value: ParamValue,
}

/// Parses a single parameter string. Pure, touches no GPU state.
pub fn parse(raw: &str) -> Result<ShaderParam, ParamError> {
    let malformed = |reason: String| ParamError::Malformed {
        raw: raw.to_string(),
        reason,
    };

    if raw.chars().count() < 2 {
        return Err(malformed("parameter is too short".into()));
    }
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| malformed("expected `name=value`".into()))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(malformed("parameter name is empty".into()));
    }

    // The type tag is the last character of the whole string, which is also
    // the last character of `value` whenever `value` is non-empty.
    let tag = raw.chars().last().unwrap_or_default();
    let body = match value.char_indices().last() {
        Some((idx, _)) => &value[..idx],
        None => return Err(malformed("parameter value is empty".into())),
    };
    let tokens: Vec<&str> = body.split(',').map(str::trim).collect();

    let value = match tag {
        'f' => {
            let parsed = parse_vector::<f32>(&tokens, "float", malformed)?;
            ParamValue::Float {
                values: parsed.0,
                len: parsed.1,
            }
        }
        'i' => {
            let parsed = parse_vector::<i32>(&tokens, "integer", malformed)?;
            ParamValue::Int {
                values: parsed.0,
                len: parsed.1,
            }
        }
        'b' => {
            let mut flags = Vec::with_capacity(tokens.len());
            for token in &tokens {
                if token.is_empty() {
                    return Err(malformed("empty boolean component".into()));
                }
                flags.push(*token != "0");
            }
            ParamValue::Bool(flags)
        }
        other => {
            return Err(malformed(format!(
                "unknown type suffix `{other}`, expected f, i or b"
            )))
        }
    };

    Ok(ShaderParam {
        name: name.to_string(),
        value,
    })
}

fn parse_vector<T>(
    tokens: &[&str],
    what: &str,
    malformed: impl Fn(String) -> ParamError,
) -> Result<([T; 4], usize), ParamError>
where
    T: std::str::FromStr + Copy + Default,
{
    if tokens.len() > MAX_VECTOR_COMPONENTS {
        return Err(ParamError::TooManyComponents {
            count: tokens.len(),
            max: MAX_VECTOR_COMPONENTS,
        });
    }
    let mut values = [T::default(); 4];
    for (slot, token) in values.iter_mut().zip(tokens) {
        *slot = token
            .parse()
            .map_err(|_| malformed(format!("`{token}` is not a valid {what}")))?;
    }
    Ok((values, tokens.len()))
}
