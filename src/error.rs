//! Error types shared by the codec, the command log and the GPU side.

use thiserror::Error;

/// Failure while decoding a single `name=values<type>` parameter string.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParamError {
    #[error("malformed parameter `{raw}`: {reason}")]
    Malformed { raw: String, reason: String },
    #[error("parameter has {count} components, at most {max} are allowed")]
    TooManyComponents { count: usize, max: usize },
}

/// Coarse classification of every failure the crate can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedParameter,
    TooManyComponents,
    ConstantTypeMismatch,
    PoolExhausted,
    DanglingInputReference,
    ShaderLoadFailed,
    DeviceLost,
    /// Invalid chain description that is not a parameter string.
    Configuration,
    /// GPU failure other than device loss.
    Gpu,
    Io,
}

/// Which pool ran out of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    InputTexture,
    RenderTarget,
}

impl std::fmt::Display for PoolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolKind::InputTexture => f.write_str("input texture"),
            PoolKind::RenderTarget => f.write_str("render target"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShaderError {
    /// A configured parameter string failed to decode. `slot` is 1-based.
    #[error("shader failed to set parameter {slot}: {raw}")]
    Parameter {
        slot: usize,
        raw: String,
        #[source]
        source: ParamError,
    },
    #[error("constant `{name}` is declared as {expected} but was given a {found} value")]
    ConstantTypeMismatch {
        name: String,
        expected: String,
        found: &'static str,
    },
    #[error("{kind} pool exhausted (capacity {capacity})")]
    PoolExhausted { kind: PoolKind, capacity: usize },
    #[error("command {sequence} reads clip {clip}, which no earlier command produced and no input supplies")]
    DanglingInputReference { sequence: u32, clip: u32 },
    #[error("failed to load shader {shader}: {reason}")]
    ShaderLoadFailed { shader: String, reason: String },
    #[error("GPU device lost")]
    DeviceLost,
    #[error("{field} is {len} bytes long, at most {max} fit in a command record")]
    IdentifierTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },
    #[error("{field} contains an interior NUL byte")]
    InvalidIdentifier { field: &'static str },
    #[error("{count} {what} given, at most {max} are supported")]
    TooManyBindings {
        what: &'static str,
        count: usize,
        max: usize,
    },
    #[error("clip id {0} is reserved")]
    ReservedClipId(u32),
    #[error("corrupt command record: {reason}")]
    CorruptRecord { reason: String },
    #[error("command {sequence} has no output size and no primary input to inherit it from")]
    UnresolvedOutputSize { sequence: u32 },
    #[error("buffer holds {actual} bytes, {needed} are required")]
    BufferTooSmall { needed: usize, actual: usize },
    #[error("frame does not match clip description: {0}")]
    FrameMismatch(String),
    #[error("invalid chain configuration: {0}")]
    Config(String),
    #[error("GPU error: {0}")]
    Device(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShaderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShaderError::Parameter { source, .. } => match source {
                ParamError::Malformed { .. } => ErrorKind::MalformedParameter,
                ParamError::TooManyComponents { .. } => ErrorKind::TooManyComponents,
            },
            ShaderError::ConstantTypeMismatch { .. } => ErrorKind::ConstantTypeMismatch,
            ShaderError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            ShaderError::DanglingInputReference { .. } => ErrorKind::DanglingInputReference,
            ShaderError::ShaderLoadFailed { .. } => ErrorKind::ShaderLoadFailed,
            ShaderError::DeviceLost => ErrorKind::DeviceLost,
            ShaderError::IdentifierTooLong { .. }
            | ShaderError::InvalidIdentifier { .. }
            | ShaderError::TooManyBindings { .. }
            | ShaderError::ReservedClipId(_)
            | ShaderError::CorruptRecord { .. }
            | ShaderError::UnresolvedOutputSize { .. }
            | ShaderError::BufferTooSmall { .. }
            | ShaderError::FrameMismatch(_)
            | ShaderError::Config(_) => ErrorKind::Configuration,
            ShaderError::Device(_) => ErrorKind::Gpu,
            ShaderError::Io(_) => ErrorKind::Io,
        }
    }

    /// Only device loss may succeed when the same pull is attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShaderError::DeviceLost)
    }
}

pub type Result<T, E = ShaderError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_errors_keep_their_codec_kind() {
        let err = ShaderError::Parameter {
            slot: 3,
            raw: "gain=xf".into(),
            source: ParamError::Malformed {
                raw: "x".into(),
                reason: "not a number".into(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::MalformedParameter);
        assert_eq!(err.to_string(), "shader failed to set parameter 3: gain=xf");
        assert!(!err.is_retryable());
    }

    #[test]
    fn only_device_loss_is_retryable() {
        assert!(ShaderError::DeviceLost.is_retryable());
        let exhausted = ShaderError::PoolExhausted {
            kind: PoolKind::RenderTarget,
            capacity: 2,
        };
        assert!(!exhausted.is_retryable());
        assert_eq!(exhausted.kind(), ErrorKind::PoolExhausted);
    }
}
