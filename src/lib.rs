//! Shaderchain: deferred GPU shader chains for frame pipelines.
//!
//! Stages record shader invocations into a [`CommandLog`] while the chain is
//! assembled; no GPU work happens until a terminal [`ExecuteShader`] node is
//! asked for a frame and replays the log through a [`ResourceManager`].

pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod frame;
pub mod gpu;
pub mod input;
pub mod param;
pub mod pipeline;

pub use command::{build_command, ClipId, CommandDescriptor, CommandLog, Invocation, ShaderId};
pub use error::{ErrorKind, Result, ShaderError};
pub use frame::{FrameBuffer, FrameInfo, Precision};
pub use gpu::{GpuBackend, GpuContext, ResourceManager, WgpuBackend};
pub use param::{ParamValue, ShaderParam};
pub use pipeline::{ChainRoot, CommandSource, ExecuteShader, FrameSource, MemorySource, ShaderStage};
