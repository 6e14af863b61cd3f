//! Error types for shader compilation, reflection and linking.

use thiserror::Error;
use vse_gpu::{LinkError, ShaderStage};

/// A source failed to compile. `diagnostics` holds one entry per compiler message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to compile {source_name} ({stage:?}): {}", .diagnostics.join("; "))]
pub struct CompileError {
    pub source_name: String,
    pub stage: ShaderStage,
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReflectError {
    #[error("SPIR-V parse failed: {0}")]
    Parse(String),

    #[error("binding {set}.{binding} has an unsupported resource type")]
    UnsupportedBinding { set: u32, binding: u32 },

    #[error("vertex input at location {0} has an unsupported format")]
    UnsupportedInput(u32),

    #[error("type layout failed: {0}")]
    Layout(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("{name}: {error}")]
    Reflect { name: String, error: ReflectError },

    #[error(transparent)]
    Link(#[from] LinkError),
}
