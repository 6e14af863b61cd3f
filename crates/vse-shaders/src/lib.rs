//! Shader compilation for the VSE engine.
//!
//! GLSL sources are compiled to SPIR-V (naga by default, glslang with the
//! `shaderc` feature), reflected back into binding layouts and linked into
//! [`vse_gpu::ShaderProgram`]s. The [`ShaderLibrary`] caches all of it.

pub mod builtin;
pub mod compiler;
pub mod error;
pub mod library;
pub mod reflect;

#[cfg(feature = "shaderc")]
pub use compiler::ShadercCompiler;
pub use compiler::{defines, Defines, NagaCompiler, ShaderCompiler, ShaderSource};
pub use error::{CompileError, ReflectError, ShaderError};
pub use library::{ProgramRequest, ShaderLibrary};
pub use reflect::reflect;
