//! GLSL to SPIR-V compilation.

use crate::error::CompileError;
use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;
use vse_gpu::{IntermediateBinary, ShaderStage};

/// Preprocessor definitions. Ordered so equal sets hash identically.
pub type Defines = BTreeMap<String, String>;

/// Build a define set from `(name, value)` pairs.
pub fn defines<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Defines {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Named GLSL source text with a content hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderSource {
    pub name: String,
    pub code: Arc<str>,
    pub hash: u64,
}

impl ShaderSource {
    pub fn new(name: impl Into<String>, code: impl Into<Arc<str>>) -> Self {
        let code = code.into();
        let mut hasher = foldhash::fast::FixedState::default().build_hasher();
        code.hash(&mut hasher);
        Self {
            name: name.into(),
            hash: hasher.finish(),
            code,
        }
    }
}

/// Turns source text into a portable intermediate binary.
pub trait ShaderCompiler: Send + Sync {
    fn compile(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        defines: &Defines,
    ) -> Result<IntermediateBinary, CompileError>;

    /// Short identifier mixed into cache keys so binaries from different
    /// frontends never collide.
    fn name(&self) -> &'static str;
}

/// Pure-Rust frontend: GLSL is parsed and validated by naga, then written as SPIR-V 1.3.
#[derive(Debug, Default, Clone, Copy)]
pub struct NagaCompiler;

const fn naga_stage(stage: ShaderStage) -> naga::ShaderStage {
    match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

impl ShaderCompiler for NagaCompiler {
    fn compile(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        defines: &Defines,
    ) -> Result<IntermediateBinary, CompileError> {
        let fail = |diagnostics: Vec<String>| CompileError {
            source_name: source.name.clone(),
            stage,
            diagnostics,
        };

        let mut options = naga::front::glsl::Options::from(naga_stage(stage));
        options.defines = defines
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<naga::FastHashMap<_, _>>();

        let module = naga::front::glsl::Frontend::default()
            .parse(&options, &source.code)
            .map_err(|e| fail(e.to_string().lines().map(str::to_string).collect()))?;

        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| fail(vec![error_chain(&e)]))?;

        let spv_options = naga::back::spv::Options {
            lang_version: (1, 3),
            // GLSL sources already use Vulkan clip-space conventions
            flags: naga::back::spv::WriterFlags::empty(),
            ..Default::default()
        };
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage: naga_stage(stage),
            entry_point: "main".to_string(),
        };
        let words = naga::back::spv::write_vec(&module, &info, &spv_options, Some(&pipeline_options))
            .map_err(|e| fail(vec![error_chain(&e)]))?;

        tracing::trace!("Compiled {} ({stage:?}) to {} words", source.name, words.len());
        Ok(IntermediateBinary::new(stage, "main", words))
    }

    fn name(&self) -> &'static str {
        "naga"
    }
}

/// glslang frontend through shaderc, matching the driver toolchain's output.
#[cfg(feature = "shaderc")]
pub struct ShadercCompiler {
    compiler: parking_lot::Mutex<shaderc::Compiler>,
}

#[cfg(feature = "shaderc")]
impl ShadercCompiler {
    /// Returns `None` when the shaderc library cannot be initialized.
    pub fn new() -> Option<Self> {
        shaderc::Compiler::new().map(|compiler| Self {
            compiler: parking_lot::Mutex::new(compiler),
        })
    }
}

#[cfg(feature = "shaderc")]
impl ShaderCompiler for ShadercCompiler {
    fn compile(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        defines: &Defines,
    ) -> Result<IntermediateBinary, CompileError> {
        let fail = |diagnostics: Vec<String>| CompileError {
            source_name: source.name.clone(),
            stage,
            diagnostics,
        };

        let mut options = shaderc::CompileOptions::new()
            .ok_or_else(|| fail(vec!["failed to create shaderc options".to_string()]))?;
        options.set_target_env(
            shaderc::TargetEnv::Vulkan,
            shaderc::EnvVersion::Vulkan1_3 as u32,
        );
        options.set_optimization_level(shaderc::OptimizationLevel::Performance);
        for (name, value) in defines {
            options.add_macro_definition(name, (!value.is_empty()).then_some(value.as_str()));
        }

        let kind = match stage {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
            ShaderStage::Compute => shaderc::ShaderKind::Compute,
        };

        let artifact = self
            .compiler
            .lock()
            .compile_into_spirv(&source.code, kind, &source.name, "main", Some(&options))
            .map_err(|e| fail(e.to_string().lines().map(str::to_string).collect()))?;
        if artifact.get_num_warnings() > 0 {
            tracing::warn!("{}: {}", source.name, artifact.get_warning_messages());
        }

        Ok(IntermediateBinary::new(stage, "main", artifact.as_binary().to_vec()))
    }

    fn name(&self) -> &'static str {
        "shaderc"
    }
}
