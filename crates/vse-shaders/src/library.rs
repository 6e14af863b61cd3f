//! Compiled binary cache, program linking and warm-up.

use crate::builtin;
use crate::compiler::{Defines, NagaCompiler, ShaderCompiler, ShaderSource};
use crate::error::ShaderError;
use crate::reflect::reflect;
use hashbrown::HashMap;
use parking_lot::Mutex;
use rayon::prelude::*;
use std::hash::{BuildHasher, Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vse_gpu::{BindingLayout, IntermediateBinary, ShaderProgram, ShaderStage};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Stages to compile and link into one program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramRequest {
    pub stages: Vec<(ShaderSource, ShaderStage)>,
    pub defines: Defines,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StageKey {
    source: u64,
    stage: ShaderStage,
    defines: Defines,
}

impl StageKey {
    fn file_name(&self, compiler: &str) -> String {
        let mut hasher = foldhash::fast::FixedState::default().build_hasher();
        self.hash(&mut hasher);
        format!("{compiler}-{:016x}.spv", hasher.finish())
    }
}

type Reflected = (IntermediateBinary, BindingLayout);

/// Caches compiled stages by `(source hash, stage, defines)` and linked programs by stage set.
pub struct ShaderLibrary {
    compiler: Box<dyn ShaderCompiler>,
    stages: Mutex<HashMap<StageKey, Reflected>>,
    programs: Mutex<HashMap<Vec<StageKey>, Arc<ShaderProgram>>>,
    disk_cache: Option<PathBuf>,
    compiles: AtomicUsize,
}

impl Default for ShaderLibrary {
    /// Uses shaderc when the feature is enabled and the library loads, else naga.
    fn default() -> Self {
        #[cfg(feature = "shaderc")]
        if let Some(compiler) = crate::compiler::ShadercCompiler::new() {
            return Self::new(compiler);
        }
        Self::new(NagaCompiler)
    }
}

impl ShaderLibrary {
    pub fn new(compiler: impl ShaderCompiler + 'static) -> Self {
        Self {
            compiler: Box::new(compiler),
            stages: Mutex::new(HashMap::new()),
            programs: Mutex::new(HashMap::new()),
            disk_cache: None,
            compiles: AtomicUsize::new(0),
        }
    }

    /// Persist compiled SPIR-V under `dir` and reuse it across runs.
    #[must_use]
    pub fn with_disk_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_cache = Some(dir.into());
        self
    }

    /// Number of stages actually handed to the compiler.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn program_count(&self) -> usize {
        self.programs.lock().len()
    }

    /// Compile and reflect one stage, or return the cached result.
    pub fn stage(
        &self,
        source: &ShaderSource,
        stage: ShaderStage,
        defines: &Defines,
    ) -> Result<Reflected, ShaderError> {
        let key = StageKey {
            source: source.hash,
            stage,
            defines: defines.clone(),
        };
        if let Some(hit) = self.stages.lock().get(&key) {
            return Ok(hit.clone());
        }

        let binary = match self.load_from_disk(&key) {
            Some(binary) => binary,
            None => {
                self.compiles.fetch_add(1, Ordering::Relaxed);
                let binary = self.compiler.compile(source, stage, defines)?;
                self.store_to_disk(&key, &binary);
                binary
            }
        };
        let layout = reflect(&binary).map_err(|error| ShaderError::Reflect {
            name: source.name.clone(),
            error,
        })?;

        let reflected = self
            .stages
            .lock()
            .entry(key)
            .or_insert((binary, layout))
            .clone();
        Ok(reflected)
    }

    /// Compile each stage of `request` and link them.
    pub fn program(&self, request: &ProgramRequest) -> Result<Arc<ShaderProgram>, ShaderError> {
        let keys: Vec<StageKey> = request
            .stages
            .iter()
            .map(|(source, stage)| StageKey {
                source: source.hash,
                stage: *stage,
                defines: request.defines.clone(),
            })
            .collect();
        if let Some(program) = self.programs.lock().get(&keys) {
            return Ok(Arc::clone(program));
        }

        let stages = request
            .stages
            .iter()
            .map(|(source, stage)| self.stage(source, *stage, &request.defines))
            .collect::<Result<Vec<_>, _>>()?;
        let program = Arc::new(ShaderProgram::link(stages)?);

        tracing::debug!(
            "Linked program {:016x} ({} stages, {} bindings)",
            program.id().0,
            program.stages().len(),
            program.layout().bindings.len()
        );
        Ok(Arc::clone(self.programs.lock().entry(keys).or_insert(program)))
    }

    /// The built-in lit mesh program.
    pub fn mesh_program(&self, alpha_mask: bool) -> Result<Arc<ShaderProgram>, ShaderError> {
        self.program(&builtin::mesh_program(alpha_mask))
    }

    /// Compile `requests` on the rayon pool. Results are in request order.
    pub fn warm_up(&self, requests: &[ProgramRequest]) -> Vec<Result<Arc<ShaderProgram>, ShaderError>> {
        let started = std::time::Instant::now();
        let results: Vec<_> = requests.par_iter().map(|r| self.program(r)).collect();
        tracing::info!(
            "Shader warm-up: {} programs in {:.1} ms",
            results.iter().filter(|r| r.is_ok()).count(),
            started.elapsed().as_secs_f64() * 1000.0
        );
        results
    }

    fn cache_path(&self, key: &StageKey) -> Option<PathBuf> {
        self.disk_cache
            .as_deref()
            .map(|dir| dir.join(key.file_name(self.compiler.name())))
    }

    fn load_from_disk(&self, key: &StageKey) -> Option<IntermediateBinary> {
        let path = self.cache_path(key)?;
        let bytes = std::fs::read(&path).ok()?;
        match bytes_to_spirv(&bytes) {
            Some(words) => {
                tracing::trace!("Shader cache hit: {}", path.display());
                Some(IntermediateBinary::new(key.stage, "main", words))
            }
            None => {
                tracing::warn!("Ignoring corrupt shader cache entry {}", path.display());
                None
            }
        }
    }

    fn store_to_disk(&self, key: &StageKey, binary: &IntermediateBinary) {
        let Some(path) = self.cache_path(key) else {
            return;
        };
        if let Err(e) = write_entry(&path, binary.as_bytes()) {
            tracing::warn!("Failed to write shader cache entry {}: {e}", path.display());
        }
    }
}

fn write_entry(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, bytes)
}

/// Convert a byte slice to SPIR-V words, rejecting truncated or foreign data.
fn bytes_to_spirv(bytes: &[u8]) -> Option<Vec<u32>> {
    if bytes.len() % 4 != 0 || bytes.len() < 20 {
        return None;
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    (words[0] == SPIRV_MAGIC).then_some(words)
}
