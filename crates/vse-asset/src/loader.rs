//! Background asset loading.

use crate::description::SceneDescription;
use crate::error::{AssetError, Result};
use crate::gltf_loader;
use crossbeam::channel::{self, Receiver, TryRecvError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use vse_core::{Diagnostic, DiagnosticSink, TracingSink};

/// Asset loader configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Size of the upload worker pool.
    pub worker_threads: usize,
    /// Substitute the default white texture for images that fail to decode
    /// instead of rejecting the asset.
    pub fallback_to_default_texture: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            fallback_to_default_texture: false,
        }
    }
}

impl LoaderConfig {
    #[must_use]
    pub const fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    #[must_use]
    pub const fn with_default_texture_fallback(mut self, fallback: bool) -> Self {
        self.fallback_to_default_texture = fallback;
        self
    }
}

/// Cooperative cancellation flag shared between the caller and loader workers.
///
/// Work already submitted to the GPU is not cancelled.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Parses assets off the calling thread.
pub struct AssetLoader {
    config: LoaderConfig,
    sink: Arc<dyn DiagnosticSink>,
}

impl Default for AssetLoader {
    fn default() -> Self {
        Self::new(LoaderConfig::default())
    }
}

impl AssetLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            sink: Arc::new(TracingSink),
        }
    }

    /// Route load warnings to `sink` instead of `tracing`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub const fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Parse `path` on a background thread.
    pub fn load_async(&self, path: impl Into<PathBuf>) -> LoadHandle {
        let path = path.into();
        let token = CancelToken::new();
        let (sender, receiver) = channel::bounded(1);

        let worker_token = token.clone();
        let sink = Arc::clone(&self.sink);
        let source = path.display().to_string();
        let spawned = std::thread::Builder::new()
            .name("vse-asset-parse".to_string())
            .spawn(move || {
                let result = if worker_token.is_cancelled() {
                    Err(AssetError::Cancelled)
                } else {
                    gltf_loader::load_scene(&path)
                };
                let result = match result {
                    Ok(_) if worker_token.is_cancelled() => Err(AssetError::Cancelled),
                    Ok(scene) => {
                        for warning in &scene.warnings {
                            sink.emit(Diagnostic::warning(source.clone(), warning.clone()));
                        }
                        Ok(scene)
                    }
                    Err(error) => Err(error),
                };
                // The handle may already be gone
                let _ = sender.send(result);
            });

        if let Err(error) = spawned {
            let (sender, receiver) = channel::bounded(1);
            let _ = sender.send(Err(AssetError::Worker(error.to_string())));
            return LoadHandle { receiver, token };
        }
        LoadHandle { receiver, token }
    }
}

/// Pending result of [`AssetLoader::load_async`].
pub struct LoadHandle {
    receiver: Receiver<Result<SceneDescription>>,
    token: CancelToken,
}

impl LoadHandle {
    /// The result if parsing has finished.
    pub fn try_recv(&self) -> Option<Result<SceneDescription>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                Some(Err(AssetError::Worker("parse thread exited".to_string())))
            }
        }
    }

    /// Block until parsing finishes.
    pub fn wait(self) -> Result<SceneDescription> {
        self.receiver
            .recv()
            .unwrap_or_else(|_| Err(AssetError::Worker("parse thread exited".to_string())))
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token to hand to `Uploader::upload` so one cancel stops both stages.
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vse_core::{CollectingSink, Severity};

    #[test]
    fn missing_file_is_an_io_error() {
        let handle = AssetLoader::default().load_async("/nonexistent/scene.gltf");
        assert!(matches!(handle.wait(), Err(AssetError::Io { .. })));
    }

    #[test]
    fn cancel_is_shared_by_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());
        token.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn warnings_reach_the_sink() {
        let dir = std::env::temp_dir().join(format!("vse-loader-warn-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ext.gltf");
        std::fs::write(
            &path,
            br#"{"asset":{"version":"2.0"},"extensionsUsed":["KHR_materials_sheen"]}"#,
        )
        .unwrap();

        let sink = Arc::new(CollectingSink::new());
        let handle = AssetLoader::default()
            .with_sink(sink.clone())
            .load_async(&path);
        let scene = handle.wait().unwrap();
        assert_eq!(scene.warnings.len(), 1);
        assert_eq!(sink.count(Severity::Warning), 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn config_round_trips_defaults() {
        let config = LoaderConfig::default().with_worker_threads(2);
        assert_eq!(config.worker_threads, 2);
        assert!(!config.fallback_to_default_texture);
    }
}
