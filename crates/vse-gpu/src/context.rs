//! Device context: adapter selection, logical device, queues and allocator.

use crate::capabilities::{select_adapter, AdapterInfo, DeviceRequirements, Features, QueuePlan, Rejection};
use crate::device::{Backend, GpuDevice};
use crate::error::GpuError;
use crate::memory::{Allocator, AllocatorConfig};
use crate::types::SurfaceHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Device creation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub app_name: String,
    /// Enable validation layers and the debug messenger.
    pub validation: bool,
    pub requirements: DeviceRequirements,
    /// Features enabled when the adapter has them.
    pub optional_features: Features,
    pub allocator: AllocatorConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "VSE Application".to_string(),
            validation: cfg!(debug_assertions),
            requirements: DeviceRequirements {
                extensions: Vec::new(),
                features: Features::DYNAMIC_RENDERING | Features::SYNCHRONIZATION2,
                present: true,
            },
            optional_features: Features::TIMELINE_SEMAPHORES
                | Features::SAMPLER_ANISOTROPY
                | Features::DESCRIPTOR_INDEXING,
            allocator: AllocatorConfig::default(),
        }
    }
}

impl DeviceConfig {
    #[must_use]
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    #[must_use]
    pub fn with_requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    #[must_use]
    pub const fn with_optional_features(mut self, features: Features) -> Self {
        self.optional_features = features;
        self
    }

    #[must_use]
    pub const fn with_allocator(mut self, allocator: AllocatorConfig) -> Self {
        self.allocator = allocator;
        self
    }
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("no suitable GPU adapter: {}", RejectionList(.rejected))]
    NoSuitableAdapter { rejected: Vec<Rejection> },
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

struct RejectionList<'a>(&'a [Rejection]);

impl fmt::Display for RejectionList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("no adapters found");
        }
        for (i, rejection) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", rejection.adapter, rejection.reason)?;
        }
        Ok(())
    }
}

/// Owns the logical device for the lifetime of the engine.
pub struct DeviceContext {
    // Field order is drop order: allocator, then device, then the backend.
    allocator: Arc<Allocator>,
    device: Arc<dyn GpuDevice>,
    adapter: AdapterInfo,
    queues: QueuePlan,
    features: Features,
    _backend: Arc<dyn Backend>,
}

impl DeviceContext {
    /// Select an adapter, open the device and create the allocator.
    pub fn initialize(
        backend: Arc<dyn Backend>,
        config: &DeviceConfig,
        surface: Option<SurfaceHandle>,
    ) -> Result<Self, InitError> {
        let adapters = backend.enumerate_adapters(surface)?;
        let mut requirements = config.requirements.clone();
        requirements.present &= surface.is_some();

        let (position, queues) = select_adapter(&adapters, &requirements)
            .map_err(|rejected| InitError::NoSuitableAdapter { rejected })?;
        let adapter = adapters[position].clone();

        let features = adapter.features & (requirements.features | config.optional_features);
        let device = backend.open_device(&adapter, &queues, &requirements.extensions, features)?;

        tracing::info!("Selected GPU: {}", adapter.summary());
        tracing::info!(
            "Queues: graphics {}, transfer {:?}, present {:?}",
            queues.graphics,
            queues.transfer,
            queues.present
        );

        let allocator = Arc::new(Allocator::new(device.clone(), config.allocator.clone()));

        Ok(Self {
            allocator,
            device,
            adapter,
            queues,
            features,
            _backend: backend,
        })
    }

    /// Whether every feature in `features` was enabled on the device.
    pub const fn supports(&self, features: Features) -> bool {
        self.features.contains(features)
    }

    pub const fn features(&self) -> Features {
        self.features
    }

    pub const fn queues(&self) -> QueuePlan {
        self.queues
    }

    pub const fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub const fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    pub fn wait_idle(&self) -> Result<(), GpuError> {
        self.device.wait_idle()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle on shutdown: {e}");
        }
        self.allocator.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::tests::adapter;
    use crate::capabilities::{AdapterType, RejectReason};
    use crate::headless::{HeadlessBackend, HeadlessConfig, HeadlessSurface};
    use crate::types::Extent2D;

    #[test]
    fn picks_the_discrete_adapter() {
        let backend = Arc::new(HeadlessBackend::with_adapters(
            HeadlessConfig::default(),
            vec![
                adapter("Integrated", AdapterType::Integrated, 2),
                adapter("Discrete", AdapterType::Discrete, 8),
            ],
        ));
        let surface = HeadlessSurface::new(Extent2D::new(64, 64));
        let ctx = DeviceContext::initialize(backend.clone(), &DeviceConfig::default(), Some(surface.handle()))
            .unwrap();
        assert_eq!(ctx.adapter().name, "Discrete");
        assert!(ctx.supports(Features::DYNAMIC_RENDERING));
        assert!(backend.device().is_some());
    }

    #[test]
    fn optional_features_are_enabled_only_when_available() {
        let mut limited = adapter("Limited", AdapterType::Discrete, 4);
        limited.features = Features::DYNAMIC_RENDERING | Features::SYNCHRONIZATION2;
        let backend = Arc::new(HeadlessBackend::with_adapters(HeadlessConfig::default(), vec![limited]));
        let config = DeviceConfig::default().with_optional_features(Features::RAY_TRACING);
        let ctx = DeviceContext::initialize(backend, &config, None).unwrap();
        assert!(!ctx.supports(Features::RAY_TRACING));
        assert!(ctx.supports(Features::SYNCHRONIZATION2));
    }

    #[test]
    fn reports_every_rejection() {
        let mut old = adapter("Old", AdapterType::Discrete, 4);
        old.api_version = (1, 2);
        let mut bare = adapter("Bare", AdapterType::Integrated, 1);
        bare.features = Features::empty();
        let backend = Arc::new(HeadlessBackend::with_adapters(HeadlessConfig::default(), vec![old, bare]));

        let Err(InitError::NoSuitableAdapter { rejected }) =
            DeviceContext::initialize(backend, &DeviceConfig::default(), None)
        else {
            panic!("expected NoSuitableAdapter");
        };
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].reason, RejectReason::ApiVersion { major: 1, minor: 2 });
        assert!(matches!(rejected[1].reason, RejectReason::MissingFeatures(_)));
    }
}
