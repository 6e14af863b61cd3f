//! Adapter capabilities, requirements and selection.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Optional device capabilities queried through `DeviceContext::supports`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Features: u32 {
        const DYNAMIC_RENDERING = 1 << 0;
        const SYNCHRONIZATION2 = 1 << 1;
        const TIMELINE_SEMAPHORES = 1 << 2;
        const DESCRIPTOR_INDEXING = 1 << 3;
        const SAMPLER_ANISOTROPY = 1 << 4;
        const RAY_TRACING = 1 << 5;
        const MESH_SHADER = 1 << 6;
    }
}

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterType {
    Discrete,
    Integrated,
    Virtual,
    Cpu,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyInfo {
    pub index: u32,
    pub graphics: bool,
    pub compute: bool,
    pub transfer: bool,
    /// Can present to the surface passed at enumeration.
    pub present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_uniform_buffer_offset_alignment: u64,
    pub optimal_buffer_copy_offset_alignment: u64,
    pub max_push_constants_size: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            min_uniform_buffer_offset_alignment: 256,
            optimal_buffer_copy_offset_alignment: 4,
            max_push_constants_size: 128,
        }
    }
}

/// Description of a physical adapter as reported by a backend.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    /// Backend-specific adapter index.
    pub index: usize,
    pub name: String,
    pub vendor: GpuVendor,
    pub adapter_type: AdapterType,
    /// Driver-reported API version as `(major, minor)`.
    pub api_version: (u32, u32),
    pub extensions: Vec<String>,
    pub features: Features,
    pub device_local_bytes: u64,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub limits: DeviceLimits,
}

impl AdapterInfo {
    /// Get a human-readable summary of the adapter.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, {:?}) - Vulkan {}.{} - {} MB VRAM",
            self.name,
            self.vendor,
            self.adapter_type,
            self.api_version.0,
            self.api_version.1,
            self.device_local_bytes / (1024 * 1024),
        )
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| ext == name)
    }
}

/// Minimum requirement set an adapter must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequirements {
    pub extensions: Vec<String>,
    pub features: Features,
    /// Require a queue family that can present to the target surface.
    pub present: bool,
}

/// Why an adapter was not selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    ApiVersion { major: u32, minor: u32 },
    MissingExtension(String),
    MissingFeatures(Features),
    NoGraphicsQueue,
    NoPresentQueue,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiVersion { major, minor } => {
                write!(f, "Vulkan {major}.{minor} is below the required 1.3")
            }
            Self::MissingExtension(ext) => write!(f, "missing extension {ext}"),
            Self::MissingFeatures(features) => write!(f, "missing features {features:?}"),
            Self::NoGraphicsQueue => f.write_str("no graphics queue family"),
            Self::NoPresentQueue => f.write_str("no queue family can present to the surface"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub adapter: String,
    pub reason: RejectReason,
}

/// Queue family assignment for a selected adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePlan {
    pub graphics: u32,
    /// Dedicated transfer family (no graphics or compute), if one exists.
    pub transfer: Option<u32>,
    /// Present family when it differs from graphics.
    pub present: Option<u32>,
}

impl QueuePlan {
    /// Unique families that need a queue.
    pub fn families(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.transfer, self.present].into_iter().flatten() {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Check requirements and derive the queue plan.
pub fn evaluate_adapter(
    adapter: &AdapterInfo,
    requirements: &DeviceRequirements,
) -> Result<QueuePlan, RejectReason> {
    let (major, minor) = adapter.api_version;
    if (major, minor) < (1, 3) {
        return Err(RejectReason::ApiVersion { major, minor });
    }

    if let Some(missing) = requirements
        .extensions
        .iter()
        .find(|ext| !adapter.has_extension(ext))
    {
        return Err(RejectReason::MissingExtension(missing.clone()));
    }

    let missing = requirements.features - adapter.features;
    if !missing.is_empty() {
        return Err(RejectReason::MissingFeatures(missing));
    }

    let families = &adapter.queue_families;
    let graphics = families
        .iter()
        .find(|f| f.graphics)
        .ok_or(RejectReason::NoGraphicsQueue)?;

    // Dedicated transfer queue (no graphics or compute)
    let transfer = families
        .iter()
        .find(|f| f.transfer && !f.graphics && !f.compute)
        .map(|f| f.index);

    let present = if !requirements.present || graphics.present {
        None
    } else {
        Some(
            families
                .iter()
                .find(|f| f.present)
                .ok_or(RejectReason::NoPresentQueue)?
                .index,
        )
    };

    Ok(QueuePlan {
        graphics: graphics.index,
        transfer,
        present,
    })
}

/// Score a suitable adapter for selection.
pub fn score_adapter(adapter: &AdapterInfo) -> u64 {
    // Prefer discrete GPUs
    let type_score = match adapter.adapter_type {
        AdapterType::Discrete => 1000,
        AdapterType::Integrated => 100,
        AdapterType::Virtual => 50,
        AdapterType::Cpu | AdapterType::Other => 0,
    };

    // +1 per GB of device-local memory
    type_score + adapter.device_local_bytes / (1024 * 1024 * 1024)
}

/// Pick the best adapter, or report every rejection.
pub fn select_adapter(
    adapters: &[AdapterInfo],
    requirements: &DeviceRequirements,
) -> Result<(usize, QueuePlan), Vec<Rejection>> {
    let mut rejected = Vec::new();
    let mut best: Option<(u64, usize, QueuePlan)> = None;

    for (position, adapter) in adapters.iter().enumerate() {
        match evaluate_adapter(adapter, requirements) {
            Ok(plan) => {
                let score = score_adapter(adapter);
                if best.map_or(true, |(best_score, _, _)| score > best_score) {
                    best = Some((score, position, plan));
                }
            }
            Err(reason) => {
                tracing::debug!("Rejected adapter {}: {reason}", adapter.name);
                rejected.push(Rejection {
                    adapter: adapter.name.clone(),
                    reason,
                });
            }
        }
    }

    best.map(|(_, position, plan)| (position, plan))
        .ok_or(rejected)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn adapter(name: &str, adapter_type: AdapterType, gib: u64) -> AdapterInfo {
        AdapterInfo {
            index: 0,
            name: name.to_string(),
            vendor: GpuVendor::Other(0),
            adapter_type,
            api_version: (1, 3),
            extensions: vec!["VK_KHR_swapchain".to_string()],
            features: Features::DYNAMIC_RENDERING | Features::SYNCHRONIZATION2,
            device_local_bytes: gib * 1024 * 1024 * 1024,
            queue_families: vec![QueueFamilyInfo {
                index: 0,
                graphics: true,
                compute: true,
                transfer: true,
                present: true,
            }],
            limits: DeviceLimits::default(),
        }
    }

    #[test]
    fn features_serialize_as_flag_names() {
        let features = Features::DYNAMIC_RENDERING | Features::TIMELINE_SEMAPHORES;
        let json = serde_json::to_string(&features).unwrap();
        assert!(json.contains("DYNAMIC_RENDERING"), "{json}");
        let back: Features = serde_json::from_str(&json).unwrap();
        assert_eq!(back, features);
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn discrete_beats_integrated() {
        let adapters = [
            adapter("igpu", AdapterType::Integrated, 16),
            adapter("dgpu", AdapterType::Discrete, 4),
        ];
        let (chosen, _) = select_adapter(&adapters, &DeviceRequirements::default()).unwrap();
        assert_eq!(adapters[chosen].name, "dgpu");
    }

    #[test]
    fn every_rejection_is_reported() {
        let mut old = adapter("old", AdapterType::Discrete, 8);
        old.api_version = (1, 2);
        let plain = adapter("plain", AdapterType::Integrated, 2);

        let requirements = DeviceRequirements {
            features: Features::RAY_TRACING,
            ..Default::default()
        };
        let rejected = select_adapter(&[old, plain], &requirements).unwrap_err();
        assert_eq!(rejected.len(), 2);
        assert_eq!(
            rejected[0].reason,
            RejectReason::ApiVersion { major: 1, minor: 2 }
        );
        assert_eq!(
            rejected[1].reason,
            RejectReason::MissingFeatures(Features::RAY_TRACING)
        );
    }

    #[test]
    fn queue_plan_prefers_dedicated_families() {
        let mut gpu = adapter("gpu", AdapterType::Discrete, 8);
        gpu.queue_families[0].present = false;
        gpu.queue_families.push(QueueFamilyInfo {
            index: 1,
            graphics: false,
            compute: false,
            transfer: true,
            present: false,
        });
        gpu.queue_families.push(QueueFamilyInfo {
            index: 2,
            graphics: false,
            compute: true,
            transfer: true,
            present: true,
        });

        let requirements = DeviceRequirements {
            present: true,
            ..Default::default()
        };
        let plan = evaluate_adapter(&gpu, &requirements).unwrap();
        assert_eq!(plan.graphics, 0);
        assert_eq!(plan.transfer, Some(1));
        assert_eq!(plan.present, Some(2));
        assert_eq!(plan.families(), vec![0, 1, 2]);

        gpu.queue_families.truncate(1);
        assert_eq!(
            evaluate_adapter(&gpu, &requirements),
            Err(RejectReason::NoPresentQueue)
        );
    }
}
