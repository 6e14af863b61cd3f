//! GPU error types.

use crate::memory::UsageClass;
use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Vulkan error without a more specific mapping.
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    /// Sub-allocation request could not be satisfied within the class ceiling.
    #[error("Out of {class:?} memory: requested {requested} bytes, ceiling {ceiling} bytes")]
    OutOfMemory {
        class: UsageClass,
        requested: u64,
        ceiling: u64,
    },

    /// The driver refused to allocate a backing region.
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// Descriptor pool could not hold another set.
    #[error("Descriptor pool exhausted")]
    DescriptorPoolExhausted,

    /// Swapchain no longer matches the surface.
    #[error("Swapchain out of date")]
    OutOfDate,

    /// Presentation surface was lost.
    #[error("Surface lost")]
    SurfaceLost,

    /// Device was lost; the context must be re-created.
    #[error("Device lost")]
    DeviceLost,

    /// A wait exceeded its timeout.
    #[error("Timed out waiting for the GPU")]
    Timeout,

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Shader module creation failed.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Unknown or destroyed handle.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfDeviceMemory
            }
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                Self::DescriptorPoolExhausted
            }
            vk::Result::TIMEOUT => Self::Timeout,
            other => Self::Vulkan(other),
        }
    }
}

impl GpuError {
    /// Recoverable by rebuilding the swapchain.
    pub const fn is_surface_error(&self) -> bool {
        matches!(self, Self::OutOfDate | Self::SurfaceLost)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_results_map_to_taxonomy() {
        assert_eq!(
            GpuError::from(vk::Result::ERROR_DEVICE_LOST),
            GpuError::DeviceLost
        );
        assert!(GpuError::from(vk::Result::ERROR_OUT_OF_DATE_KHR).is_surface_error());
        assert!(GpuError::from(vk::Result::ERROR_SURFACE_LOST_KHR).is_surface_error());
        assert_eq!(
            GpuError::from(vk::Result::ERROR_OUT_OF_POOL_MEMORY),
            GpuError::DescriptorPoolExhausted
        );
        assert_eq!(
            GpuError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED)
        );
    }
}
