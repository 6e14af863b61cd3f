//! Backend-neutral handles and resource descriptions.

use crate::memory::UsageClass;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

macro_rules! define_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
            pub struct $name(pub u64);

            impl $name {
                pub const fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

define_handle! {
    /// A backing memory region owned by an allocator arena.
    RegionId;
    /// An image together with its default view.
    ImageId;
    SamplerId;
    SetLayoutId;
    PipelineLayoutId;
    /// A driver pipeline object.
    RawPipelineId;
    DescriptorSetId;
    CommandBufferId;
    FenceId;
    SemaphoreId;
    SwapchainId;
    /// A native presentable surface created by the backend.
    SurfaceHandle;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const fn is_zero(self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn aspect(self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Image and attachment formats used by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Format {
    Bgra8Srgb,
    Bgra8Unorm,
    Rgba8Srgb,
    Rgba8Unorm,
    Rgba16Float,
    D32Float,
    D24UnormS8,
}

impl Format {
    pub const fn is_depth(self) -> bool {
        matches!(self, Self::D32Float | Self::D24UnormS8)
    }

    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba16Float => 8,
            _ => 4,
        }
    }
}

/// Logical queue a submission targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    /// Falls back to the graphics queue when no dedicated transfer family exists.
    Transfer,
    /// Falls back to the graphics queue when it can present.
    Present,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

/// Stage at which a submission waits on a semaphore.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    ColorAttachmentOutput,
    Transfer,
    AllCommands,
}

/// A byte range inside a backing region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferSlice {
    pub region: RegionId,
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionDesc {
    pub class: UsageClass,
    pub size: u64,
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageDesc {
    pub extent: Extent2D,
    pub format: Format,
    pub usage: ImageUsage,
}

impl ImageDesc {
    pub const fn texture(extent: Extent2D, format: Format) -> Self {
        Self {
            extent,
            format,
            usage: ImageUsage::SAMPLED.union(ImageUsage::TRANSFER_DST),
        }
    }

    pub const fn depth(extent: Extent2D, format: Format) -> Self {
        Self {
            extent,
            format,
            usage: ImageUsage::DEPTH_ATTACHMENT,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressMode {
    #[default]
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
}

/// A semaphore wait inside a submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: SemaphoreId,
    pub stage: PipelineStage,
}

/// One queue submission.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Submission {
    pub command_buffers: Vec<CommandBufferId>,
    pub wait: Vec<SemaphoreWait>,
    pub signal: Vec<SemaphoreId>,
    pub fence: Option<FenceId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub surface: SurfaceHandle,
    pub extent: Extent2D,
    pub vsync: bool,
    pub old: Option<SwapchainId>,
}

/// A created swapchain; `images` are owned by the swapchain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwapchainInfo {
    pub id: SwapchainId,
    pub format: Format,
    pub extent: Extent2D,
    pub images: Vec<ImageId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn aspect_handles_degenerate_extents() {
        assert_relative_eq!(Extent2D::new(1920, 1080).aspect(), 16.0 / 9.0);
        assert_relative_eq!(Extent2D::new(640, 0).aspect(), 1.0);
    }
}
