//! Swapchain creation and surface negotiation.

use super::convert;
use crate::error::{GpuError, Result};
use crate::types::{Extent2D, Format};
use ash::vk;

/// A driver swapchain with one view per image.
pub struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub format: Format,
    pub extent: Extent2D,
}

/// Surface-side inputs for [`SwapchainState::new`].
pub struct SurfaceParams<'a> {
    pub surface: vk::SurfaceKHR,
    pub extent: Extent2D,
    pub vsync: bool,
    pub old: Option<vk::SwapchainKHR>,
    /// Graphics family first; a second entry enables concurrent sharing.
    pub queue_families: &'a [u32],
}

impl SwapchainState {
    /// # Safety
    /// All handles must be valid; `old` must not be in use.
    pub unsafe fn new(
        device: &ash::Device,
        surface_loader: &ash::khr::surface::Instance,
        swapchain_loader: &ash::khr::swapchain::Device,
        physical_device: vk::PhysicalDevice,
        params: &SurfaceParams<'_>,
    ) -> Result<Self> {
        let capabilities = unsafe {
            surface_loader
                .get_physical_device_surface_capabilities(physical_device, params.surface)
        }?;
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(physical_device, params.surface)
        }?;
        let present_modes = unsafe {
            surface_loader
                .get_physical_device_surface_present_modes(physical_device, params.surface)
        }?;

        let (surface_format, format) = select_surface_format(&formats).ok_or_else(|| {
            GpuError::SurfaceCreation("surface offers no supported color format".to_string())
        })?;
        let present_mode = select_present_mode(&present_modes, params.vsync);
        let extent = calculate_extent(&capabilities, params.extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::SurfaceLost);
        }

        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
            image_count = capabilities.max_image_count;
        }

        let sharing_mode = if params.queue_families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(params.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(params.queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(params.old.unwrap_or_default());

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }?;
        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e.into());
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .subresource_range(color_range());
            match unsafe { device.create_image_view(&view_info, None) } {
                Ok(view) => views.push(view),
                Err(e) => {
                    for view in views {
                        unsafe { device.destroy_image_view(view, None) };
                    }
                    unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(
            "Created swapchain {}x{} {:?} {:?} with {} images",
            extent.width,
            extent.height,
            format,
            present_mode,
            images.len()
        );

        Ok(Self {
            swapchain,
            images,
            views,
            format,
            extent: Extent2D::new(extent.width, extent.height),
        })
    }

    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(
        &self,
        device: &ash::Device,
        swapchain_loader: &ash::khr::swapchain::Device,
    ) {
        for &view in &self.views {
            unsafe { device.destroy_image_view(view, None) };
        }
        unsafe { swapchain_loader.destroy_swapchain(self.swapchain, None) };
    }
}

pub fn color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .level_count(1)
        .layer_count(1)
}

/// Prefer sRGB BGRA, else the first format the engine can render to.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
) -> Option<(vk::SurfaceFormatKHR, Format)> {
    available
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| {
            available
                .iter()
                .find(|f| convert::surface_format(f.format).is_some())
        })
        .and_then(|f| convert::surface_format(f.format).map(|format| (*f, format)))
}

pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn calculate_extent(capabilities: &vk::SurfaceCapabilitiesKHR, desired: Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width == u32::MAX {
        vk::Extent2D {
            width: desired.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    } else {
        capabilities.current_extent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn srgb_bgra_is_preferred() {
        let available = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        let (_, format) = select_surface_format(&available).unwrap();
        assert_eq!(format, Format::Bgra8Srgb);
    }

    #[test]
    fn unknown_formats_are_skipped() {
        let available = [
            surface_format(vk::Format::A2B10G10R10_UNORM_PACK32),
            surface_format(vk::Format::R8G8B8A8_UNORM),
        ];
        let (_, format) = select_surface_format(&available).unwrap();
        assert_eq!(format, Format::Rgba8Unorm);
        assert!(select_surface_format(&available[..1]).is_none());
    }

    #[test]
    fn present_mode_respects_vsync() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_is_clamped_when_surface_is_flexible() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 16,
                height: 16,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&capabilities, Extent2D::new(4096, 8));
        assert_eq!((extent.width, extent.height), (1024, 16));
    }
}
