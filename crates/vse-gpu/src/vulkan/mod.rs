//! Vulkan implementation of the device seam.

mod convert;
mod debug;
mod device;
mod encode;
mod instance;
mod swapchain;

pub use device::VulkanDevice;
pub use instance::required_instance_extensions;

use crate::capabilities::{AdapterInfo, Features, QueuePlan};
use crate::context::DeviceConfig;
use crate::device::{Backend, GpuDevice};
use crate::error::{GpuError, Result};
use crate::types::SurfaceHandle;
use ash::vk;
use ash::vk::Handle;
use debug::DebugMessenger;
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use vse_core::DiagnosticSink;

/// Instance-level objects shared by the backend and every device it opens.
pub struct InstanceShared {
    // Keeps the loader library loaded
    entry: ash::Entry,
    instance: ash::Instance,
    surface_loader: ash::khr::surface::Instance,
    debug: Option<DebugMessenger>,
    surfaces: Mutex<Vec<vk::SurfaceKHR>>,
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        unsafe {
            for surface in self.surfaces.get_mut().drain(..) {
                self.surface_loader.destroy_surface(surface, None);
            }
            if let Some(debug) = self.debug.take() {
                debug.destroy();
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Entry point to the Vulkan driver.
pub struct VulkanBackend {
    shared: Arc<InstanceShared>,
}

impl VulkanBackend {
    /// Load Vulkan and create an instance. Validation messages go to `sink`.
    pub fn new(config: &DeviceConfig, sink: Arc<dyn DiagnosticSink>) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let (instance, validation) =
            unsafe { instance::create_instance(&entry, &config.app_name, config.validation) }?;

        let debug = if validation {
            match DebugMessenger::new(&entry, &instance, sink) {
                Ok(debug) => Some(debug),
                Err(e) => {
                    tracing::warn!("Validation enabled without a messenger: {e}");
                    None
                }
            }
        } else {
            None
        };
        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        tracing::info!(
            "Vulkan instance created (validation {})",
            if validation { "on" } else { "off" }
        );

        Ok(Self {
            shared: Arc::new(InstanceShared {
                entry,
                instance,
                surface_loader,
                debug,
                surfaces: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Create a presentable surface for `window`. The backend owns it until drop.
    ///
    /// # Safety
    /// The window must outlive every swapchain created on the surface.
    pub unsafe fn create_surface<W>(&self, window: &W) -> Result<SurfaceHandle>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        let handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface = unsafe {
            ash_window::create_surface(
                &self.shared.entry,
                &self.shared.instance,
                display.as_raw(),
                handle.as_raw(),
                None,
            )
        }
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        self.shared.surfaces.lock().push(surface);
        Ok(SurfaceHandle(surface.as_raw()))
    }

    fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        Ok(unsafe { self.shared.instance.enumerate_physical_devices() }?)
    }
}

impl Backend for VulkanBackend {
    fn enumerate_adapters(&self, surface: Option<SurfaceHandle>) -> Result<Vec<AdapterInfo>> {
        let surface = surface.map(|handle| vk::SurfaceKHR::from_raw(handle.raw()));
        let adapters = self
            .physical_devices()?
            .into_iter()
            .enumerate()
            .map(|(index, physical_device)| unsafe {
                instance::query_adapter(
                    &self.shared.instance,
                    &self.shared.surface_loader,
                    physical_device,
                    index,
                    surface,
                )
            })
            .collect();
        Ok(adapters)
    }

    fn open_device(
        &self,
        adapter: &AdapterInfo,
        plan: &QueuePlan,
        extensions: &[String],
        features: Features,
    ) -> Result<Arc<dyn GpuDevice>> {
        let physical_device = self
            .physical_devices()?
            .get(adapter.index)
            .copied()
            .ok_or_else(|| GpuError::ResourceNotFound(format!("adapter {}", adapter.index)))?;
        let device = unsafe {
            VulkanDevice::new(
                Arc::clone(&self.shared),
                physical_device,
                adapter,
                plan,
                extensions,
                features,
            )
        }?;
        Ok(Arc::new(device))
    }
}
