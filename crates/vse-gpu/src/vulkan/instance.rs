//! Vulkan instance creation and adapter queries.

use crate::capabilities::{
    AdapterInfo, AdapterType, DeviceLimits, Features, GpuVendor, QueueFamilyInfo,
};
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Instance extensions required for presenting on this platform.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xcb_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

fn validation_layer_available(entry: &ash::Entry) -> bool {
    let Ok(layers) = (unsafe { entry.enumerate_instance_layer_properties() }) else {
        return false;
    };
    layers.iter().any(|props| {
        // SAFETY: layer_name is a null-terminated array filled by the loader
        (unsafe { CStr::from_ptr(props.layer_name.as_ptr()) }) == VALIDATION_LAYER
    })
}

/// Create a Vulkan 1.3 instance. Returns whether validation was enabled.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<(ash::Instance, bool)> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::Other("application name contains a NUL byte".to_string()))?;
    let engine_name = c"VSE";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let validation = enable_validation && validation_layer_available(entry);
    if enable_validation && !validation {
        tracing::warn!("Validation layer {:?} not available", VALIDATION_LAYER);
    }

    let mut extensions = required_instance_extensions();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();
    let layer_names: Vec<*const std::ffi::c_char> = if validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        Vec::new()
    };

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None) }?;
    Ok((instance, validation))
}

/// Describe a physical device. Present support is checked against `surface`.
///
/// # Safety
/// The instance and physical device must be valid.
pub unsafe fn query_adapter(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    index: usize,
    surface: Option<vk::SurfaceKHR>,
) -> AdapterInfo {
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let memory = unsafe { instance.get_physical_device_memory_properties(physical_device) };

    let extensions: Vec<String> =
        unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default()
            .iter()
            .filter_map(|ext| {
                // SAFETY: extension_name is a null-terminated array
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

    let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
    let mut vulkan_1_3 = vk::PhysicalDeviceVulkan13Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut vulkan_1_2)
        .push_next(&mut vulkan_1_3);
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    let base = features2.features;

    let has = |name: &str| extensions.iter().any(|ext| ext == name);
    let mut features = Features::empty();
    features.set(Features::DYNAMIC_RENDERING, vulkan_1_3.dynamic_rendering == vk::TRUE);
    features.set(Features::SYNCHRONIZATION2, vulkan_1_3.synchronization2 == vk::TRUE);
    features.set(Features::TIMELINE_SEMAPHORES, vulkan_1_2.timeline_semaphore == vk::TRUE);
    features.set(Features::DESCRIPTOR_INDEXING, vulkan_1_2.descriptor_indexing == vk::TRUE);
    features.set(Features::SAMPLER_ANISOTROPY, base.sampler_anisotropy == vk::TRUE);
    features.set(
        Features::RAY_TRACING,
        has("VK_KHR_ray_tracing_pipeline") && has("VK_KHR_acceleration_structure"),
    );
    features.set(Features::MESH_SHADER, has("VK_EXT_mesh_shader"));

    let device_local_bytes = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|heap| heap.size)
        .sum();

    let queue_families = unsafe {
        instance.get_physical_device_queue_family_properties(physical_device)
    }
    .iter()
    .enumerate()
    .map(|(i, family)| {
        let index = i as u32;
        let present = surface.is_some_and(|surface| {
            unsafe {
                surface_loader.get_physical_device_surface_support(physical_device, index, surface)
            }
            .unwrap_or(false)
        });
        QueueFamilyInfo {
            index,
            graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            compute: family.queue_flags.contains(vk::QueueFlags::COMPUTE),
            transfer: family.queue_flags.contains(vk::QueueFlags::TRANSFER),
            present,
        }
    })
    .collect();

    let adapter_type = match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterType::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterType::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterType::Virtual,
        vk::PhysicalDeviceType::CPU => AdapterType::Cpu,
        _ => AdapterType::Other,
    };

    AdapterInfo {
        index,
        // SAFETY: device_name is a null-terminated array
        name: unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned(),
        vendor: GpuVendor::from_vendor_id(properties.vendor_id),
        adapter_type,
        api_version: (
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
        ),
        extensions,
        features,
        device_local_bytes,
        queue_families,
        limits: DeviceLimits {
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            optimal_buffer_copy_offset_alignment: properties
                .limits
                .optimal_buffer_copy_offset_alignment,
            max_push_constants_size: properties.limits.max_push_constants_size,
        },
    }
}
