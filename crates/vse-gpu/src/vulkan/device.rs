//! Logical device implementing [`GpuDevice`] with `ash` and `gpu-allocator`.

use super::swapchain::{SurfaceParams, SwapchainState};
use super::{convert, encode, InstanceShared};
use crate::capabilities::{AdapterInfo, DeviceLimits, Features, QueuePlan};
use crate::command::CommandList;
use crate::device::{DescriptorResource, DescriptorWrite, GpuDevice, GraphicsPipelineDesc};
use crate::error::{GpuError, Result};
use crate::memory::UsageClass;
use crate::shader::{PushConstantRange, SetLayoutDesc};
use crate::types::{
    AcquiredImage, CommandBufferId, CommandBufferLevel, DescriptorSetId, FenceId,
    Format, ImageDesc, ImageId, MemoryRequirements, PipelineLayoutId, QueueKind, RawPipelineId,
    RegionDesc, RegionId, SamplerDesc, SamplerId, SemaphoreId, SetLayoutId, Submission,
    SwapchainDesc, SwapchainId, SwapchainInfo,
};
use ash::vk;
use ash::vk::Handle;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::{AllocationError, MemoryLocation};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Alignment of image arenas; covers every optimal-tiling requirement seen in practice.
const IMAGE_REGION_ALIGNMENT: u64 = 64 * 1024;
const SETS_PER_DESCRIPTOR_POOL: u32 = 256;

pub struct RegionEntry {
    class: UsageClass,
    size: u64,
    buffer: Option<vk::Buffer>,
    allocation: Allocation,
}

pub struct ImageEntry {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: Format,
    /// Swapchain images are owned by their swapchain.
    owned: bool,
}

struct CommandBufferEntry {
    buffer: vk::CommandBuffer,
    family: u32,
}

struct DescriptorSetEntry {
    set: vk::DescriptorSet,
    pool: vk::DescriptorPool,
}

struct SwapchainEntry {
    state: SwapchainState,
    images: Vec<ImageId>,
}

/// Driver objects addressed by engine handles.
#[derive(Default)]
pub struct Resources {
    regions: HashMap<RegionId, RegionEntry>,
    images: HashMap<ImageId, ImageEntry>,
    samplers: HashMap<SamplerId, vk::Sampler>,
    set_layouts: HashMap<SetLayoutId, vk::DescriptorSetLayout>,
    pipeline_layouts: HashMap<PipelineLayoutId, vk::PipelineLayout>,
    pipelines: HashMap<RawPipelineId, vk::Pipeline>,
    descriptor_sets: HashMap<DescriptorSetId, DescriptorSetEntry>,
    command_buffers: HashMap<CommandBufferId, CommandBufferEntry>,
    fences: HashMap<FenceId, vk::Fence>,
    semaphores: HashMap<SemaphoreId, vk::Semaphore>,
    swapchains: HashMap<SwapchainId, SwapchainEntry>,
}

fn not_found(what: &str, id: u64) -> GpuError {
    GpuError::ResourceNotFound(format!("{what} {id}"))
}

impl Resources {
    pub fn buffer(&self, region: RegionId) -> Result<vk::Buffer> {
        self.regions
            .get(&region)
            .and_then(|entry| entry.buffer)
            .ok_or_else(|| not_found("buffer region", region.raw()))
    }

    pub fn image(&self, image: ImageId) -> Result<&ImageEntry> {
        self.images
            .get(&image)
            .ok_or_else(|| not_found("image", image.raw()))
    }

    pub fn pipeline(&self, pipeline: RawPipelineId) -> Result<vk::Pipeline> {
        self.pipelines
            .get(&pipeline)
            .copied()
            .ok_or_else(|| not_found("pipeline", pipeline.raw()))
    }

    pub fn pipeline_layout(&self, layout: PipelineLayoutId) -> Result<vk::PipelineLayout> {
        self.pipeline_layouts
            .get(&layout)
            .copied()
            .ok_or_else(|| not_found("pipeline layout", layout.raw()))
    }

    pub fn descriptor_set(&self, set: DescriptorSetId) -> Result<vk::DescriptorSet> {
        self.descriptor_sets
            .get(&set)
            .map(|entry| entry.set)
            .ok_or_else(|| not_found("descriptor set", set.raw()))
    }

    pub fn command_buffer(&self, cmd: CommandBufferId) -> Result<vk::CommandBuffer> {
        self.command_buffers
            .get(&cmd)
            .map(|entry| entry.buffer)
            .ok_or_else(|| not_found("command buffer", cmd.raw()))
    }

    fn sampler(&self, sampler: SamplerId) -> Result<vk::Sampler> {
        self.samplers
            .get(&sampler)
            .copied()
            .ok_or_else(|| not_found("sampler", sampler.raw()))
    }

    fn semaphore(&self, semaphore: SemaphoreId) -> Result<vk::Semaphore> {
        self.semaphores
            .get(&semaphore)
            .copied()
            .ok_or_else(|| not_found("semaphore", semaphore.raw()))
    }

    fn fence(&self, fence: FenceId) -> Result<vk::Fence> {
        self.fences
            .get(&fence)
            .copied()
            .ok_or_else(|| not_found("fence", fence.raw()))
    }
}

fn allocation_error(error: AllocationError) -> GpuError {
    match error {
        AllocationError::OutOfMemory => GpuError::OutOfDeviceMemory,
        other => GpuError::Other(format!("Allocation failed: {other}")),
    }
}

/// A Vulkan logical device.
pub struct VulkanDevice {
    instance: Arc<InstanceShared>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    swapchain_loader: ash::khr::swapchain::Device,
    allocator: Mutex<Option<Allocator>>,
    plan: QueuePlan,
    limits: DeviceLimits,
    queues: Vec<(u32, Mutex<vk::Queue>)>,
    command_pools: Vec<(u32, Mutex<vk::CommandPool>)>,
    descriptor_pools: Mutex<Vec<vk::DescriptorPool>>,
    image_memory_type_bits: u32,
    resources: RwLock<Resources>,
    next_id: AtomicU64,
}

impl VulkanDevice {
    /// Open a logical device on `physical_device` with one queue per planned family.
    ///
    /// # Safety
    /// `physical_device` must have been enumerated from `instance`.
    pub unsafe fn new(
        instance: Arc<InstanceShared>,
        physical_device: vk::PhysicalDevice,
        adapter: &AdapterInfo,
        plan: &QueuePlan,
        extensions: &[String],
        features: Features,
    ) -> Result<Self> {
        let families = plan.families();
        let queue_priority = 1.0_f32;
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(std::slice::from_ref(&queue_priority))
            })
            .collect();

        let mut extension_names: Vec<CString> = vec![ash::khr::swapchain::NAME.to_owned()];
        for name in extensions {
            let name = CString::new(name.as_str())
                .map_err(|_| GpuError::Other(format!("invalid extension name {name:?}")))?;
            if !extension_names.contains(&name) {
                extension_names.push(name);
            }
        }
        let extension_ptrs: Vec<*const std::ffi::c_char> =
            extension_names.iter().map(|ext| ext.as_ptr()).collect();

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(features.contains(Features::DYNAMIC_RENDERING))
            .synchronization2(features.contains(Features::SYNCHRONIZATION2));
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
            .timeline_semaphore(features.contains(Features::TIMELINE_SEMAPHORES))
            .descriptor_indexing(features.contains(Features::DESCRIPTOR_INDEXING));
        let base_features = vk::PhysicalDeviceFeatures::default()
            .sampler_anisotropy(features.contains(Features::SAMPLER_ANISOTROPY));
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .features(base_features)
            .push_next(&mut vulkan_1_3_features)
            .push_next(&mut vulkan_1_2_features);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features2);

        let device = unsafe {
            instance
                .instance
                .create_device(physical_device, &device_create_info, None)
        }?;

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        });
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(allocation_error(e));
            }
        };

        let queues = families
            .iter()
            .map(|&family| (family, Mutex::new(unsafe { device.get_device_queue(family, 0) })))
            .collect();

        let mut command_pools = Vec::with_capacity(families.len());
        for &family in &families {
            let pool_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
            let pool = unsafe { device.create_command_pool(&pool_info, None) }?;
            command_pools.push((family, Mutex::new(pool)));
        }

        let image_memory_type_bits = unsafe { query_image_memory_types(&device, &families) }?;
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance.instance, &device);

        tracing::info!(
            "Opened device on {} with queue families {:?}",
            adapter.name,
            families
        );

        Ok(Self {
            instance,
            physical_device,
            device,
            swapchain_loader,
            allocator: Mutex::new(Some(allocator)),
            plan: *plan,
            limits: adapter.limits,
            queues,
            command_pools,
            descriptor_pools: Mutex::new(Vec::new()),
            image_memory_type_bits,
            resources: RwLock::new(Resources::default()),
            next_id: AtomicU64::new(1),
        })
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    const fn family(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.plan.graphics,
            QueueKind::Transfer => match self.plan.transfer {
                Some(family) => family,
                None => self.plan.graphics,
            },
            QueueKind::Present => match self.plan.present {
                Some(family) => family,
                None => self.plan.graphics,
            },
        }
    }

    fn queue(&self, kind: QueueKind) -> Result<&Mutex<vk::Queue>> {
        let family = self.family(kind);
        self.queues
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, queue)| queue)
            .ok_or_else(|| GpuError::InvalidState(format!("no queue for family {family}")))
    }

    fn command_pool(&self, family: u32) -> Result<&Mutex<vk::CommandPool>> {
        self.command_pools
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, pool)| pool)
            .ok_or_else(|| GpuError::InvalidState(format!("no command pool for family {family}")))
    }

    /// Families resources are shared between; concurrent sharing when more than one.
    fn sharing_families(&self) -> Vec<u32> {
        self.plan.families()
    }

    fn create_descriptor_pool(&self) -> Result<vk::DescriptorPool> {
        let pool_sizes = [
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::SAMPLED_IMAGE,
            vk::DescriptorType::SAMPLER,
            vk::DescriptorType::STORAGE_IMAGE,
        ]
        .map(|ty| vk::DescriptorPoolSize {
            ty,
            descriptor_count: SETS_PER_DESCRIPTOR_POOL * 4,
        });
        let info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(SETS_PER_DESCRIPTOR_POOL)
            .pool_sizes(&pool_sizes);
        Ok(unsafe { self.device.create_descriptor_pool(&info, None) }?)
    }

    /// Create an unbound optimal-tiling image.
    unsafe fn create_vk_image(&self, desc: &ImageDesc) -> Result<vk::Image> {
        let families = self.sharing_families();
        let sharing_mode = if families.len() > 1 {
            vk::SharingMode::CONCURRENT
        } else {
            vk::SharingMode::EXCLUSIVE
        };
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(convert::format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(convert::image_usage(desc.usage))
            .sharing_mode(sharing_mode)
            .queue_family_indices(&families)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        Ok(unsafe { self.device.create_image(&info, None) }?)
    }

    unsafe fn create_view(&self, image: vk::Image, format: Format) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(convert::format(format))
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(convert::aspect(format))
                    .level_count(1)
                    .layer_count(1),
            );
        Ok(unsafe { self.device.create_image_view(&info, None) }?)
    }

    fn free_region_entry(&self, entry: RegionEntry) {
        if let Some(buffer) = entry.buffer {
            unsafe { self.device.destroy_buffer(buffer, None) };
        }
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(entry.allocation) {
                tracing::error!("Failed to free {:?} region: {e}", entry.class);
            }
        }
    }

    unsafe fn build_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<vk::Pipeline> {
        let layout = self.resources.read().pipeline_layout(desc.layout)?;
        let state = desc.state;

        let mut modules = Vec::with_capacity(desc.stages.len());
        let mut entry_points = Vec::with_capacity(desc.stages.len());
        for stage in desc.stages {
            let info = vk::ShaderModuleCreateInfo::default().code(&stage.words);
            match unsafe { self.device.create_shader_module(&info, None) } {
                Ok(module) => modules.push(module),
                Err(e) => {
                    for module in modules {
                        unsafe { self.device.destroy_shader_module(module, None) };
                    }
                    return Err(GpuError::ShaderModule(e.to_string()));
                }
            }
            entry_points.push(
                CString::new(stage.entry_point.as_str())
                    .unwrap_or_else(|_| CString::from(c"main")),
            );
        }

        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .zip(&modules)
            .zip(&entry_points)
            .map(|((stage, &module), name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(convert::shader_stage(stage.stage))
                    .module(module)
                    .name(name.as_c_str())
            })
            .collect();

        let bindings = [vk::VertexInputBindingDescription {
            binding: 0,
            stride: state.vertex_layout.stride,
            input_rate: vk::VertexInputRate::VERTEX,
        }];
        let attributes: Vec<vk::VertexInputAttributeDescription> = state
            .vertex_layout
            .attributes
            .iter()
            .map(|attr| vk::VertexInputAttributeDescription {
                location: attr.location,
                binding: 0,
                format: convert::vertex_format(attr.format),
                offset: attr.offset,
            })
            .collect();
        let vertex_input = if attributes.is_empty() {
            vk::PipelineVertexInputStateCreateInfo::default()
        } else {
            vk::PipelineVertexInputStateCreateInfo::default()
                .vertex_binding_descriptions(&bindings)
                .vertex_attribute_descriptions(&attributes)
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(convert::topology(state.topology));
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(convert::polygon_mode(state.raster.polygon_mode))
            .cull_mode(convert::cull_mode(state.raster.cull_mode))
            .front_face(convert::front_face(state.raster.front_face))
            .line_width(1.0);
        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let has_depth = state.depth_format.is_some();
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(has_depth && state.depth.test)
            .depth_write_enable(has_depth && state.depth.write)
            .depth_compare_op(convert::compare_op(state.depth.compare));
        let blend_attachments = [convert::blend_attachment(state.blend)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [convert::format(state.color_format)];
        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(
                state
                    .depth_format
                    .map_or(vk::Format::UNDEFINED, convert::format),
            );

        let info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stage_infos)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .push_next(&mut rendering);

        let result = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[info], None)
        };

        for module in modules {
            unsafe { self.device.destroy_shader_module(module, None) };
        }

        match result {
            Ok(pipelines) => pipelines
                .into_iter()
                .next()
                .ok_or_else(|| GpuError::Other("driver returned no pipeline".to_string())),
            Err((_, e)) => Err(e.into()),
        }
    }
}

/// Memory types valid for every image class the engine creates.
unsafe fn query_image_memory_types(device: &ash::Device, families: &[u32]) -> Result<u32> {
    let sharing_mode = if families.len() > 1 {
        vk::SharingMode::CONCURRENT
    } else {
        vk::SharingMode::EXCLUSIVE
    };
    let candidates = [
        (
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        ),
        (
            vk::Format::D32_SFLOAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ),
    ];
    let mut bits = u32::MAX;
    for (format, usage) in candidates {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: 16,
                height: 16,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(families);
        let image = unsafe { device.create_image(&info, None) }?;
        bits &= unsafe { device.get_image_memory_requirements(image) }.memory_type_bits;
        unsafe { device.destroy_image(image, None) };
    }
    if bits == 0 {
        return Err(GpuError::Other(
            "no memory type serves both color and depth images".to_string(),
        ));
    }
    Ok(bits)
}

impl GpuDevice for VulkanDevice {
    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn create_region(&self, desc: &RegionDesc) -> Result<RegionId> {
        if desc.size == 0 {
            return Err(GpuError::InvalidState("zero-sized region".to_string()));
        }
        let name = format!("{:?} region", desc.class);
        let location = if desc.class.host_visible() {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };

        let (buffer, requirements, linear) = match convert::buffer_usage(desc.class) {
            Some(usage) => {
                let families = self.sharing_families();
                let sharing_mode = if families.len() > 1 {
                    vk::SharingMode::CONCURRENT
                } else {
                    vk::SharingMode::EXCLUSIVE
                };
                let info = vk::BufferCreateInfo::default()
                    .size(desc.size)
                    .usage(usage)
                    .sharing_mode(sharing_mode)
                    .queue_family_indices(&families);
                let buffer = unsafe { self.device.create_buffer(&info, None) }?;
                let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
                (Some(buffer), requirements, true)
            }
            None => (
                None,
                vk::MemoryRequirements {
                    size: desc.size,
                    alignment: IMAGE_REGION_ALIGNMENT,
                    memory_type_bits: self.image_memory_type_bits,
                },
                false,
            ),
        };

        let allocation = {
            let mut allocator = self.allocator.lock();
            let allocator = allocator
                .as_mut()
                .ok_or_else(|| GpuError::InvalidState("allocator shut down".to_string()))?;
            allocator.allocate(&AllocationCreateDesc {
                name: &name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        };
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                if let Some(buffer) = buffer {
                    unsafe { self.device.destroy_buffer(buffer, None) };
                }
                return Err(allocation_error(e));
            }
        };

        if let Some(buffer) = buffer {
            let bound = unsafe {
                self.device
                    .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            };
            if let Err(e) = bound {
                self.free_region_entry(RegionEntry {
                    class: desc.class,
                    size: desc.size,
                    buffer: Some(buffer),
                    allocation,
                });
                return Err(e.into());
            }
        }

        let id = RegionId(self.next());
        self.resources.write().regions.insert(
            id,
            RegionEntry {
                class: desc.class,
                size: desc.size,
                buffer,
                allocation,
            },
        );
        tracing::debug!("Created {:?} region {} ({} bytes)", desc.class, id.0, desc.size);
        Ok(id)
    }

    fn destroy_region(&self, region: RegionId) {
        let entry = self.resources.write().regions.remove(&region);
        if let Some(entry) = entry {
            self.free_region_entry(entry);
        }
    }

    fn write_region(&self, region: RegionId, offset: u64, data: &[u8]) -> Result<()> {
        let mut resources = self.resources.write();
        let entry = resources
            .regions
            .get_mut(&region)
            .ok_or_else(|| not_found("region", region.raw()))?;
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|&end| end <= entry.size)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "write of {} bytes at {offset} exceeds region of {} bytes",
                    data.len(),
                    entry.size
                ))
            })?;
        let mapped = entry.allocation.mapped_slice_mut().ok_or_else(|| {
            GpuError::InvalidState(format!("{:?} region is not host visible", entry.class))
        })?;
        #[allow(clippy::cast_possible_truncation)]
        mapped[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn image_requirements(&self, desc: &ImageDesc) -> Result<MemoryRequirements> {
        let image = unsafe { self.create_vk_image(desc) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        unsafe { self.device.destroy_image(image, None) };
        if requirements.memory_type_bits & self.image_memory_type_bits == 0 {
            return Err(GpuError::InvalidState(format!(
                "{:?} images cannot live in image arenas",
                desc.format
            )));
        }
        Ok(MemoryRequirements {
            size: requirements.size,
            alignment: requirements.alignment,
        })
    }

    fn create_image(&self, desc: &ImageDesc, region: RegionId, offset: u64) -> Result<ImageId> {
        let image = unsafe { self.create_vk_image(desc) }?;
        let bound = {
            let resources = self.resources.read();
            match resources.regions.get(&region) {
                Some(entry) if entry.class == UsageClass::Image => unsafe {
                    self.device
                        .bind_image_memory(
                            image,
                            entry.allocation.memory(),
                            entry.allocation.offset() + offset,
                        )
                        .map_err(GpuError::from)
                },
                Some(entry) => Err(GpuError::InvalidState(format!(
                    "cannot bind an image to a {:?} region",
                    entry.class
                ))),
                None => Err(not_found("region", region.raw())),
            }
        };
        let view = bound.and_then(|()| unsafe { self.create_view(image, desc.format) });
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let id = ImageId(self.next());
        self.resources.write().images.insert(
            id,
            ImageEntry {
                image,
                view,
                format: desc.format,
                owned: true,
            },
        );
        Ok(id)
    }

    fn destroy_image(&self, image: ImageId) {
        let mut resources = self.resources.write();
        if resources.images.get(&image).is_some_and(|entry| entry.owned) {
            if let Some(entry) = resources.images.remove(&image) {
                unsafe {
                    self.device.destroy_image_view(entry.view, None);
                    self.device.destroy_image(entry.image, None);
                }
            }
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(convert::filter(desc.mag_filter))
            .min_filter(convert::filter(desc.min_filter))
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(convert::address_mode(desc.address_u))
            .address_mode_v(convert::address_mode(desc.address_v))
            .address_mode_w(convert::address_mode(desc.address_v))
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { self.device.create_sampler(&info, None) }?;
        let id = SamplerId(self.next());
        self.resources.write().samplers.insert(id, sampler);
        Ok(id)
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        if let Some(sampler) = self.resources.write().samplers.remove(&sampler) {
            unsafe { self.device.destroy_sampler(sampler, None) };
        }
    }

    fn create_set_layout(&self, desc: &SetLayoutDesc) -> Result<SetLayoutId> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = desc
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(convert::descriptor_type(b.kind))
                    .descriptor_count(b.count.max(1))
                    .stage_flags(convert::shader_stages(b.stages))
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&info, None) }?;
        let id = SetLayoutId(self.next());
        self.resources.write().set_layouts.insert(id, layout);
        Ok(id)
    }

    fn destroy_set_layout(&self, layout: SetLayoutId) {
        if let Some(layout) = self.resources.write().set_layouts.remove(&layout) {
            unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
        }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[SetLayoutId],
        push_constants: &[PushConstantRange],
    ) -> Result<PipelineLayoutId> {
        let layouts = {
            let resources = self.resources.read();
            set_layouts
                .iter()
                .map(|id| {
                    resources
                        .set_layouts
                        .get(id)
                        .copied()
                        .ok_or_else(|| not_found("set layout", id.raw()))
                })
                .collect::<Result<Vec<_>>>()?
        };
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: convert::shader_stages(r.stages),
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&layouts)
            .push_constant_ranges(&ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&info, None) }?;
        let id = PipelineLayoutId(self.next());
        self.resources.write().pipeline_layouts.insert(id, layout);
        Ok(id)
    }

    fn destroy_pipeline_layout(&self, layout: PipelineLayoutId) {
        if let Some(layout) = self.resources.write().pipeline_layouts.remove(&layout) {
            unsafe { self.device.destroy_pipeline_layout(layout, None) };
        }
    }

    fn create_graphics_pipeline(&self, desc: &GraphicsPipelineDesc<'_>) -> Result<RawPipelineId> {
        let pipeline = unsafe { self.build_pipeline(desc) }?;
        let id = RawPipelineId(self.next());
        self.resources.write().pipelines.insert(id, pipeline);
        Ok(id)
    }

    fn destroy_pipeline(&self, pipeline: RawPipelineId) {
        if let Some(pipeline) = self.resources.write().pipelines.remove(&pipeline) {
            unsafe { self.device.destroy_pipeline(pipeline, None) };
        }
    }

    fn allocate_descriptor_set(&self, layout: SetLayoutId) -> Result<DescriptorSetId> {
        let layout = self
            .resources
            .read()
            .set_layouts
            .get(&layout)
            .copied()
            .ok_or_else(|| not_found("set layout", layout.raw()))?;
        let layouts = [layout];

        let mut pools = self.descriptor_pools.lock();
        let mut attempt = pools.last().copied();
        let (set, pool) = loop {
            let pool = match attempt {
                Some(pool) => pool,
                None => {
                    let pool = self.create_descriptor_pool()?;
                    pools.push(pool);
                    tracing::debug!("Created descriptor pool #{}", pools.len());
                    pool
                }
            };
            let info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            match unsafe { self.device.allocate_descriptor_sets(&info) } {
                Ok(sets) => {
                    let set = sets.into_iter().next().ok_or_else(|| {
                        GpuError::Other("driver returned no descriptor set".to_string())
                    })?;
                    break (set, pool);
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL)
                    if attempt.is_some() =>
                {
                    attempt = None;
                }
                Err(e) => return Err(e.into()),
            }
        };
        drop(pools);

        let id = DescriptorSetId(self.next());
        self.resources
            .write()
            .descriptor_sets
            .insert(id, DescriptorSetEntry { set, pool });
        Ok(id)
    }

    fn update_descriptor_set(
        &self,
        set: DescriptorSetId,
        writes: &[DescriptorWrite],
    ) -> Result<()> {
        enum Info {
            Buffer(vk::DescriptorBufferInfo),
            Image(vk::DescriptorImageInfo),
        }

        let resources = self.resources.read();
        let target = resources.descriptor_set(set)?;
        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let (ty, info) = match write.resource {
                DescriptorResource::UniformBuffer(slice) | DescriptorResource::StorageBuffer(slice) => {
                    let ty = if matches!(write.resource, DescriptorResource::UniformBuffer(_)) {
                        vk::DescriptorType::UNIFORM_BUFFER
                    } else {
                        vk::DescriptorType::STORAGE_BUFFER
                    };
                    (
                        ty,
                        Info::Buffer(vk::DescriptorBufferInfo {
                            buffer: resources.buffer(slice.region)?,
                            offset: slice.offset,
                            range: slice.size,
                        }),
                    )
                }
                DescriptorResource::SampledImage(image) => (
                    vk::DescriptorType::SAMPLED_IMAGE,
                    Info::Image(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: resources.image(image)?.view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }),
                ),
                DescriptorResource::Sampler(sampler) => (
                    vk::DescriptorType::SAMPLER,
                    Info::Image(vk::DescriptorImageInfo {
                        sampler: resources.sampler(sampler)?,
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    }),
                ),
                DescriptorResource::CombinedImageSampler(image, sampler) => (
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    Info::Image(vk::DescriptorImageInfo {
                        sampler: resources.sampler(sampler)?,
                        image_view: resources.image(image)?.view,
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }),
                ),
            };
            infos.push((write.binding, ty, info));
        }

        let vk_writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .map(|(binding, ty, info)| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(target)
                    .dst_binding(*binding)
                    .descriptor_type(*ty);
                match info {
                    Info::Buffer(info) => write.buffer_info(std::slice::from_ref(info)),
                    Info::Image(info) => write.image_info(std::slice::from_ref(info)),
                }
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
        Ok(())
    }

    fn free_descriptor_set(&self, set: DescriptorSetId) {
        let entry = self.resources.write().descriptor_sets.remove(&set);
        if let Some(entry) = entry {
            let _pools = self.descriptor_pools.lock();
            if let Err(e) = unsafe { self.device.free_descriptor_sets(entry.pool, &[entry.set]) } {
                tracing::error!("Failed to free descriptor set: {e}");
            }
        }
    }

    fn create_command_buffer(
        &self,
        queue: QueueKind,
        level: CommandBufferLevel,
    ) -> Result<CommandBufferId> {
        let family = self.family(queue);
        let pool = self.command_pool(family)?.lock();
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(match level {
                CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
                CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
            })
            .command_buffer_count(1);
        let buffer = unsafe { self.device.allocate_command_buffers(&info) }?
            .into_iter()
            .next()
            .ok_or_else(|| GpuError::Other("driver returned no command buffer".to_string()))?;
        drop(pool);

        let id = CommandBufferId(self.next());
        self.resources
            .write()
            .command_buffers
            .insert(id, CommandBufferEntry { buffer, family });
        Ok(id)
    }

    fn free_command_buffer(&self, cmd: CommandBufferId) {
        let entry = self.resources.write().command_buffers.remove(&cmd);
        if let Some(entry) = entry {
            if let Ok(pool) = self.command_pool(entry.family) {
                let pool = pool.lock();
                unsafe { self.device.free_command_buffers(*pool, &[entry.buffer]) };
            }
        }
    }

    fn encode(&self, cmd: CommandBufferId, commands: &CommandList) -> Result<()> {
        let resources = self.resources.read();
        let entry = resources
            .command_buffers
            .get(&cmd)
            .ok_or_else(|| not_found("command buffer", cmd.raw()))?;
        let buffer = entry.buffer;

        // Command buffers of one pool share its external synchronization
        let _pool = self.command_pool(entry.family)?.lock();
        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?;
            let inheritance = vk::CommandBufferInheritanceInfo::default();
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
                .inheritance_info(&inheritance);
            self.device.begin_command_buffer(buffer, &begin_info)?;
            let recorded = encode::record(&self.device, &resources, buffer, commands);
            let ended = self.device.end_command_buffer(buffer).map_err(GpuError::from);
            recorded.and(ended)
        }
    }

    fn submit(&self, queue: QueueKind, submission: &Submission) -> Result<()> {
        let resources = self.resources.read();
        let command_buffers = submission
            .command_buffers
            .iter()
            .map(|&cmd| {
                resources
                    .command_buffer(cmd)
                    .map(|buffer| vk::CommandBufferSubmitInfo::default().command_buffer(buffer))
            })
            .collect::<Result<Vec<_>>>()?;
        let waits = submission
            .wait
            .iter()
            .map(|wait| {
                resources.semaphore(wait.semaphore).map(|semaphore| {
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(semaphore)
                        .stage_mask(convert::pipeline_stage(wait.stage))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let signals = submission
            .signal
            .iter()
            .map(|&semaphore| {
                resources.semaphore(semaphore).map(|semaphore| {
                    vk::SemaphoreSubmitInfo::default()
                        .semaphore(semaphore)
                        .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let fence = match submission.fence {
            Some(fence) => resources.fence(fence)?,
            None => vk::Fence::null(),
        };

        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&signals);
        let queue = self.queue(queue)?.lock();
        unsafe { self.device.queue_submit2(*queue, &[submit_info], fence) }?;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> Result<FenceId> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }?;
        let id = FenceId(self.next());
        self.resources.write().fences.insert(id, fence);
        Ok(id)
    }

    fn destroy_fence(&self, fence: FenceId) {
        if let Some(fence) = self.resources.write().fences.remove(&fence) {
            unsafe { self.device.destroy_fence(fence, None) };
        }
    }

    fn wait_fence(&self, fence: FenceId, timeout_ns: u64) -> Result<bool> {
        let fence = self.resources.read().fence(fence)?;
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: FenceId) -> Result<()> {
        let fence = self.resources.read().fence(fence)?;
        unsafe { self.device.reset_fences(&[fence]) }?;
        Ok(())
    }

    fn create_semaphore(&self) -> Result<SemaphoreId> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }?;
        let id = SemaphoreId(self.next());
        self.resources.write().semaphores.insert(id, semaphore);
        Ok(id)
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreId) {
        if let Some(semaphore) = self.resources.write().semaphores.remove(&semaphore) {
            unsafe { self.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<SwapchainInfo> {
        let surface = vk::SurfaceKHR::from_raw(desc.surface.raw());
        let old = match desc.old {
            Some(old) => Some(
                self.resources
                    .read()
                    .swapchains
                    .get(&old)
                    .map(|entry| entry.state.swapchain)
                    .ok_or_else(|| not_found("swapchain", old.raw()))?,
            ),
            None => None,
        };
        let mut families = vec![self.plan.graphics];
        if let Some(present) = self.plan.present {
            families.push(present);
        }

        let state = unsafe {
            SwapchainState::new(
                &self.device,
                &self.instance.surface_loader,
                &self.swapchain_loader,
                self.physical_device,
                &SurfaceParams {
                    surface,
                    extent: desc.extent,
                    vsync: desc.vsync,
                    old,
                    queue_families: &families,
                },
            )
        }?;

        let id = SwapchainId(self.next());
        let mut resources = self.resources.write();
        let images: Vec<ImageId> = state
            .images
            .iter()
            .zip(&state.views)
            .map(|(&image, &view)| {
                let image_id = ImageId(self.next());
                resources.images.insert(
                    image_id,
                    ImageEntry {
                        image,
                        view,
                        format: state.format,
                        owned: false,
                    },
                );
                image_id
            })
            .collect();
        let info = SwapchainInfo {
            id,
            format: state.format,
            extent: state.extent,
            images: images.clone(),
        };
        resources
            .swapchains
            .insert(id, SwapchainEntry { state, images });
        tracing::info!(
            "Swapchain {} created at {}x{}",
            id.0,
            info.extent.width,
            info.extent.height
        );
        Ok(info)
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) {
        let mut resources = self.resources.write();
        if let Some(entry) = resources.swapchains.remove(&swapchain) {
            for image in &entry.images {
                resources.images.remove(image);
            }
            unsafe { entry.state.destroy(&self.device, &self.swapchain_loader) };
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainId,
        signal: SemaphoreId,
        timeout_ns: u64,
    ) -> Result<AcquiredImage> {
        let (swapchain, semaphore) = {
            let resources = self.resources.read();
            let swapchain = resources
                .swapchains
                .get(&swapchain)
                .map(|entry| entry.state.swapchain)
                .ok_or_else(|| not_found("swapchain", swapchain.raw()))?;
            (swapchain, resources.semaphore(signal)?)
        };
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                timeout_ns,
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage { index, suboptimal }),
            Err(vk::Result::NOT_READY) => Err(GpuError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    fn present(
        &self,
        swapchain: SwapchainId,
        image_index: u32,
        wait: &[SemaphoreId],
    ) -> Result<bool> {
        let (swapchain, wait_semaphores) = {
            let resources = self.resources.read();
            let swapchain = resources
                .swapchains
                .get(&swapchain)
                .map(|entry| entry.state.swapchain)
                .ok_or_else(|| not_found("swapchain", swapchain.raw()))?;
            let waits = wait
                .iter()
                .map(|&s| resources.semaphore(s))
                .collect::<Result<Vec<_>>>()?;
            (swapchain, waits)
        };
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = self.queue(QueueKind::Present)?.lock();
        match unsafe { self.swapchain_loader.queue_present(*queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            let resources = std::mem::take(self.resources.get_mut());
            for (_, entry) in resources.swapchains {
                entry.state.destroy(&self.device, &self.swapchain_loader);
            }
            for (_, entry) in resources.images {
                if entry.owned {
                    self.device.destroy_image_view(entry.view, None);
                    self.device.destroy_image(entry.image, None);
                }
            }
            for (_, entry) in resources.regions {
                self.free_region_entry(entry);
            }
            for (_, sampler) in resources.samplers {
                self.device.destroy_sampler(sampler, None);
            }
            for (_, pipeline) in resources.pipelines {
                self.device.destroy_pipeline(pipeline, None);
            }
            for (_, layout) in resources.pipeline_layouts {
                self.device.destroy_pipeline_layout(layout, None);
            }
            for (_, layout) in resources.set_layouts {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
            // Sets are released with their pools
            for pool in self.descriptor_pools.get_mut().drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            for (_, pool) in &self.command_pools {
                self.device.destroy_command_pool(*pool.lock(), None);
            }
            for (_, fence) in resources.fences {
                self.device.destroy_fence(fence, None);
            }
            for (_, semaphore) in resources.semaphores {
                self.device.destroy_semaphore(semaphore, None);
            }

            // Free every VkDeviceMemory before the device goes away
            drop(self.allocator.lock().take());
            self.device.destroy_device(None);
        }
    }
}
