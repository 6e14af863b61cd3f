//! Records a [`CommandList`] into a Vulkan command buffer.

use super::convert;
use super::device::{ImageEntry, Resources};
use crate::command::{Command, CommandList, RenderingInfo};
use crate::error::Result;
use crate::types::Extent2D;
use ash::vk;

struct Transition {
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_stage: vk::PipelineStageFlags2,
    src_access: vk::AccessFlags2,
    dst_stage: vk::PipelineStageFlags2,
    dst_access: vk::AccessFlags2,
}

unsafe fn transition(device: &ash::Device, cmd: vk::CommandBuffer, image: &ImageEntry, t: &Transition) {
    let barrier = vk::ImageMemoryBarrier2::default()
        .src_stage_mask(t.src_stage)
        .src_access_mask(t.src_access)
        .dst_stage_mask(t.dst_stage)
        .dst_access_mask(t.dst_access)
        .old_layout(t.old_layout)
        .new_layout(t.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image.image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(convert::aspect(image.format))
                .level_count(1)
                .layer_count(1),
        );
    let barriers = [barrier];
    let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
    unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
}

const fn rect(extent: Extent2D) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: vk::Extent2D {
            width: extent.width,
            height: extent.height,
        },
    }
}

unsafe fn begin_rendering(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    resources: &Resources,
    info: &RenderingInfo,
) -> Result<()> {
    let color = resources.image(info.color)?;
    unsafe {
        transition(
            device,
            cmd,
            color,
            &Transition {
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                src_access: vk::AccessFlags2::NONE,
                dst_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                dst_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
            },
        );
    }

    let color_attachments = [vk::RenderingAttachmentInfo::default()
        .image_view(color.view)
        .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .clear_value(vk::ClearValue {
            color: vk::ClearColorValue {
                float32: info.clear_color,
            },
        })];

    let depth_attachment = match info.depth {
        Some(depth) => {
            let image = resources.image(depth.image)?;
            let depth_stages = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
            unsafe {
                transition(
                    device,
                    cmd,
                    image,
                    &Transition {
                        old_layout: vk::ImageLayout::UNDEFINED,
                        new_layout: vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL,
                        src_stage: depth_stages,
                        src_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
                        dst_stage: depth_stages,
                        dst_access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
                            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
                    },
                );
            }
            Some(
                vk::RenderingAttachmentInfo::default()
                    .image_view(image.view)
                    .image_layout(vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth: depth.clear_depth,
                            stencil: 0,
                        },
                    }),
            )
        }
        None => None,
    };

    let mut rendering = vk::RenderingInfo::default()
        .render_area(rect(info.extent))
        .layer_count(1)
        .color_attachments(&color_attachments);
    if let Some(depth) = depth_attachment.as_ref() {
        rendering = rendering.depth_attachment(depth);
    }
    unsafe { device.cmd_begin_rendering(cmd, &rendering) };
    Ok(())
}

/// Record `commands` into `cmd`, which must be in the recording state.
///
/// # Safety
/// `cmd` must belong to `device` and be externally synchronized.
pub unsafe fn record(
    device: &ash::Device,
    resources: &Resources,
    cmd: vk::CommandBuffer,
    commands: &CommandList,
) -> Result<()> {
    for command in commands.commands() {
        match command {
            Command::BeginRendering(info) => unsafe {
                begin_rendering(device, cmd, resources, info)?;
            },
            Command::EndRendering => unsafe { device.cmd_end_rendering(cmd) },
            Command::SetViewport(extent) => {
                #[allow(clippy::cast_precision_loss)]
                let (width, height) = (extent.width as f32, extent.height as f32);
                // Flip Y so clip space matches the engine's right-handed convention
                let viewport = vk::Viewport {
                    x: 0.0,
                    y: height,
                    width,
                    height: -height,
                    min_depth: 0.0,
                    max_depth: 1.0,
                };
                unsafe {
                    device.cmd_set_viewport(cmd, 0, &[viewport]);
                    device.cmd_set_scissor(cmd, 0, &[rect(*extent)]);
                }
            }
            Command::BindPipeline { pipeline } => {
                let pipeline = resources.pipeline(*pipeline)?;
                unsafe {
                    device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
                }
            }
            Command::BindDescriptorSet { layout, index, set } => {
                let layout = resources.pipeline_layout(*layout)?;
                let set = resources.descriptor_set(*set)?;
                unsafe {
                    device.cmd_bind_descriptor_sets(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        layout,
                        *index,
                        &[set],
                        &[],
                    );
                }
            }
            Command::PushConstants {
                layout,
                stages,
                offset,
                data,
            } => {
                let layout = resources.pipeline_layout(*layout)?;
                unsafe {
                    device.cmd_push_constants(
                        cmd,
                        layout,
                        convert::shader_stages(*stages),
                        *offset,
                        data,
                    );
                }
            }
            Command::BindVertexBuffer(slice) => {
                let buffer = resources.buffer(slice.region)?;
                unsafe { device.cmd_bind_vertex_buffers(cmd, 0, &[buffer], &[slice.offset]) };
            }
            Command::BindIndexBuffer(slice) => {
                let buffer = resources.buffer(slice.region)?;
                unsafe {
                    device.cmd_bind_index_buffer(cmd, buffer, slice.offset, vk::IndexType::UINT32);
                }
            }
            Command::DrawIndexed {
                index_count,
                first_index,
                vertex_offset,
            } => unsafe {
                device.cmd_draw_indexed(cmd, *index_count, 1, *first_index, *vertex_offset, 0);
            },
            Command::Draw {
                vertex_count,
                first_vertex,
            } => unsafe { device.cmd_draw(cmd, *vertex_count, 1, *first_vertex, 0) },
            Command::CopyBuffer { src, dst } => {
                let region = vk::BufferCopy {
                    src_offset: src.offset,
                    dst_offset: dst.offset,
                    size: src.size.min(dst.size),
                };
                let (src, dst) = (resources.buffer(src.region)?, resources.buffer(dst.region)?);
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &[region]) };
            }
            Command::CopyBufferToImage { src, image, extent } => {
                let buffer = resources.buffer(src.region)?;
                let image = resources.image(*image)?;
                let copy = vk::BufferImageCopy::default()
                    .buffer_offset(src.offset)
                    .image_subresource(
                        vk::ImageSubresourceLayers::default()
                            .aspect_mask(vk::ImageAspectFlags::COLOR)
                            .layer_count(1),
                    )
                    .image_extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    });
                unsafe {
                    transition(
                        device,
                        cmd,
                        image,
                        &Transition {
                            old_layout: vk::ImageLayout::UNDEFINED,
                            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            src_stage: vk::PipelineStageFlags2::NONE,
                            src_access: vk::AccessFlags2::NONE,
                            dst_stage: vk::PipelineStageFlags2::TRANSFER,
                            dst_access: vk::AccessFlags2::TRANSFER_WRITE,
                        },
                    );
                    device.cmd_copy_buffer_to_image(
                        cmd,
                        buffer,
                        image.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[copy],
                    );
                    // Consumers on other queues synchronize through the upload fence
                    transition(
                        device,
                        cmd,
                        image,
                        &Transition {
                            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                            src_stage: vk::PipelineStageFlags2::TRANSFER,
                            src_access: vk::AccessFlags2::TRANSFER_WRITE,
                            dst_stage: vk::PipelineStageFlags2::NONE,
                            dst_access: vk::AccessFlags2::NONE,
                        },
                    );
                }
            }
            Command::ExecuteSecondary(secondary) => {
                let secondary = resources.command_buffer(*secondary)?;
                unsafe { device.cmd_execute_commands(cmd, &[secondary]) };
            }
            Command::PrepareForPresent(image) => {
                let image = resources.image(*image)?;
                unsafe {
                    transition(
                        device,
                        cmd,
                        image,
                        &Transition {
                            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                            src_stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                            src_access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
                            dst_stage: vk::PipelineStageFlags2::NONE,
                            dst_access: vk::AccessFlags2::NONE,
                        },
                    );
                }
            }
        }
    }
    Ok(())
}
