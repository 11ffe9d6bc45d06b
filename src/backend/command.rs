// Command recording
//
// One primary command buffer per swapchain image, recorded once after the
// swapchain is built and resubmitted unchanged every frame that image is
// acquired.

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Opaque black
pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

/// What a pre-recorded buffer draws into
#[derive(Clone, Copy, Debug)]
pub struct RecordTarget {
    pub render_pass: vk::RenderPass,
    pub pipeline: vk::Pipeline,
    pub extent: vk::Extent2D,
}

pub struct CommandRecorder {
    pool: vk::CommandPool,
    buffers: Vec<vk::CommandBuffer>,
    device: Arc<VulkanDevice>,
}

impl CommandRecorder {
    pub fn new(
        device: Arc<VulkanDevice>,
        framebuffers: &[vk::Framebuffer],
        target: RecordTarget,
    ) -> Result<Self> {
        let graphics_family = device
            .queue_families
            .graphics_family
            .context("Graphics queue family not resolved")?;

        let pool_info = vk::CommandPoolCreateInfo::default().queue_family_index(graphics_family);
        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        // Destroying the pool frees the buffers too, so Drop covers every exit below
        let mut recorder = Self {
            pool,
            buffers: Vec::new(),
            device,
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(recorder.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(framebuffers.len() as u32);

        recorder.buffers = unsafe { recorder.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")?;

        for (&cmd, &framebuffer) in recorder.buffers.iter().zip(framebuffers) {
            record_triangle(&recorder.device.device, cmd, framebuffer, &target)?;
        }

        log::info!("Created {} pre-recorded command buffers", recorder.buffers.len());
        Ok(recorder)
    }

    /// Buffer recorded for swapchain image `image_index`
    pub fn buffer(&self, image_index: u32) -> Result<vk::CommandBuffer> {
        self.buffers
            .get(image_index as usize)
            .copied()
            .with_context(|| format!("No command buffer for swapchain image {}", image_index))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}

impl Drop for CommandRecorder {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}

/// begin -> render pass (clear) -> bind pipeline -> viewport/scissor -> draw 3 -> end
fn record_triangle(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    framebuffer: vk::Framebuffer,
    target: &RecordTarget,
) -> Result<()> {
    let render_area = vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: target.extent,
    };
    let clear_values = [vk::ClearValue {
        color: vk::ClearColorValue {
            float32: CLEAR_COLOR,
        },
    }];
    let viewport = vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: target.extent.width as f32,
        height: target.extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    };

    unsafe {
        let begin_info = vk::CommandBufferBeginInfo::default();
        device
            .begin_command_buffer(cmd, &begin_info)
            .context("Failed to begin recording command buffer")?;

        let render_pass_info = vk::RenderPassBeginInfo::default()
            .render_pass(target.render_pass)
            .framebuffer(framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);

        device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, target.pipeline);
        device.cmd_set_viewport(cmd, 0, &[viewport]);
        device.cmd_set_scissor(cmd, 0, &[render_area]);
        device.cmd_draw(cmd, 3, 1, 0, 0);
        device.cmd_end_render_pass(cmd);

        device
            .end_command_buffer(cmd)
            .context("Failed to record command buffer")?;
    }

    Ok(())
}
