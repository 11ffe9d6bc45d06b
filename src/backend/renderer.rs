// Renderer - staged setup and the per-frame entry point
//
// Setup order is enforced by data: each stage needs the previous stage's
// output.
//   VulkanDevice -> Swapchain -> RenderPipeline -> Framebuffers
//     -> CommandRecorder -> SyncObjects
// Fields are declared in reverse creation order, so the default drop order
// tears everything down in reverse.

use super::command::{CommandRecorder, RecordTarget};
use super::frame::{FrameBackend, FrameOutcome, FrameSynchronizer};
use super::pipeline::{Framebuffers, RenderPipeline, ShaderPaths};
use super::swapchain::{AcquiredImage, Swapchain};
use super::sync::SyncObjects;
use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-run renderer settings
#[derive(Clone, Debug)]
pub struct RendererSettings {
    pub preferred_present_mode: vk::PresentModeKHR,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

/// A window with no area cannot back a swapchain
pub fn is_drawable(framebuffer_size: vk::Extent2D) -> bool {
    framebuffer_size.width > 0 && framebuffer_size.height > 0
}

/// Deferred swapchain rebuild.
///
/// A stale outcome only marks the rebuild; it happens at the start of the
/// next tick whose framebuffer has area. Until then ticks are skipped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecreateState {
    pending: bool,
}

impl RecreateState {
    pub fn mark_stale(&mut self, outcome: FrameOutcome) {
        if outcome.needs_recreation() {
            self.pending = true;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// True when the pending rebuild can run at this size
    pub fn ready(&self, framebuffer_size: vk::Extent2D) -> bool {
        self.pending && is_drawable(framebuffer_size)
    }

    pub fn clear(&mut self) {
        self.pending = false;
    }
}

/// Everything that depends on the swapchain, rebuilt together
struct PresentChain {
    commands: CommandRecorder,
    _framebuffers: Framebuffers,
    _pipeline: RenderPipeline,
    swapchain: Swapchain,
}

impl PresentChain {
    fn new(
        device: &Arc<VulkanDevice>,
        framebuffer_size: vk::Extent2D,
        settings: &RendererSettings,
    ) -> Result<Self> {
        let swapchain = Swapchain::new(
            device.clone(),
            framebuffer_size,
            settings.preferred_present_mode,
        )?;

        let shaders = ShaderPaths {
            vertex: &settings.vertex_shader,
            fragment: &settings.fragment_shader,
        };
        let pipeline = RenderPipeline::new(
            device.clone(),
            swapchain.config.surface_format.format,
            &shaders,
        )?;

        let framebuffers = Framebuffers::new(
            device.clone(),
            swapchain.images.views(),
            pipeline.render_pass,
            swapchain.config.extent,
        )?;

        let commands = CommandRecorder::new(
            device.clone(),
            framebuffers.handles(),
            RecordTarget {
                render_pass: pipeline.render_pass,
                pipeline: pipeline.pipeline,
                extent: swapchain.config.extent,
            },
        )?;

        debug_assert_eq!(commands.len(), swapchain.images.len());
        debug_assert_eq!(swapchain.images.views().len(), swapchain.images.images().len());

        Ok(Self {
            commands,
            _framebuffers: framebuffers,
            _pipeline: pipeline,
            swapchain,
        })
    }
}

/// Frame protocol calls issued against the real queues
struct VulkanFrameBackend<'a> {
    device: &'a VulkanDevice,
    chain: &'a PresentChain,
    wait_stages: [vk::PipelineStageFlags; 1],
}

impl FrameBackend for VulkanFrameBackend<'_> {
    fn wait_for_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.wait_for_fences(&[fence], true, u64::MAX) }
            .context("Failed to wait for fence")?;
        Ok(())
    }

    fn reset_fence(&mut self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[fence]) }.context("Failed to reset fence")?;
        Ok(())
    }

    fn acquire_next_image(&mut self, image_available: vk::Semaphore) -> Result<AcquiredImage> {
        self.chain.swapchain.acquire_next_image(image_available)
    }

    fn submit(
        &mut self,
        image_index: u32,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<()> {
        let wait_semaphores = [wait];
        let signal_semaphores = [signal];
        let command_buffers = [self.chain.commands.buffer(image_index)?];

        // Only color output waits for the image; earlier stages run ahead
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .device
                .queue_submit(self.device.graphics_queue, &[submit_info], fence)
        }
        .context("vkQueueSubmit failed")?;
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<bool> {
        self.chain
            .swapchain
            .present(self.device.present_queue, image_index, &[wait])
    }
}

pub struct Renderer {
    synchronizer: FrameSynchronizer,
    // Owns the semaphores and fences the synchronizer's slots refer to
    _sync_objects: SyncObjects,
    chain: Option<PresentChain>,
    settings: RendererSettings,
    recreate: RecreateState,
    frames_presented: u64,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(
        device: Arc<VulkanDevice>,
        framebuffer_size: vk::Extent2D,
        settings: RendererSettings,
    ) -> Result<Self> {
        let chain = PresentChain::new(&device, framebuffer_size, &settings)?;
        let sync_objects = SyncObjects::new(device.clone())?;
        let synchronizer = FrameSynchronizer::new(sync_objects.slots(), chain.swapchain.images.len());

        log::info!("Renderer ready on {}", device.adapter_name);

        Ok(Self {
            synchronizer,
            _sync_objects: sync_objects,
            chain: Some(chain),
            settings,
            recreate: RecreateState::default(),
            frames_presented: 0,
            device,
        })
    }

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    /// Render one frame. Returns false when nothing was presented (minimized
    /// window or stale swapchain).
    ///
    /// `framebuffer_size` is the window's current size in pixels; it is only
    /// used when the swapchain has to be rebuilt.
    pub fn draw_frame(&mut self, framebuffer_size: vk::Extent2D) -> Result<bool> {
        if self.recreate.is_pending() {
            if !self.recreate.ready(framebuffer_size) {
                return Ok(false);
            }
            self.recreate_swapchain(framebuffer_size)?;
        }

        let chain = self.chain.as_ref().context("Swapchain not initialized")?;
        let mut backend = VulkanFrameBackend {
            device: &self.device,
            chain,
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
        };

        let outcome = self.synchronizer.draw_frame(&mut backend)?;
        if outcome.needs_recreation() {
            log::debug!("Swapchain needs recreation ({:?})", outcome);
        }
        self.recreate.mark_stale(outcome);

        let presented = outcome != FrameOutcome::OutOfDate;
        if presented {
            self.frames_presented += 1;
        }
        Ok(presented)
    }

    /// Rebuild swapchain, pipeline, framebuffers and command buffers.
    /// Frame slots are kept.
    fn recreate_swapchain(&mut self, framebuffer_size: vk::Extent2D) -> Result<()> {
        log::info!(
            "Recreating swapchain for {}x{}",
            framebuffer_size.width,
            framebuffer_size.height
        );

        // Wait for GPU to finish all work before destroying resources
        self.device.wait_idle()?;

        // Old swapchain goes before the new one is created
        self.chain = None;
        let chain = PresentChain::new(&self.device, framebuffer_size, &self.settings)
            .context("Failed to recreate swapchain")?;

        self.synchronizer
            .reset_image_fences(chain.swapchain.images.len());
        log::debug!(
            "Tracking {} swapchain images, resuming at frame slot {}",
            self.synchronizer.image_fences().len(),
            self.synchronizer.frame_index()
        );
        self.chain = Some(chain);
        self.recreate.clear();

        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!(
            "Cleaning up renderer after {} presented frames...",
            self.frames_presented
        );
        // Nothing may be in flight when fields start dropping
        let _ = self.device.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn size(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn zero_area_is_not_drawable() {
        assert!(!is_drawable(size(0, 0)));
        assert!(!is_drawable(size(800, 0)));
        assert!(!is_drawable(size(0, 600)));
        assert!(is_drawable(size(1, 1)));
    }

    #[test]
    fn presented_frames_never_schedule_a_rebuild() {
        let mut state = RecreateState::default();
        for _ in 0..5 {
            state.mark_stale(FrameOutcome::Presented);
        }
        assert!(!state.is_pending());
        assert!(!state.ready(size(800, 600)));
    }

    #[test]
    fn minimized_window_postpones_rebuild() {
        let mut state = RecreateState::default();
        state.mark_stale(FrameOutcome::OutOfDate);

        // Ticks are skipped while minimized and the rebuild stays pending
        for _ in 0..3 {
            assert!(!state.ready(size(0, 0)));
            assert!(state.is_pending());
        }

        // Restored: the next tick rebuilds
        assert!(state.ready(size(1024, 768)));
        state.clear();
        assert!(!state.is_pending());
    }

    #[test]
    fn suboptimal_frame_schedules_rebuild() {
        let mut state = RecreateState::default();
        state.mark_stale(FrameOutcome::Suboptimal);
        // A later good frame does not cancel it
        state.mark_stale(FrameOutcome::Presented);
        assert!(state.ready(size(640, 480)));
    }
}
