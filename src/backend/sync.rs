// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync.
// One FrameSlot per frame in flight, created once and kept across swapchain
// recreation.

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Frames the CPU may record ahead of GPU completion
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Frame synchronization - one per frame in flight
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameSlot {
    /// Signaled by acquire once the image can be rendered to
    pub image_available: vk::Semaphore,
    /// Signaled by the graphics submit, waited on by present
    pub render_finished: vk::Semaphore,
    /// Signaled when the GPU finishes the slot's submit
    pub in_flight_fence: vk::Fence,
}

impl FrameSlot {
    /// Create the slot's objects in place, so a failure part way through
    /// still leaves every created handle recorded for destruction.
    fn create(&mut self, device: &ash::Device) -> Result<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Start signaled so the first wait on a fresh slot returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            self.image_available = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            self.render_finished = device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create render-finished semaphore")?;
            self.in_flight_fence = device
                .create_fence(&fence_info, None)
                .context("Failed to create in-flight fence")?;
        }
        Ok(())
    }

    fn destroy(&self, device: &ash::Device) {
        // Null handles are ignored by the destroy calls
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
        }
    }
}

/// Owner of every FrameSlot's Vulkan objects
pub struct SyncObjects {
    slots: [FrameSlot; MAX_FRAMES_IN_FLIGHT],
    device: Arc<VulkanDevice>,
}

impl SyncObjects {
    pub fn new(device: Arc<VulkanDevice>) -> Result<Self> {
        let mut objects = Self {
            slots: [FrameSlot::default(); MAX_FRAMES_IN_FLIGHT],
            device,
        };
        for (i, slot) in objects.slots.iter_mut().enumerate() {
            slot.create(&objects.device.device)
                .with_context(|| format!("Failed to create sync objects for frame slot {}", i))?;
        }

        log::debug!("Created {} frame slots", MAX_FRAMES_IN_FLIGHT);
        Ok(objects)
    }

    pub fn slots(&self) -> [FrameSlot; MAX_FRAMES_IN_FLIGHT] {
        self.slots
    }
}

impl Drop for SyncObjects {
    fn drop(&mut self) {
        for slot in &self.slots {
            slot.destroy(&self.device.device);
        }
    }
}
