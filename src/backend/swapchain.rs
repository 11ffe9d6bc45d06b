// Swapchain - Window presentation
//
// Negotiates format, present mode, extent and image count with the surface,
// then owns the chain of presentable images and their views.

use super::device::{QueueFamilyIndices, SurfaceSupport};
use super::error::BackendError;
use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

/// Surface `current_extent` value meaning "the window decides"
pub const EXTENT_MATCHES_WINDOW: u32 = u32::MAX;

/// Prefer 8-bit BGRA in the standard non-linear sRGB space, else whatever the
/// surface lists first.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    available
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first().copied())
}

/// Pick the preferred mode if offered, then MAILBOX, then FIFO.
///
/// MAILBOX: No vsync, no tearing, lowest latency without tearing
/// IMMEDIATE: No vsync, may tear
/// FIFO: Vsync, the only mode every surface must support
pub fn select_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else if preferred != vk::PresentModeKHR::FIFO
        && available.contains(&vk::PresentModeKHR::MAILBOX)
    {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's fixed extent, or the window's framebuffer size clamped to
/// the surface bounds when the surface defers to the window.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    framebuffer_size: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != EXTENT_MATCHES_WINDOW {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: framebuffer_size.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: framebuffer_size.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum so acquire never waits on the driver, capped by
/// the maximum unless it is 0 (unbounded).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}

/// Sharing setup for the swapchain images.
///
/// Split graphics/present families need CONCURRENT access; exclusive
/// ownership touched from a second family without a transfer is undefined.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSharing {
    pub mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
}

impl ImageSharing {
    pub fn for_families(families: &QueueFamilyIndices) -> Self {
        match (families.graphics_family, families.present_family) {
            (Some(graphics), Some(present)) if graphics != present => Self {
                mode: vk::SharingMode::CONCURRENT,
                queue_family_indices: vec![graphics, present],
            },
            _ => Self {
                mode: vk::SharingMode::EXCLUSIVE,
                queue_family_indices: Vec::new(),
            },
        }
    }
}

/// Negotiated swapchain parameters. Recomputed on every (re)creation.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainConfiguration {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainConfiguration {
    pub fn negotiate(
        support: &SurfaceSupport,
        framebuffer_size: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let surface_format =
            select_surface_format(&support.formats).context("Surface reports no formats")?;

        Ok(Self {
            surface_format,
            present_mode: select_present_mode(&support.present_modes, preferred_present_mode),
            extent: choose_extent(&support.capabilities, framebuffer_size),
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        })
    }
}

/// Presentable images (owned by the swapchain) and their views (owned here).
///
/// Views are created one per image, in order, so the two always line up.
#[derive(Default)]
pub struct SwapchainImageSet {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl SwapchainImageSet {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }
}

/// Result of asking the swapchain for the next image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquiredImage {
    Ready { index: u32, suboptimal: bool },
    OutOfDate,
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub config: SwapchainConfiguration,
    pub images: SwapchainImageSet,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        framebuffer_size: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let support =
            SurfaceSupport::query(&device.surface_loader, device.physical_device, device.surface)?;
        let config =
            SwapchainConfiguration::negotiate(&support, framebuffer_size, preferred_present_mode)?;

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}/{:?}, {:?}",
            config.extent.width,
            config.extent.height,
            config.image_count,
            config.surface_format.format,
            config.surface_format.color_space,
            config.present_mode
        );

        let sharing = ImageSharing::for_families(&device.queue_families);
        log::debug!("Swapchain image sharing: {:?}", sharing);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.surface)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing.mode)
            .queue_family_indices(&sharing.queue_family_indices)
            .pre_transform(config.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true);

        let handle = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // From here on Drop cleans up whatever has been created so far
        let mut swapchain = Self {
            handle,
            config,
            images: SwapchainImageSet::default(),
            device,
        };
        swapchain.create_image_set()?;

        log::info!("Created swapchain with {} images", swapchain.images.len());

        Ok(swapchain)
    }

    fn create_image_set(&mut self) -> Result<()> {
        let images = unsafe { self.device.swapchain_loader.get_swapchain_images(self.handle) }
            .context("Failed to get swapchain images")?;

        self.images.views.reserve(images.len());
        for &image in &images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.config.surface_format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            let view = unsafe { self.device.device.create_image_view(&create_info, None) }
                .context("Failed to create image view")?;
            self.images.views.push(view);
        }
        self.images.images = images;

        // The driver may hand back more images than requested, never fewer
        self.config.image_count = self.images.len() as u32;
        Ok(())
    }

    /// Request the next image. The index is returned immediately but the image
    /// is only renderable once `image_available` signals.
    pub fn acquire_next_image(&self, image_available: vk::Semaphore) -> Result<AcquiredImage> {
        let result = unsafe {
            self.device.swapchain_loader.acquire_next_image(
                self.handle,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquiredImage::OutOfDate),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                Err(BackendError::SurfaceLost(vk::Result::ERROR_SURFACE_LOST_KHR).into())
            }
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Queue `image_index` for presentation once `wait_semaphores` signal.
    ///
    /// Returns true when the swapchain no longer matches the surface.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                Err(BackendError::SurfaceLost(vk::Result::ERROR_SURFACE_LOST_KHR).into())
            }
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // Views first; the images themselves belong to the swapchain
        unsafe {
            for &view in &self.images.views {
                self.device.device.destroy_image_view(view, None);
            }
            self.device.swapchain_loader.destroy_swapchain(self.handle, None);
        }
    }
}
