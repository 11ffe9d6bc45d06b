// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation with optional validation layers
// - Surface creation from the platform window
// - Physical device selection (first adapter that satisfies every requirement)
// - Logical device + graphics/present queue creation

use super::error::BackendError;
use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{c_void, CStr, CString};
use std::sync::Arc;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Validation severities forwarded to the log
const MESSENGER_SEVERITY: vk::DebugUtilsMessageSeverityFlagsEXT =
    vk::DebugUtilsMessageSeverityFlagsEXT::from_raw(
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING.as_raw()
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR.as_raw(),
    );

/// Device extensions every adapter must expose
pub const REQUIRED_DEVICE_EXTENSIONS: &[&CStr] = &[ash::khr::swapchain::NAME];

/// Queue family indices for the two queue roles the renderer needs.
///
/// Both roles may resolve to the same family.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics_family: Option<u32>,
    pub present_family: Option<u32>,
}

impl QueueFamilyIndices {
    /// Scan queue families in order, stopping as soon as both roles are filled.
    ///
    /// A later family overwrites an earlier one for a role until the set is
    /// complete, so a family offering both roles wins over a split pair found
    /// in the same scan.
    pub fn find(families: &[QueueFamilyInfo]) -> Self {
        let mut indices = Self::default();

        for (i, family) in families.iter().enumerate() {
            if family.flags.contains(vk::QueueFlags::GRAPHICS) {
                indices.graphics_family = Some(i as u32);
            }
            if family.supports_present {
                indices.present_family = Some(i as u32);
            }
            if indices.is_complete() {
                break;
            }
        }

        indices
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.graphics_family.is_some() && self.present_family.is_some()
    }

    /// Distinct family indices, graphics first. One queue is created per entry.
    pub fn unique_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(2);
        if let Some(graphics) = self.graphics_family {
            families.push(graphics);
        }
        if let Some(present) = self.present_family {
            if !families.contains(&present) {
                families.push(present);
            }
        }
        families
    }
}

/// One queue family as seen from a particular surface
#[derive(Clone, Copy, Debug)]
pub struct QueueFamilyInfo {
    pub flags: vk::QueueFlags,
    pub supports_present: bool,
}

/// What a surface offers on a given adapter. Queried fresh for every
/// swapchain (re)creation.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: surface_loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .context("Failed to query surface capabilities")?,
                formats: surface_loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .context("Failed to query surface formats")?,
                present_modes: surface_loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .context("Failed to query surface present modes")?,
            })
        }
    }
}

/// Snapshot of everything adapter selection looks at. Captured once per
/// candidate and never mutated afterwards.
#[derive(Clone, Debug)]
pub struct AdapterCapabilities {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Vec<QueueFamilyInfo>,
    pub extensions: Vec<CString>,
    pub surface: SurfaceSupport,
}

impl AdapterCapabilities {
    fn query(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed adapter>".to_string());

        let queue_families = unsafe {
            instance.get_physical_device_queue_family_properties(physical_device)
        }
        .iter()
        .enumerate()
        .map(|(i, family)| {
            let supports_present = unsafe {
                surface_loader.get_physical_device_surface_support(physical_device, i as u32, surface)
            }
            .with_context(|| format!("Failed to query present support for queue family {}", i))?;

            Ok(QueueFamilyInfo {
                flags: family.queue_flags,
                supports_present,
            })
        })
        .collect::<Result<Vec<_>>>()?;

        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .context("Failed to enumerate device extensions")?
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok().map(CStr::to_owned))
            .collect();

        let surface = SurfaceSupport::query(surface_loader, physical_device, surface)?;

        Ok(Self {
            name,
            device_type: properties.device_type,
            queue_families,
            extensions,
            surface,
        })
    }

    pub fn supports_extensions(&self, required: &[&CStr]) -> bool {
        required
            .iter()
            .all(|req| self.extensions.iter().any(|ext| ext.as_c_str() == *req))
    }

    /// Queue families if this adapter can drive the renderer, `None` otherwise
    pub fn suitability(&self, required_extensions: &[&CStr]) -> Option<QueueFamilyIndices> {
        if !self.supports_extensions(required_extensions) {
            log::debug!("{}: missing required device extensions", self.name);
            return None;
        }

        let indices = QueueFamilyIndices::find(&self.queue_families);
        if !indices.is_complete() {
            log::debug!("{}: no graphics/present queue family pair ({:?})", self.name, indices);
            return None;
        }

        if self.surface.formats.is_empty() || self.surface.present_modes.is_empty() {
            log::debug!("{}: surface offers no formats or present modes", self.name);
            return None;
        }

        Some(indices)
    }
}

/// First candidate that satisfies every requirement wins. Deterministic only
/// up to the driver's enumeration order.
pub fn pick_adapter<A: Copy>(
    candidates: &[(A, AdapterCapabilities)],
    required_extensions: &[&CStr],
) -> std::result::Result<(A, QueueFamilyIndices), BackendError> {
    candidates
        .iter()
        .find_map(|(adapter, caps)| {
            caps.suitability(required_extensions)
                .map(|indices| (*adapter, indices))
        })
        .ok_or(BackendError::NoSuitableDevice {
            checked: candidates.len(),
        })
}

/// Instance-level objects: instance, debug messenger, surface.
///
/// Owned on their own until the logical device exists, so a setup failure
/// after the instance is created still destroys them. Null handles are
/// skipped by the destroy calls.
struct InstanceCore {
    instance: ash::Instance,
    debug_utils: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    surface_loader: ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    // Keeps the loader library open; dropped after everything above
    entry: Entry,
}

impl Drop for InstanceCore {
    fn drop(&mut self) {
        unsafe {
            self.surface_loader.destroy_surface(self.surface, None);

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,

    // Presentation (handles owned by `core`)
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,

    // Queue handles
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub queue_families: QueueFamilyIndices,

    pub adapter_name: String,

    // Destroyed after the logical device (Drop runs before fields drop)
    core: InstanceCore,
}

impl VulkanDevice {
    /// Create the instance, surface and logical device for `window`.
    ///
    /// # Arguments
    /// * `app_name` - Application name reported to the driver
    /// * `enable_validation` - Request the Khronos validation layer (if installed)
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Arc<Self>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        log::info!("Creating Vulkan device: {}", app_name);

        let display_handle = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let window_handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();

        // Step 1: Load Vulkan library
        let entry = unsafe { Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        // Step 2: Create instance
        let enable_validation = enable_validation && Self::validation_layer_available(&entry);
        let instance =
            Self::create_instance(&entry, app_name, enable_validation, display_handle)?;

        // From here on `core` destroys whatever exists if a later step fails
        let mut core = InstanceCore {
            surface_loader: ash::khr::surface::Instance::new(&entry, &instance),
            instance,
            debug_utils: None,
            surface: vk::SurfaceKHR::null(),
            entry,
        };

        // Step 3: Setup debug messenger if validation enabled
        if enable_validation {
            core.debug_utils = Some(Self::setup_debug_messenger(&core.entry, &core.instance)?);
        }

        // Step 4: Create surface
        core.surface = unsafe {
            ash_window::create_surface(
                &core.entry,
                &core.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .context("Failed to create window surface")?;

        // Step 5: Pick physical device (GPU)
        let (physical_device, queue_families, adapter_name) =
            Self::pick_physical_device(&core.instance, &core.surface_loader, core.surface)?;

        // Step 6: Create logical device
        let device =
            Self::create_logical_device(&core.instance, physical_device, &queue_families)?;

        // Indices are complete here, pick_adapter guarantees it
        let graphics_family = queue_families.graphics_family.unwrap_or_default();
        let present_family = queue_families.present_family.unwrap_or_default();
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let swapchain_loader = ash::khr::swapchain::Device::new(&core.instance, &device);

        log::info!("Selected GPU: {}", adapter_name);
        log::info!(
            "Queue families: graphics={} present={}",
            graphics_family,
            present_family
        );

        Ok(Arc::new(Self {
            device,
            physical_device,
            surface: core.surface,
            surface_loader: core.surface_loader.clone(),
            swapchain_loader,
            graphics_queue,
            present_queue,
            queue_families,
            adapter_name,
            core,
        }))
    }

    fn validation_layer_available(entry: &Entry) -> bool {
        let available = unsafe { entry.enumerate_instance_layer_properties() }
            .map(|layers| {
                layers
                    .iter()
                    .any(|layer| layer.layer_name_as_c_str().ok() == Some(VALIDATION_LAYER))
            })
            .unwrap_or(false);

        if !available {
            log::warn!("Validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        available
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        display_handle: raw_window_handle::RawDisplayHandle,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name)?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"No Engine")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        // Surface extensions for whatever platform the window lives on
        let mut extensions = ash_window::enumerate_required_extensions(display_handle)
            .context("Windowing platform doesn't support Vulkan surfaces")?
            .to_vec();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names = if enable_validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .context("Failed to create Vulkan instance")?;

        Ok(instance)
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(MESSENGER_SEVERITY)
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to set up debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface_loader: &ash::khr::surface::Instance,
        surface: vk::SurfaceKHR,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices, String)> {
        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;

        if devices.is_empty() {
            anyhow::bail!("No Vulkan-capable GPU found");
        }

        let candidates = devices
            .into_iter()
            .map(|device| {
                let caps = AdapterCapabilities::query(instance, surface_loader, device, surface)?;
                log::debug!("Adapter candidate: {} ({:?})", caps.name, caps.device_type);
                Ok((device, caps))
            })
            .collect::<Result<Vec<_>>>()?;

        let (physical_device, indices) = pick_adapter(&candidates, REQUIRED_DEVICE_EXTENSIONS)?;
        let name = candidates
            .iter()
            .find(|(device, _)| *device == physical_device)
            .map(|(_, caps)| caps.name.clone())
            .unwrap_or_default();

        Ok((physical_device, indices, name))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
            })
            .collect();

        let extensions: Vec<_> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|ext| ext.as_ptr())
            .collect();
        let features = vk::PhysicalDeviceFeatures::default();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe { instance.create_device(physical_device, &create_info, None) }
            .context("Failed to create logical device")?;

        Ok(device)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("device_wait_idle failed")?;
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        // Surface, messenger and instance follow when `core` drops
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

/// Log level for a validation message severity
fn severity_level(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Debug
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    log::log!(severity_level(message_severity), "[Vulkan] {}", message);

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, supports_present: bool) -> QueueFamilyInfo {
        QueueFamilyInfo {
            flags,
            supports_present,
        }
    }

    fn adapter(families: Vec<QueueFamilyInfo>) -> AdapterCapabilities {
        AdapterCapabilities {
            name: "test adapter".to_string(),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            queue_families: families,
            extensions: vec![ash::khr::swapchain::NAME.to_owned()],
            surface: SurfaceSupport {
                capabilities: vk::SurfaceCapabilitiesKHR::default(),
                formats: vec![vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                }],
                present_modes: vec![vk::PresentModeKHR::FIFO],
            },
        }
    }

    #[test]
    fn messenger_forwards_every_severity() {
        assert!(MESSENGER_SEVERITY.contains(vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE));
        assert!(MESSENGER_SEVERITY.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO));
        assert!(MESSENGER_SEVERITY.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING));
        assert!(MESSENGER_SEVERITY.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR));
    }

    #[test]
    fn severities_map_to_log_levels() {
        use ash::vk::DebugUtilsMessageSeverityFlagsEXT as Severity;

        assert_eq!(severity_level(Severity::VERBOSE), log::Level::Debug);
        assert_eq!(severity_level(Severity::INFO), log::Level::Debug);
        assert_eq!(severity_level(Severity::WARNING), log::Level::Warn);
        assert_eq!(severity_level(Severity::ERROR), log::Level::Error);
    }

    #[test]
    fn indices_complete_only_with_both_roles() {
        assert!(!QueueFamilyIndices::default().is_complete());
        assert!(!QueueFamilyIndices {
            graphics_family: Some(0),
            present_family: None,
        }
        .is_complete());
        assert!(QueueFamilyIndices {
            graphics_family: Some(1),
            present_family: Some(1),
        }
        .is_complete());
    }

    #[test]
    fn find_resolves_shared_family() {
        let indices = QueueFamilyIndices::find(&[family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
            true,
        )]);
        assert_eq!(indices.graphics_family, Some(0));
        assert_eq!(indices.present_family, Some(0));
        assert_eq!(indices.unique_families(), vec![0]);
    }

    #[test]
    fn find_resolves_split_families() {
        let indices = QueueFamilyIndices::find(&[
            family(vk::QueueFlags::TRANSFER, true),
            family(vk::QueueFlags::GRAPHICS, false),
        ]);
        assert_eq!(indices.graphics_family, Some(1));
        assert_eq!(indices.present_family, Some(0));
        assert_eq!(indices.unique_families(), vec![1, 0]);
    }

    #[test]
    fn find_stops_once_complete() {
        let indices = QueueFamilyIndices::find(&[
            family(vk::QueueFlags::GRAPHICS, false),
            family(vk::QueueFlags::GRAPHICS, true),
            family(vk::QueueFlags::GRAPHICS, true),
        ]);
        assert_eq!(indices.graphics_family, Some(1));
        assert_eq!(indices.present_family, Some(1));
    }

    #[test]
    fn find_without_present_is_incomplete() {
        let indices = QueueFamilyIndices::find(&[family(vk::QueueFlags::GRAPHICS, false)]);
        assert_eq!(indices.graphics_family, Some(0));
        assert!(!indices.is_complete());
    }

    #[test]
    fn adapter_missing_swapchain_extension_is_rejected() {
        let mut caps = adapter(vec![family(vk::QueueFlags::GRAPHICS, true)]);
        caps.extensions.clear();
        assert!(caps.suitability(REQUIRED_DEVICE_EXTENSIONS).is_none());
    }

    #[test]
    fn adapter_without_present_modes_is_rejected() {
        let mut caps = adapter(vec![family(vk::QueueFlags::GRAPHICS, true)]);
        caps.surface.present_modes.clear();
        assert!(caps.suitability(REQUIRED_DEVICE_EXTENSIONS).is_none());

        let mut caps = adapter(vec![family(vk::QueueFlags::GRAPHICS, true)]);
        caps.surface.formats.clear();
        assert!(caps.suitability(REQUIRED_DEVICE_EXTENSIONS).is_none());
    }

    #[test]
    fn first_suitable_adapter_wins() {
        let candidates = vec![
            (10u32, adapter(vec![family(vk::QueueFlags::COMPUTE, true)])),
            (20u32, adapter(vec![family(vk::QueueFlags::GRAPHICS, true)])),
            (30u32, adapter(vec![family(vk::QueueFlags::GRAPHICS, true)])),
        ];
        let (picked, indices) = pick_adapter(&candidates, REQUIRED_DEVICE_EXTENSIONS).unwrap();
        assert_eq!(picked, 20);
        assert!(indices.is_complete());
    }

    #[test]
    fn no_suitable_adapter_reports_count() {
        let candidates = vec![(1u32, adapter(vec![family(vk::QueueFlags::TRANSFER, false)]))];
        match pick_adapter(&candidates, REQUIRED_DEVICE_EXTENSIONS) {
            Err(BackendError::NoSuitableDevice { checked }) => assert_eq!(checked, 1),
            other => panic!("expected NoSuitableDevice, got {:?}", other.map(|(a, _)| a)),
        }
    }
}
