// Backend module - Vulkan abstraction layer
//
// Each stage owns its handles and destroys them on drop. The frame protocol
// in `frame` is written against the `FrameBackend` trait so it runs without
// a GPU in tests.

pub mod command;
pub mod device;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod renderer;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use renderer::{is_drawable, Renderer, RendererSettings};
