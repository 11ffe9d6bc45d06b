// =============================================================================
// VULKAN FRONT-END - draws one triangle per frame
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── Renderer                                                 │
// │          └── VulkanDevice + Swapchain + RenderPipeline          │
// │                └── Pre-recorded command buffers                 │
// │                      └── FrameSynchronizer (fences, semaphores) │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the frame slot's fence
// 2. Acquire swapchain image
// 3. Wait for whichever slot last used that image
// 4. Submit pre-recorded commands to GPU
// 5. Present rendered image to screen
//
// =============================================================================

mod backend;
mod config;

use anyhow::Result;
use ash::vk;
use backend::{is_drawable, Renderer, RendererSettings, VulkanDevice};
use config::Config;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting Vulkan front-end");
    log::info!(
        "Window: {}x{} \"{}\"",
        config.window.width,
        config.window.height,
        config.window.title
    );
    log::info!("Present mode preference: {}", config.graphics.present_mode);
    log::info!(
        "Shaders: {:?}, {:?}",
        config.shaders.vertex,
        config.shaders.fragment
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Setup and render failures exit the loop early; surface them as the exit status
    match app.fatal_error.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// `RUST_LOG` wins over the configured level
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str())).init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus the renderer drawing into it.
///
/// Field order matters for Drop: the renderer owns the surface and must go
/// before the window it was created from.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,
    fatal_error: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        Self {
            config,
            renderer: None,
            window: None,
            fatal_error: None,
            frame_count: 0,
            last_fps_update: Instant::now(),
        }
    }

    fn init_renderer(&self, window: &Window) -> Result<Renderer> {
        let device = VulkanDevice::new(
            &self.config.window.title,
            self.config.validation_enabled(),
            window,
        )?;

        let settings = RendererSettings {
            preferred_present_mode: self.config.present_mode(),
            vertex_shader: self.config.shaders.vertex.clone(),
            fragment_shader: self.config.shaders.fragment.clone(),
        };

        Renderer::new(device, framebuffer_size(window), settings)
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(ref renderer) = self.renderer {
            if let Err(e) = renderer.device().wait_idle() {
                log::warn!("Device did not go idle before exit: {:?}", e);
            }
        }
        event_loop.exit();
    }

    /// Show frames per second in the title, refreshed once a second
    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let elapsed = self.last_fps_update.elapsed().as_secs_f32();
        if elapsed < 1.0 {
            return;
        }

        let fps = self.frame_count as f32 / elapsed;
        if let Some(ref window) = self.window {
            window.set_title(&format!("{} - {:.0} FPS", self.config.window.title, fps));
        }
        log::debug!("{:.1} FPS", fps);

        self.frame_count = 0;
        self.last_fps_update = Instant::now();
    }
}

/// Current drawable size in physical pixels
fn framebuffer_size(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.fatal_error = Some(anyhow::Error::new(e).context("Failed to create window"));
                event_loop.exit();
                return;
            }
        };

        match self.init_renderer(&window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                self.fatal_error = Some(e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::KeyboardInput { event, .. } => {
                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            WindowEvent::RedrawRequested => {
                let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref())
                else {
                    return;
                };

                match renderer.draw_frame(framebuffer_size(window)) {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {}
                    Err(e) => {
                        log::error!("Render error: {:?}", e);
                        self.shutdown(event_loop);
                        self.fatal_error = Some(e);
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws. A minimized window gets none; the loop
    /// sleeps until the next event restores it.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            if is_drawable(framebuffer_size(window)) {
                window.request_redraw();
            }
        }
    }
}
