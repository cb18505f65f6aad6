// =============================================================================
// TRIANGLE PRESENT - Vulkan presentation core driving a single window
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (window, resize, close)                       │
// │    └── Renderer                                                 │
// │          ├── Capability probe + device/queue binding            │
// │          ├── Swapchain (rebuilt on resize / out-of-date)        │
// │          ├── Command recorder (one buffer per image)            │
// │          └── Frame synchronizer (fences, semaphores)            │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the fence of the current frame slot
// 2. Acquire swapchain image
// 3. Record and submit the command buffer for that image
// 4. Present, rebuilding the swapchain if it went stale
//
// =============================================================================

mod backend;
mod config;
mod frame;
mod renderer;

use anyhow::Result;
use config::Config;
use frame::{FrameStatus, SurfaceSignals};
use renderer::Renderer;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let (config, config_warnings) = Config::load();

    // Config problems are only reported once the logger is installed
    init_logging(&config);
    for warning in &config_warnings {
        log::warn!("{}", warning);
    }
    log::info!("Starting triangle-present");
    log::debug!("Config: {:?}", config);
    log::info!("Window: {}x{} \"{}\"",
        config.window.width,
        config.window.height,
        config.window.title
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Fatal errors stop the loop; report them once it has returned
    match app.fatal_error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Level comes from config.toml, RUST_LOG overrides it
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus renderer.
///
/// IMPORTANT: `renderer` is declared before `window` so the surface is
/// destroyed while the window still exists.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Window>,
    signals: SurfaceSignals,
    fatal_error: Option<anyhow::Error>,

    // ─────────────────────────────────────────────────────────────────────────
    // FPS TRACKING
    // ─────────────────────────────────────────────────────────────────────────
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        let signals = SurfaceSignals::new(config.window.width, config.window.height);
        Self {
            config,
            renderer: None,
            window: None,
            signals,
            fatal_error: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal_error = Some(error);
        event_loop.exit();
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(ref mut renderer) = self.renderer {
            if let Err(e) = renderer.wait_idle() {
                log::error!("Failed to wait for device idle: {:#}", e);
            }
        }
        event_loop.exit();
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        // Nothing can be presented to a zero-sized surface
        if self.signals.is_minimized() {
            return;
        }

        let Some(ref mut renderer) = self.renderer else {
            return;
        };

        match renderer.draw_frame(&mut self.signals) {
            Ok(FrameStatus::Presented { .. }) => self.update_fps(),
            Ok(FrameStatus::Skipped) => {}
            Err(e) => self.fail(event_loop, e.context("Render error")),
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
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
            .with_resizable(self.config.window.resizable)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => w,
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        let size = window.inner_size();
        self.signals = SurfaceSignals::new(size.width, size.height);

        match Renderer::new(&window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            // ─────────────────────────────────────────────────────────────────
            // CLOSE REQUEST
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            // ─────────────────────────────────────────────────────────────────
            // WINDOW RESIZED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.signals.notify_resized(size.width, size.height);
            }

            // ─────────────────────────────────────────────────────────────────
            // REDRAW REQUESTED
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::RedrawRequested => self.redraw(event_loop),

            // ─────────────────────────────────────────────────────────────────
            // KEYBOARD INPUT
            // ─────────────────────────────────────────────────────────────────
            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws while the window is visible.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
