// Window module - Demo window hosting the presenter
//
// Creates the winit window, starts the producer and presenter threads once
// the window exists, and maps window events onto the shared flags:
// - close: stop the presenter
// - occluded / zero-size resize: minimized
// - resize or scale-factor change: display mode changed

use super::pattern::{outside_reference_is_blank, spawn_producer};
use super::software::run_software_renderer;
use crate::config::PresenterConfig;
use crate::geometry::Viewport;
use crate::gpu::WgpuBackend;
use crate::render::{run_presenter, DeviceSession, PresenterOutcome};
use crate::shared::{SharedState, WindowControl};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

/// Frame rate of the demo producer
const PRODUCER_FPS: u32 = 60;

/// Presenter-side handle on the winit window
#[derive(Debug, Clone)]
pub struct WinitWindowControl {
    window: Arc<Window>,
}

impl WinitWindowControl {
    /// Wrap a window
    pub fn new(window: Arc<Window>) -> Self {
        Self { window }
    }
}

impl WindowControl for WinitWindowControl {
    fn show_minimized_inactive(&self) {
        self.window.set_minimized(true);
    }
}

/// Application window running the presenter
pub struct PresenterWindow {
    config: PresenterConfig,
    window: Option<Arc<Window>>,
    shared: Option<Arc<SharedState>>,
    producer: Option<JoinHandle<u64>>,
    presenter: Option<JoinHandle<PresenterOutcome>>,
}

impl PresenterWindow {
    /// Create a presenter window (the window is created when the event loop starts)
    pub fn new(config: PresenterConfig) -> Self {
        Self {
            config,
            window: None,
            shared: None,
            producer: None,
            presenter: None,
        }
    }

    fn start(&mut self, window: Arc<Window>) -> io::Result<()> {
        let mut settings = self.config.display_settings();
        let size = window.inner_size();
        if size.width > 0 && size.height > 0 {
            settings.output_size = (size.width, size.height);
            settings.viewport = Viewport::fit(
                settings.logical_size,
                settings.output_size,
                self.config.display.maintain_aspect,
            );
        }
        if let Some(rate) = window
            .current_monitor()
            .and_then(|monitor| monitor.refresh_rate_millihertz())
        {
            settings.refresh_rate = rate / 1000;
        }

        let shared = Arc::new(SharedState::new(
            settings,
            Arc::new(WinitWindowControl::new(window.clone())),
        ));

        self.producer = Some(spawn_producer(shared.clone(), PRODUCER_FPS, None)?);
        self.presenter = Some(spawn_presenter(shared.clone(), window, &self.config)?);
        self.shared = Some(shared);
        Ok(())
    }

    fn handle_resize(&self, size: PhysicalSize<u32>) {
        let Some(shared) = &self.shared else {
            return;
        };

        if size.width == 0 || size.height == 0 {
            shared.minimized.store(true, Ordering::SeqCst);
            return;
        }

        shared.minimized.store(false, Ordering::SeqCst);
        let maintain_aspect = self.config.display.maintain_aspect;
        shared.update_settings(|settings| {
            settings.output_size = (size.width, size.height);
            settings.viewport =
                Viewport::fit(settings.logical_size, settings.output_size, maintain_aspect);
        });
    }

    /// Stop both threads and wait for them
    fn shutdown(&mut self) {
        if let Some(shared) = &self.shared {
            shared.shutdown();
        }

        if let Some(producer) = self.producer.take() {
            if producer.join().is_err() {
                warn!("producer thread panicked");
            }
        }

        if let Some(presenter) = self.presenter.take() {
            match presenter.join() {
                Ok(outcome) => info!(?outcome, "presenter finished"),
                Err(_) => warn!("presenter thread panicked"),
            }
        }

        if let Some(shared) = &self.shared {
            if shared.show_driver_warning.load(Ordering::SeqCst) {
                warn!("hardware presentation was unavailable; the software renderer was used");
            }
        }
    }
}

/// Spawn the presenter thread: GPU path with software fallback
fn spawn_presenter(
    shared: Arc<SharedState>,
    window: Arc<Window>,
    config: &PresenterConfig,
) -> io::Result<JoinHandle<PresenterOutcome>> {
    let timings = config.timing.loop_timings();
    let reference = (config.display.cutscene_width, config.display.cutscene_height);

    thread::Builder::new()
        .name("presenter".to_string())
        .spawn(move || {
            let mut session = DeviceSession::new(WgpuBackend::new(window.clone()), shared.clone());
            let detector = outside_reference_is_blank(reference);

            run_presenter(&mut session, detector, timings, move || {
                if let Err(e) = run_software_renderer(shared, window, timings) {
                    error!(error = %e, "software renderer failed");
                }
            })
        })
}

impl ApplicationHandler for PresenterWindow {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let display = &self.config.display;
        let window_attributes = Window::default_attributes()
            .with_title(format!(
                "Indexed Presenter - {}x{}",
                display.width, display.height
            ))
            .with_inner_size(PhysicalSize::new(display.output_width, display.output_height))
            .with_resizable(true);

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                error!(error = %e, "failed to create window");
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.start(window.clone()) {
            error!(error = %e, "failed to start presenter threads");
            self.shutdown();
            event_loop.exit();
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested, exiting...");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => self.handle_resize(size),
            WindowEvent::Occluded(occluded) => {
                if let Some(shared) = &self.shared {
                    shared.minimized.store(occluded, Ordering::SeqCst);
                }
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                if let Some(shared) = &self.shared {
                    shared.display_mode_changed.store(true, Ordering::SeqCst);
                }
            }
            _ => {}
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

/// Create and run the presenter window
///
/// # Arguments
/// * `config` - Presenter configuration
///
/// # Returns
/// Result indicating success or error
pub fn run_window(config: PresenterConfig) -> Result<(), Box<dyn std::error::Error>> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Wait);

    info!(
        logical = ?(config.display.width, config.display.height),
        output = ?(config.display.output_width, config.display.output_height),
        max_fps = config.display.max_fps,
        vsync = config.display.vsync,
        "starting presenter window"
    );

    let mut app = PresenterWindow::new(config);
    event_loop.run_app(&mut app)?;

    Ok(())
}
