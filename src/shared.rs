// Shared state - Everything the presenter shares with the producer and the window
//
// The producer owns the framebuffer contents and signals new frames; the window
// side raises the minimized and mode-changed flags; the presenter reads both.
// The framebuffer and palette live behind one mutex. Single-word flags are
// atomics so they can be raised from any thread without taking that mutex.

use crate::geometry::{CutsceneScale, Viewport};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Number of palette entries
pub const PALETTE_ENTRIES: usize = 256;

/// Palette size in bytes (4 bytes per entry: B, G, R, X)
pub const PALETTE_BYTES: usize = PALETTE_ENTRIES * 4;

/// A 256-entry palette stored as B, G, R, X bytes per entry
pub type Palette = [u8; PALETTE_BYTES];

/// Build a palette from 0xRRGGBB colors
///
/// # Arguments
/// * `colors` - Up to 256 colors; missing entries are black
pub fn palette_from_rgb(colors: &[u32]) -> Palette {
    let mut palette = [0u8; PALETTE_BYTES];
    for (entry, &rgb) in palette.chunks_exact_mut(4).zip(colors) {
        entry[0] = rgb as u8;
        entry[1] = (rgb >> 8) as u8;
        entry[2] = (rgb >> 16) as u8;
        entry[3] = 0;
    }
    palette
}

/// Framebuffer contents shared with the producer
#[derive(Debug, Clone)]
pub struct FrameData {
    /// Framebuffer width in pixels
    pub width: u32,
    /// Framebuffer height in pixels
    pub height: u32,
    /// Palette indices, `width * height` bytes, tightly packed rows
    pub surface: Vec<u8>,
    /// Current palette, if the producer attached one
    pub palette: Option<Box<Palette>>,
}

impl FrameData {
    /// Create a zeroed framebuffer without a palette
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            surface: vec![0; width as usize * height as usize],
            palette: None,
        }
    }

    /// Row `y` of the framebuffer
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.width as usize;
        &self.surface[start..start + self.width as usize]
    }
}

/// Error returned when waiting on the frame-ready signal fails
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("frame signal closed")]
    Closed,
    #[error("frame signal poisoned")]
    Poisoned,
}

#[derive(Debug, Default)]
struct SignalState {
    pending: bool,
    closed: bool,
}

/// Auto-reset frame-ready signal with a bounded wait
///
/// `notify` marks a frame as pending; `wait_timeout` consumes it. Multiple
/// notifications before a wait collapse into one.
#[derive(Debug, Default)]
pub struct FrameSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl FrameSignal {
    /// Create a new signal with no pending frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a frame as ready and wake the waiter
    pub fn notify(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.pending = true;
            self.cond.notify_one();
        }
    }

    /// Close the signal; every later wait fails
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            self.cond.notify_all();
        }
    }

    /// Wait for a frame, at most `timeout`
    ///
    /// # Returns
    /// `Ok(true)` if a frame was pending, `Ok(false)` on timeout, or an error
    /// once the signal has been closed
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, WaitError> {
        let state = self.state.lock().map_err(|_| WaitError::Poisoned)?;
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.pending && !s.closed)
            .map_err(|_| WaitError::Poisoned)?;

        if state.closed {
            return Err(WaitError::Closed);
        }

        Ok(std::mem::take(&mut state.pending))
    }
}

/// Window operations the presenter may request
pub trait WindowControl: Send + Sync {
    /// Show the window minimized without activating it
    fn show_minimized_inactive(&self);
}

/// Window stand-in that ignores every request
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWindow;

impl WindowControl for NoWindow {
    fn show_minimized_inactive(&self) {}
}

/// Display settings read by the presenter
#[derive(Debug, Clone, PartialEq)]
pub struct DisplaySettings {
    /// Present into a window instead of taking over the display
    pub windowed: bool,
    /// Synchronize presents to the vertical blank
    pub vsync: bool,
    /// Logical framebuffer size
    pub logical_size: (u32, u32),
    /// Output (render target) size
    pub output_size: (u32, u32),
    /// Rectangle of the output the framebuffer is drawn into
    pub viewport: Viewport,
    /// Max-FPS policy: negative = display refresh rate, 0 = default, >= 1000 = uncapped
    pub max_fps: i32,
    /// Display refresh rate in Hz, 0 if unknown
    pub refresh_rate: u32,
    /// Consult the cutscene detector every frame
    pub vhack: bool,
    /// Reference resolution for cutscene scaling
    pub cutscene_size: (u32, u32),
}

impl DisplaySettings {
    /// Windowed settings that stretch the framebuffer over the output
    pub fn new(logical_size: (u32, u32), output_size: (u32, u32)) -> Self {
        Self {
            windowed: true,
            vsync: false,
            logical_size,
            output_size,
            viewport: Viewport::fit(logical_size, output_size, false),
            max_fps: -1,
            refresh_rate: 60,
            vhack: false,
            cutscene_size: (crate::geometry::CUTSCENE_WIDTH, crate::geometry::CUTSCENE_HEIGHT),
        }
    }

    /// Cutscene scaling parameters for these settings
    pub fn cutscene_scale(&self) -> CutsceneScale {
        CutsceneScale {
            reference: self.cutscene_size,
            logical: self.logical_size,
        }
    }
}

/// Which renderer currently drives the display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RendererKind {
    /// No renderer has started yet
    None = 0,
    /// GPU presentation path
    Hardware = 1,
    /// Software fallback path
    Software = 2,
}

impl RendererKind {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RendererKind::Hardware,
            2 => RendererKind::Software,
            _ => RendererKind::None,
        }
    }
}

/// State shared between producer, window and presenter threads
pub struct SharedState {
    settings: RwLock<DisplaySettings>,
    frame: Mutex<FrameData>,
    window: Arc<dyn WindowControl>,

    /// Frame-ready signal raised by the producer
    pub frame_ready: FrameSignal,

    /// Presenter keeps running while set
    pub run: AtomicBool,
    /// Window is minimized
    pub minimized: AtomicBool,
    /// Display mode changed since the presenter last looked
    pub display_mode_changed: AtomicBool,
    /// A cutscene is currently being presented
    pub in_cutscene: AtomicBool,
    /// Framebuffer changed since the last upload
    pub surface_updated: AtomicBool,
    /// Palette changed since the last upload
    pub palette_updated: AtomicBool,
    /// The GPU path failed to start and the user should be told
    pub show_driver_warning: AtomicBool,

    renderer: AtomicU8,
}

impl SharedState {
    /// Create shared state for a framebuffer of `settings.logical_size`
    ///
    /// # Arguments
    /// * `settings` - Initial display settings
    /// * `window` - Window the presenter may minimize
    pub fn new(settings: DisplaySettings, window: Arc<dyn WindowControl>) -> Self {
        let (width, height) = settings.logical_size;
        Self {
            settings: RwLock::new(settings),
            frame: Mutex::new(FrameData::new(width, height)),
            window,
            frame_ready: FrameSignal::new(),
            run: AtomicBool::new(true),
            minimized: AtomicBool::new(false),
            display_mode_changed: AtomicBool::new(false),
            in_cutscene: AtomicBool::new(false),
            surface_updated: AtomicBool::new(false),
            palette_updated: AtomicBool::new(false),
            show_driver_warning: AtomicBool::new(false),
            renderer: AtomicU8::new(RendererKind::None as u8),
        }
    }

    /// Snapshot of the current display settings
    pub fn settings(&self) -> DisplaySettings {
        match self.settings.read() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Change display settings and flag a mode change
    pub fn update_settings(&self, update: impl FnOnce(&mut DisplaySettings)) {
        {
            let mut settings = match self.settings.write() {
                Ok(settings) => settings,
                Err(poisoned) => poisoned.into_inner(),
            };
            update(&mut settings);
        }
        self.display_mode_changed.store(true, Ordering::SeqCst);
    }

    /// Lock the shared framebuffer
    pub fn lock_frame(&self) -> MutexGuard<'_, FrameData> {
        match self.frame.lock() {
            Ok(frame) => frame,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Window handle for presenter requests
    pub fn window(&self) -> &dyn WindowControl {
        self.window.as_ref()
    }

    /// Whether the presenter should keep running
    pub fn is_running(&self) -> bool {
        self.run.load(Ordering::SeqCst)
    }

    /// Stop the presenter and wake it if it is waiting
    pub fn shutdown(&self) {
        self.run.store(false, Ordering::SeqCst);
        self.frame_ready.close();
    }

    /// Renderer currently driving the display
    pub fn renderer(&self) -> RendererKind {
        RendererKind::from_u8(self.renderer.load(Ordering::SeqCst))
    }

    /// Record which renderer drives the display
    pub fn set_renderer(&self, kind: RendererKind) {
        self.renderer.store(kind as u8, Ordering::SeqCst);
    }

    /// Producer helper: replace the framebuffer, mark it dirty and signal
    pub fn submit_surface(&self, pixels: &[u8]) {
        {
            let mut frame = self.lock_frame();
            let len = frame.surface.len().min(pixels.len());
            frame.surface[..len].copy_from_slice(&pixels[..len]);
        }
        self.surface_updated.store(true, Ordering::SeqCst);
        self.frame_ready.notify();
    }

    /// Producer helper: replace the palette, mark it dirty and signal
    pub fn submit_palette(&self, palette: &Palette) {
        {
            let mut frame = self.lock_frame();
            frame.palette = Some(Box::new(*palette));
        }
        self.palette_updated.store(true, Ordering::SeqCst);
        self.frame_ready.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_palette_from_rgb() {
        let palette = palette_from_rgb(&[0x112233, 0xFFFFFF]);
        assert_eq!(&palette[0..4], &[0x33, 0x22, 0x11, 0x00]);
        assert_eq!(&palette[4..8], &[0xFF, 0xFF, 0xFF, 0x00]);
        assert!(palette[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_signal_timeout() {
        let signal = FrameSignal::new();
        let start = Instant::now();
        assert_eq!(signal.wait_timeout(Duration::from_millis(20)), Ok(false));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_signal_collapses_notifications() {
        let signal = FrameSignal::new();
        signal.notify();
        signal.notify();
        assert_eq!(signal.wait_timeout(Duration::from_millis(1)), Ok(true));
        assert_eq!(signal.wait_timeout(Duration::from_millis(1)), Ok(false));
    }

    #[test]
    fn test_signal_close_fails_wait() {
        let signal = Arc::new(FrameSignal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(10));
        signal.close();
        assert_eq!(waiter.join().unwrap(), Err(WaitError::Closed));
    }

    #[test]
    fn test_submit_marks_dirty() {
        let shared = SharedState::new(DisplaySettings::new((4, 4), (4, 4)), Arc::new(NoWindow));
        shared.submit_surface(&[7; 16]);
        assert!(shared.surface_updated.load(Ordering::SeqCst));
        assert_eq!(shared.lock_frame().surface, vec![7; 16]);

        shared.submit_palette(&[1; PALETTE_BYTES]);
        assert!(shared.palette_updated.load(Ordering::SeqCst));
        assert!(shared.lock_frame().palette.is_some());
    }

    #[test]
    fn test_update_settings_flags_mode_change() {
        let shared = SharedState::new(DisplaySettings::new((640, 480), (640, 480)), Arc::new(NoWindow));
        shared.update_settings(|s| s.output_size = (1280, 960));
        assert_eq!(shared.settings().output_size, (1280, 960));
        assert!(shared.display_mode_changed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_renderer_kind() {
        let shared = SharedState::new(DisplaySettings::new((4, 4), (4, 4)), Arc::new(NoWindow));
        assert_eq!(shared.renderer(), RendererKind::None);
        shared.set_renderer(RendererKind::Software);
        assert_eq!(shared.renderer(), RendererKind::Software);
    }
}
