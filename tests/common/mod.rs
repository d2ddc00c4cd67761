// Common test utilities for presenter integration tests
//
// Builds shared state, sessions and loop timings around the headless backend.

#![allow(dead_code)]

use indexed_presenter::render::LoopTimings;
use indexed_presenter::shared::{palette_from_rgb, DisplaySettings, Palette};
use indexed_presenter::{
    DeviceSession, FrameData, HeadlessBackend, HeadlessProbe, SharedState, WindowControl,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Window stand-in that counts minimize requests
#[derive(Debug, Default)]
pub struct RecordingWindow {
    minimize_requests: AtomicU32,
}

impl RecordingWindow {
    pub fn minimize_requests(&self) -> u32 {
        self.minimize_requests.load(Ordering::SeqCst)
    }
}

impl WindowControl for RecordingWindow {
    fn show_minimized_inactive(&self) {
        self.minimize_requests.fetch_add(1, Ordering::SeqCst);
    }
}

/// Timings that keep tests fast: no startup delay, no suspend sleeps
pub fn quick_timings() -> LoopTimings {
    LoopTimings {
        startup_delay: Duration::ZERO,
        frame_wait: Duration::from_millis(1),
        suspend_retry: Duration::ZERO,
        suspend_settle: Duration::ZERO,
    }
}

/// Windowed, uncapped display settings
pub fn settings(logical: (u32, u32)) -> DisplaySettings {
    let mut settings = DisplaySettings::new(logical, logical);
    settings.max_fps = 1000;
    settings
}

/// Shared state observed through a recording window
pub fn shared_state(settings: DisplaySettings) -> (Arc<SharedState>, Arc<RecordingWindow>) {
    let window = Arc::new(RecordingWindow::default());
    let shared = Arc::new(SharedState::new(settings, window.clone()));
    (shared, window)
}

/// Session that has been created successfully
pub fn active_session(
    probe: &HeadlessProbe,
    shared: &Arc<SharedState>,
) -> DeviceSession<HeadlessBackend> {
    let mut session = DeviceSession::new(HeadlessBackend::new(probe.clone()), shared.clone());
    session.create().expect("session creation failed");
    session
}

/// Palette where entry i is the gray (i, i, i)
pub fn grayscale_palette() -> Palette {
    let colors: Vec<u32> = (0..256u32).map(|i| i * 0x010101).collect();
    palette_from_rgb(&colors)
}

/// Cutscene detector that never fires
pub fn never(_: &FrameData) -> bool {
    false
}
