// Frame loop - Active / suspended presentation state machine
//
// Each cycle waits (bounded) for the producer, copies whatever is dirty into
// the textures, checks the device and the window flags, then either draws and
// presents, resets the device, or tears the session down and suspends.
// A suspended loop retries creation on every cycle until the window is
// restored and creation succeeds.
//
// The shared frame lock is only held while flags are read and data is
// copied, never across the status query, reset, draw or present.

use super::pacing::FramePacing;
use super::session::DeviceSession;
use crate::gpu::{DeviceStatus, GpuBackend};
use crate::shared::{FrameData, SharedState};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Decides whether the current frame belongs to a cutscene
pub trait CutsceneDetector: Send {
    /// Inspect the frame; called with the shared frame locked
    fn is_cutscene(&mut self, frame: &FrameData) -> bool;
}

impl<F> CutsceneDetector for F
where
    F: FnMut(&FrameData) -> bool + Send,
{
    fn is_cutscene(&mut self, frame: &FrameData) -> bool {
        self(frame)
    }
}

/// Fixed delays used by the presenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    /// Delay before the first device creation
    pub startup_delay: Duration,
    /// Longest wait for the frame-ready signal
    pub frame_wait: Duration,
    /// Sleep after each creation attempt while suspended
    pub suspend_retry: Duration,
    /// Sleep after tearing the session down
    pub suspend_settle: Duration,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            startup_delay: Duration::from_millis(500),
            frame_wait: Duration::from_millis(200),
            suspend_retry: Duration::from_millis(500),
            suspend_settle: Duration::from_millis(200),
        }
    }
}

/// Frame loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Session is live; frames are drawn and presented
    Active,
    /// Session is released; creation is retried every cycle
    Suspended,
}

/// What one loop cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Run flag cleared or the frame signal failed
    Stopped,
    /// Frame drawn and presented
    Presented,
    /// Draw or present failed; retried next cycle
    DrawFailed,
    /// Device lost and not resettable yet; nothing drawn
    DeviceLost,
    /// Device reset succeeded
    Reset,
    /// Device reset failed; retried next cycle
    ResetFailed,
    /// Session released and the loop suspended
    Suspended,
    /// Session recreated and the loop active again
    Resumed,
    /// Still suspended
    Retrying,
}

/// Presentation loop over a device session
pub struct FrameLoop<'a, B: GpuBackend, C: CutsceneDetector> {
    session: &'a mut DeviceSession<B>,
    shared: Arc<SharedState>,
    detector: C,
    pacing: FramePacing,
    timings: LoopTimings,
    state: LoopState,
    frames_presented: u64,
}

impl<'a, B: GpuBackend, C: CutsceneDetector> FrameLoop<'a, B, C> {
    /// Create a loop over `session`
    ///
    /// Starts active when the session is active, suspended otherwise. Pacing
    /// is derived from the session's display settings.
    ///
    /// # Arguments
    /// * `session` - Session to present through
    /// * `detector` - Cutscene predicate, consulted when cutscene handling is on
    /// * `timings` - Wait and sleep durations
    pub fn new(session: &'a mut DeviceSession<B>, detector: C, timings: LoopTimings) -> Self {
        let shared = session.shared().clone();
        let pacing = FramePacing::from_settings(session.settings());
        let state = if session.is_active() {
            LoopState::Active
        } else {
            LoopState::Suspended
        };

        Self {
            session,
            shared,
            detector,
            pacing,
            timings,
            state,
            frames_presented: 0,
        }
    }

    /// Replace the frame pacing
    pub fn set_pacing(&mut self, pacing: FramePacing) {
        self.pacing = pacing;
    }

    /// Current frame pacing
    pub fn pacing(&self) -> FramePacing {
        self.pacing
    }

    /// Current state
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Frames presented so far
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Session driven by this loop
    pub fn session(&self) -> &DeviceSession<B> {
        &*self.session
    }

    /// Run until the run flag clears or the frame signal fails
    pub fn run(&mut self) {
        info!(pacing = ?self.pacing.fps(), "frame loop started");
        while self.step() != StepOutcome::Stopped {}
        info!(frames = self.frames_presented, "frame loop stopped");
    }

    /// Run one cycle
    pub fn step(&mut self) -> StepOutcome {
        if !self.shared.is_running() {
            return StepOutcome::Stopped;
        }

        // A timeout still draws; only a failed wait ends the loop
        if let Err(e) = self.shared.frame_ready.wait_timeout(self.timings.frame_wait) {
            debug!(error = %e, "frame wait failed");
            return StepOutcome::Stopped;
        }

        match self.state {
            LoopState::Suspended => self.retry_create(),
            LoopState::Active => self.present_cycle(),
        }
    }

    fn retry_create(&mut self) -> StepOutcome {
        let mut outcome = StepOutcome::Retrying;

        if !self.shared.minimized.load(Ordering::SeqCst) {
            match self.session.create() {
                Ok(()) => {
                    self.state = LoopState::Active;
                    self.pacing = FramePacing::from_settings(self.session.settings());
                    info!("presentation resumed");
                    outcome = StepOutcome::Resumed;
                }
                Err(e) => debug!(error = %e, "session recreation failed"),
            }
        }

        thread::sleep(self.timings.suspend_retry);
        outcome
    }

    fn present_cycle(&mut self) -> StepOutcome {
        let tick_start = self.pacing.tick_start();

        self.copy_frame();

        let status = self.session.device_status();
        let mode_changed = self.shared.display_mode_changed.swap(false, Ordering::SeqCst);
        let minimized = self.shared.minimized.load(Ordering::SeqCst);

        let outcome = if minimized || mode_changed {
            self.suspend(minimized);
            StepOutcome::Suspended
        } else {
            match status {
                Some(DeviceStatus::NotReset) if self.session.params().windowed => {
                    match self.session.reset() {
                        Ok(()) => {
                            info!("device reset");
                            StepOutcome::Reset
                        }
                        Err(e) => {
                            warn!(error = %e, "device reset failed");
                            StepOutcome::ResetFailed
                        }
                    }
                }
                Some(DeviceStatus::NotReset) | Some(DeviceStatus::Removed) | None => {
                    warn!(?status, "device cannot be reset, recreating");
                    self.suspend(false);
                    StepOutcome::Suspended
                }
                Some(DeviceStatus::Lost) => {
                    trace!("device lost, waiting");
                    StepOutcome::DeviceLost
                }
                Some(DeviceStatus::Ok) => match self.session.draw_and_present() {
                    Ok(()) => {
                        self.frames_presented += 1;
                        StepOutcome::Presented
                    }
                    Err(e) => {
                        debug!(error = %e, "frame not presented");
                        StepOutcome::DrawFailed
                    }
                },
            }
        };

        self.pacing.throttle(tick_start);
        outcome
    }

    /// Copy dirty framebuffer and palette data under the shared lock
    fn copy_frame(&mut self) {
        let vhack = self.session.settings().vhack;
        let frame = self.shared.lock_frame();

        let Some(palette) = frame.palette.as_deref() else {
            return;
        };

        if vhack {
            if self.detector.is_cutscene(&frame) {
                if !self.shared.in_cutscene.swap(true, Ordering::SeqCst) {
                    self.session.update_vertices(true);
                }
            } else if self.shared.in_cutscene.swap(false, Ordering::SeqCst) {
                self.session.update_vertices(false);
            }
        }

        if self.shared.surface_updated.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.session.upload_surface(&frame) {
                debug!(error = %e, "surface upload skipped");
            }
        }

        if self.shared.palette_updated.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.session.upload_palette(palette) {
                debug!(error = %e, "palette upload skipped");
            }
        }
    }

    fn suspend(&mut self, minimized: bool) {
        self.state = LoopState::Suspended;
        if let Err(e) = self.session.release() {
            warn!(error = %e, "session release incomplete");
        }
        info!(minimized, "presentation suspended");

        thread::sleep(self.timings.suspend_settle);

        if minimized {
            self.shared.window().show_minimized_inactive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeadlessBackend, HeadlessProbe};
    use crate::shared::{palette_from_rgb, DisplaySettings, NoWindow};

    fn quick() -> LoopTimings {
        LoopTimings {
            startup_delay: Duration::ZERO,
            frame_wait: Duration::from_millis(1),
            suspend_retry: Duration::ZERO,
            suspend_settle: Duration::ZERO,
        }
    }

    fn session(probe: &HeadlessProbe) -> DeviceSession<HeadlessBackend> {
        let mut settings = DisplaySettings::new((8, 8), (8, 8));
        settings.max_fps = 1000;
        let shared = Arc::new(SharedState::new(settings, Arc::new(NoWindow)));
        let mut session = DeviceSession::new(HeadlessBackend::new(probe.clone()), shared);
        session.create().unwrap();
        session
    }

    #[test]
    fn test_starts_active_after_create() {
        let probe = HeadlessProbe::new();
        let mut session = session(&probe);
        let frame_loop = FrameLoop::new(&mut session, |_: &FrameData| false, quick());
        assert_eq!(frame_loop.state(), LoopState::Active);
        assert_eq!(frame_loop.pacing().fps(), None);
    }

    #[test]
    fn test_stops_when_run_flag_clears() {
        let probe = HeadlessProbe::new();
        let mut session = session(&probe);
        session.shared().run.store(false, Ordering::SeqCst);

        let mut frame_loop = FrameLoop::new(&mut session, |_: &FrameData| false, quick());
        assert_eq!(frame_loop.step(), StepOutcome::Stopped);
        assert_eq!(probe.presents(), 0);
    }

    #[test]
    fn test_stops_when_signal_closes() {
        let probe = HeadlessProbe::new();
        let mut session = session(&probe);
        session.shared().frame_ready.close();

        let mut frame_loop = FrameLoop::new(&mut session, |_: &FrameData| false, quick());
        frame_loop.run();
        assert_eq!(frame_loop.frames_presented(), 0);
    }

    #[test]
    fn test_timeout_still_presents() {
        let probe = HeadlessProbe::new();
        let mut session = session(&probe);

        let mut frame_loop = FrameLoop::new(&mut session, |_: &FrameData| false, quick());
        assert_eq!(frame_loop.step(), StepOutcome::Presented);
        assert_eq!(probe.presents(), 1);
    }

    #[test]
    fn test_no_upload_without_palette() {
        let probe = HeadlessProbe::new();
        let mut session = session(&probe);
        let shared = session.shared().clone();
        shared.submit_surface(&[9; 64]);

        let mut frame_loop = FrameLoop::new(&mut session, |_: &FrameData| false, quick());
        frame_loop.step();

        assert!(shared.surface_updated.load(Ordering::SeqCst));
        assert_eq!(probe.source_texture().unwrap().row(0)[0], 0);

        shared.submit_palette(&palette_from_rgb(&[0xFFFFFF]));
        frame_loop.step();
        assert!(!shared.surface_updated.load(Ordering::SeqCst));
        assert_eq!(probe.source_texture().unwrap().row(0)[0], 9);
    }

    #[test]
    fn test_lost_device_skips_frame() {
        let probe = HeadlessProbe::new();
        let mut session = session(&probe);
        probe.set_status(DeviceStatus::Lost);

        let mut frame_loop = FrameLoop::new(&mut session, |_: &FrameData| false, quick());
        assert_eq!(frame_loop.step(), StepOutcome::DeviceLost);
        assert_eq!(frame_loop.state(), LoopState::Active);
        assert_eq!(probe.presents(), 0);
    }

    #[test]
    fn test_removed_device_suspends_and_recreates() {
        let probe = HeadlessProbe::new();
        let mut session = session(&probe);
        probe.set_status(DeviceStatus::Removed);

        let mut frame_loop = FrameLoop::new(&mut session, |_: &FrameData| false, quick());
        assert_eq!(frame_loop.step(), StepOutcome::Suspended);
        assert_eq!(frame_loop.state(), LoopState::Suspended);
        assert_eq!(probe.live_objects(), 0);

        probe.set_status(DeviceStatus::Ok);
        assert_eq!(frame_loop.step(), StepOutcome::Resumed);
        assert_eq!(frame_loop.step(), StepOutcome::Presented);
        assert_eq!(probe.devices_created(), 2);
    }

    #[test]
    fn test_fullscreen_not_reset_recreates() {
        let probe = HeadlessProbe::new();
        let mut settings = DisplaySettings::new((8, 8), (8, 8));
        settings.windowed = false;
        settings.max_fps = 1000;
        let shared = Arc::new(SharedState::new(settings, Arc::new(NoWindow)));
        let mut session = DeviceSession::new(HeadlessBackend::new(probe.clone()), shared);
        session.create().unwrap();

        probe.set_status(DeviceStatus::NotReset);
        let mut frame_loop = FrameLoop::new(&mut session, |_: &FrameData| false, quick());
        assert_eq!(frame_loop.step(), StepOutcome::Suspended);
        assert_eq!(probe.reset_attempts(), 0);
    }
}
