// Session supervisor - Presenter thread entry point
//
// Waits out the startup delay, creates the session and runs the frame loop.
// The session is always released afterwards. If the first creation fails the
// driver warning is raised and the software renderer takes over.

use super::frame_loop::{CutsceneDetector, FrameLoop, LoopTimings};
use super::session::DeviceSession;
use crate::gpu::GpuBackend;
use crate::shared::RendererKind;
use std::sync::atomic::Ordering;
use std::thread;
use tracing::{info, warn};

/// Renderer that ended up driving the display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenterOutcome {
    /// GPU presentation ran until shutdown
    Hardware,
    /// GPU presentation failed to start; the fallback ran instead
    Software,
}

/// Run the presenter until shutdown
///
/// # Arguments
/// * `session` - Released session to drive
/// * `detector` - Cutscene predicate for the frame loop
/// * `timings` - Startup delay and loop timings
/// * `fallback` - Software renderer, run in place when creation fails
///
/// # Returns
/// Which renderer drove the display; returns only after that renderer stops
pub fn run_presenter<B, C, F>(
    session: &mut DeviceSession<B>,
    detector: C,
    timings: LoopTimings,
    fallback: F,
) -> PresenterOutcome
where
    B: GpuBackend,
    C: CutsceneDetector,
    F: FnOnce(),
{
    thread::sleep(timings.startup_delay);

    let shared = session.shared().clone();
    let created = match session.create() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "hardware presentation unavailable");
            false
        }
    };

    if created {
        shared.set_renderer(RendererKind::Hardware);
        FrameLoop::new(session, detector, timings).run();
    }

    if let Err(e) = session.release() {
        warn!(error = %e, "session release incomplete at shutdown");
    }

    if created {
        return PresenterOutcome::Hardware;
    }

    shared.show_driver_warning.store(true, Ordering::SeqCst);
    shared.set_renderer(RendererKind::Software);
    info!("switching to software renderer");
    fallback();

    PresenterOutcome::Software
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeadlessBackend, HeadlessProbe};
    use crate::shared::{DisplaySettings, FrameData, NoWindow, SharedState};
    use std::sync::Arc;
    use std::time::Duration;

    fn quick() -> LoopTimings {
        LoopTimings {
            startup_delay: Duration::ZERO,
            frame_wait: Duration::from_millis(1),
            suspend_retry: Duration::ZERO,
            suspend_settle: Duration::ZERO,
        }
    }

    fn shared() -> Arc<SharedState> {
        Arc::new(SharedState::new(
            DisplaySettings::new((16, 16), (16, 16)),
            Arc::new(NoWindow),
        ))
    }

    #[test]
    fn test_fallback_on_creation_failure() {
        let probe = HeadlessProbe::new();
        probe.set_fail_factory(true);
        let shared = shared();
        let mut session = DeviceSession::new(HeadlessBackend::new(probe.clone()), shared.clone());

        let mut fallback_ran = false;
        let outcome = run_presenter(&mut session, |_: &FrameData| false, quick(), || {
            fallback_ran = true
        });

        assert_eq!(outcome, PresenterOutcome::Software);
        assert!(fallback_ran);
        assert!(shared.show_driver_warning.load(Ordering::SeqCst));
        assert_eq!(shared.renderer(), RendererKind::Software);
    }

    #[test]
    fn test_hardware_run_releases_on_shutdown() {
        let probe = HeadlessProbe::new();
        let shared = shared();
        shared.shutdown();
        let mut session = DeviceSession::new(HeadlessBackend::new(probe.clone()), shared.clone());

        let outcome = run_presenter(&mut session, |_: &FrameData| false, quick(), || {
            panic!("fallback must not run")
        });

        assert_eq!(outcome, PresenterOutcome::Hardware);
        assert_eq!(shared.renderer(), RendererKind::Hardware);
        assert!(!shared.show_driver_warning.load(Ordering::SeqCst));
        assert!(!session.is_active());
        assert_eq!(probe.live_objects(), 0);
    }
}
