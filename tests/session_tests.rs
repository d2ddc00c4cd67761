// Device session and supervisor integration tests

mod common;

use common::*;
use indexed_presenter::geometry::{compute_quad, HALF_PIXEL_BIAS};
use indexed_presenter::render::{run_presenter, PresenterOutcome};
use indexed_presenter::{
    DeviceProfile, DeviceSession, HeadlessBackend, HeadlessProbe, RendererKind, SessionError,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_session_is_all_or_nothing() {
    for resource in ["vertex buffer", "source texture", "palette texture", "pixel program"] {
        let probe = HeadlessProbe::new();
        probe.set_failing_resource(Some(resource));
        let (shared, _window) = shared_state(settings((640, 480)));
        let mut session = DeviceSession::new(HeadlessBackend::new(probe.clone()), shared);

        assert!(
            matches!(session.create(), Err(SessionError::Resources(_))),
            "{} failure must fail creation",
            resource
        );
        assert!(!session.is_active());
        assert_eq!(probe.live_objects(), 0, "{} failure leaked objects", resource);
    }
}

#[test]
fn test_recreate_releases_previous_session() {
    let probe = HeadlessProbe::new();
    let (shared, _window) = shared_state(settings((640, 480)));
    let mut session = active_session(&probe, &shared);
    let live = probe.live_objects();

    session.create().unwrap();
    assert_eq!(probe.live_objects(), live);
    assert_eq!(probe.device_releases(), 1);
    assert_eq!(probe.devices_created(), 2);
}

#[test]
fn test_software_profile_is_last_resort() {
    let probe = HeadlessProbe::new();
    probe.fail_profile(DeviceProfile::HardwarePure);
    probe.fail_profile(DeviceProfile::Hardware);
    probe.fail_profile(DeviceProfile::Mixed);
    let (shared, _window) = shared_state(settings((640, 480)));
    let session = active_session(&probe, &shared);

    assert_eq!(session.profile(), Some(DeviceProfile::Software));
    assert_eq!(probe.device_attempts(), DeviceProfile::ATTEMPT_ORDER.to_vec());
}

#[test]
fn test_large_framebuffer_uses_exact_texture() {
    let probe = HeadlessProbe::new();
    let (shared, _window) = shared_state(settings((5120, 2880)));
    let session = active_session(&probe, &shared);

    assert_eq!(session.texture_size(), Some((5120, 5120)));
    let scale = session.scale().unwrap();
    assert_eq!(scale.width, 1.0);
    assert_eq!(scale.height, 2880.0 / 5120.0);
}

#[test]
fn test_initial_quad_matches_geometry() {
    let probe = HeadlessProbe::new();
    let (shared, _window) = shared_state(settings((640, 480)));
    let session = active_session(&probe, &shared);

    let expected = compute_quad(
        session.settings().viewport,
        session.scale().unwrap(),
        None,
        HALF_PIXEL_BIAS,
    );
    assert_eq!(probe.vertices().unwrap(), expected);
    assert_eq!(expected[0].x, -0.5);
    assert_eq!(expected[3].x, 639.5);
}

#[test]
fn test_fullscreen_back_buffer_uses_output_size() {
    let probe = HeadlessProbe::new();
    let mut display = settings((640, 480));
    display.windowed = false;
    display.output_size = (1920, 1080);
    let (shared, _window) = shared_state(display);
    let _session = active_session(&probe, &shared);

    let params = probe.back_buffer().unwrap();
    assert_eq!((params.back_buffer_width, params.back_buffer_height), (1920, 1080));
}

#[test]
fn test_drop_releases_everything() {
    let probe = HeadlessProbe::new();
    let (shared, _window) = shared_state(settings((640, 480)));
    {
        let _session = active_session(&probe, &shared);
        assert!(probe.live_objects() > 0);
    }
    assert_eq!(probe.live_objects(), 0);
}

#[test]
fn test_supervisor_falls_back_once() {
    let probe = HeadlessProbe::new();
    probe.set_fail_factory(true);
    let (shared, _window) = shared_state(settings((640, 480)));
    let mut session = DeviceSession::new(HeadlessBackend::new(probe.clone()), shared.clone());

    let fallback_runs = Arc::new(AtomicBool::new(false));
    let outcome = {
        let fallback_runs = fallback_runs.clone();
        run_presenter(&mut session, never, quick_timings(), move || {
            assert!(!fallback_runs.swap(true, Ordering::SeqCst));
        })
    };

    assert_eq!(outcome, PresenterOutcome::Software);
    assert!(fallback_runs.load(Ordering::SeqCst));
    assert!(shared.show_driver_warning.load(Ordering::SeqCst));
    assert_eq!(shared.renderer(), RendererKind::Software);
    assert_eq!(probe.factories_created(), 0);
}

#[test]
fn test_supervisor_presents_until_shutdown() {
    let probe = HeadlessProbe::new();
    let (shared, _window) = shared_state(settings((16, 16)));

    let presenter = {
        let shared = shared.clone();
        let probe = probe.clone();
        thread::spawn(move || {
            let mut session = DeviceSession::new(HeadlessBackend::new(probe), shared);
            run_presenter(&mut session, never, quick_timings(), || {
                panic!("fallback must not run")
            })
        })
    };

    shared.submit_palette(&grayscale_palette());
    for i in 0..20u8 {
        shared.submit_surface(&[i; 256]);
        thread::sleep(Duration::from_millis(2));
    }
    shared.shutdown();

    assert_eq!(presenter.join().unwrap(), PresenterOutcome::Hardware);
    assert_eq!(shared.renderer(), RendererKind::Hardware);
    assert!(!shared.show_driver_warning.load(Ordering::SeqCst));
    assert!(probe.presents() > 0);
    assert_eq!(probe.live_objects(), 0);
}
