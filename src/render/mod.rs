// Render module - Device lifecycle and the presentation loop
//
// This module provides:
// - The resource set (quad vertex buffer, index texture, palette texture, program)
// - The device session: transactional create, reset and release
// - Frame pacing derived from the max-FPS policy
// - The frame loop state machine (active / suspended)
// - The session supervisor with software fallback

pub mod frame_loop;
pub mod pacing;
pub mod resources;
pub mod session;
pub mod supervisor;

pub use frame_loop::{CutsceneDetector, FrameLoop, LoopState, LoopTimings, StepOutcome};
pub use pacing::FramePacing;
pub use resources::ResourceSet;
pub use session::{DeviceSession, SessionError};
pub use supervisor::{run_presenter, PresenterOutcome};
