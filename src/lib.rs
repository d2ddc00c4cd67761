// Indexed Presenter Library
// GPU presentation backend for 8-bit indexed framebuffers with a 256-entry palette

// Public modules
pub mod config;
pub mod display;
pub mod geometry;
pub mod gpu;
pub mod render;
pub mod shared;

// Re-export main types for convenience
pub use config::{ConfigError, PresenterConfig};
pub use geometry::{compute_quad, texture_size_for, CutsceneScale, ScaleState, Vertex, Viewport};
pub use gpu::{
    DeviceProfile, DeviceStatus, GpuBackend, GpuDevice, GpuError, GpuFactory, HeadlessBackend,
    HeadlessProbe, LockGuard, WgpuBackend,
};
pub use render::{
    run_presenter, CutsceneDetector, DeviceSession, FrameLoop, FramePacing, LoopState,
    LoopTimings, PresenterOutcome, SessionError, StepOutcome,
};
pub use shared::{
    DisplaySettings, FrameData, FrameSignal, NoWindow, Palette, RendererKind, SharedState,
    WindowControl,
};
