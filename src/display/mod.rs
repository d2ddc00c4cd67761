// Display module - Collaborators around the presenter core
//
// This module provides:
// - A scrolling test pattern producer and a demo cutscene predicate
// - The software fallback renderer (palette expansion + pixels)
// - The winit window that hosts the presenter and raises its flags

pub mod pattern;
pub mod software;
pub mod window;

pub use pattern::{outside_reference_is_blank, spawn_producer, TestPattern};
pub use software::{expand_indexed, run_software_renderer};
pub use window::{run_window, PresenterWindow, WinitWindowControl};
