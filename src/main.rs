// Indexed Presenter - Main Entry Point
//
// Runs the presenter against a scrolling test pattern, either in a window
// through wgpu or headless against the in-memory backend.

use clap::Parser;
use indexed_presenter::config::{PresenterConfig, CONFIG_FILE};
use indexed_presenter::display::{outside_reference_is_blank, run_window, spawn_producer};
use indexed_presenter::{
    run_presenter, DeviceSession, HeadlessBackend, HeadlessProbe, NoWindow, SharedState,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "indexed-presenter")]
#[command(about = "Present an 8-bit indexed framebuffer through the GPU")]
struct Args {
    /// Configuration file (created with defaults if missing)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run against the in-memory backend without opening a window
    #[arg(long)]
    headless: bool,

    /// Frames to produce in headless mode
    #[arg(long, default_value_t = 120)]
    frames: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PresenterConfig::load_from(path)?,
        None => PresenterConfig::load_or_default(),
    };

    tracing_subscriber::fmt()
        .with_max_level(config.logging.level()?)
        .with_thread_names(true)
        .init();

    info!(
        config = %args
            .config
            .as_deref()
            .map_or_else(|| CONFIG_FILE.to_string(), |p| p.display().to_string()),
        "Indexed Presenter v{}",
        env!("CARGO_PKG_VERSION")
    );

    if args.headless {
        run_headless(&config, args.frames)
    } else {
        run_window(config)
    }
}

/// Present `frames` test-pattern frames through the headless backend
fn run_headless(config: &PresenterConfig, frames: u64) -> Result<(), Box<dyn std::error::Error>> {
    let shared = Arc::new(SharedState::new(config.display_settings(), Arc::new(NoWindow)));
    let probe = HeadlessProbe::new();

    let presenter = {
        let shared = shared.clone();
        let probe = probe.clone();
        let timings = config.timing.loop_timings();
        let reference = (config.display.cutscene_width, config.display.cutscene_height);

        thread::Builder::new()
            .name("presenter".to_string())
            .spawn(move || {
                let mut session = DeviceSession::new(HeadlessBackend::new(probe), shared);
                run_presenter(
                    &mut session,
                    outside_reference_is_blank(reference),
                    timings,
                    || warn!("no software renderer in headless mode"),
                )
            })?
    };

    let producer = spawn_producer(shared.clone(), 60, Some(frames))?;
    let produced = producer.join().map_err(|_| "producer thread panicked")?;

    shared.shutdown();
    let outcome = presenter.join().map_err(|_| "presenter thread panicked")?;

    info!(
        produced,
        presented = probe.presents(),
        resets = probe.resets(),
        ?outcome,
        "headless run finished"
    );
    Ok(())
}
