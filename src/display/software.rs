// Software renderer - CPU palette expansion presented through pixels
//
// Used when the GPU presentation path cannot start. Each frame the indexed
// framebuffer is expanded to RGBA through the palette and handed to `pixels`,
// which scales it to the window.

use crate::render::{FramePacing, LoopTimings};
use crate::shared::{FrameData, Palette, SharedState};
use pixels::{Pixels, SurfaceTexture};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};
use winit::window::Window;

/// Expand palette indices to RGBA
///
/// # Arguments
/// * `surface` - Palette indices
/// * `palette` - B, G, R, X palette; `None` renders black
/// * `output` - RGBA output, 4 bytes per index
pub fn expand_indexed(surface: &[u8], palette: Option<&Palette>, output: &mut [u8]) {
    for (&index, rgba) in surface.iter().zip(output.chunks_exact_mut(4)) {
        match palette {
            Some(palette) => {
                let entry = &palette[index as usize * 4..index as usize * 4 + 4];
                rgba[0] = entry[2]; // R
                rgba[1] = entry[1]; // G
                rgba[2] = entry[0]; // B
                rgba[3] = 0xFF; // A
            }
            None => rgba.copy_from_slice(&[0, 0, 0, 0xFF]),
        }
    }
}

/// Expand the shared frame into a `pixels` frame buffer
pub fn draw_frame(frame: &FrameData, output: &mut [u8]) {
    expand_indexed(&frame.surface, frame.palette.as_deref(), output);
}

/// Run the software renderer until shutdown
///
/// # Arguments
/// * `shared` - State shared with the producer and the window
/// * `window` - Window to present into
/// * `timings` - Frame wait used between frames
///
/// # Returns
/// Result indicating success or the `pixels` error that stopped rendering
pub fn run_software_renderer(
    shared: Arc<SharedState>,
    window: Arc<Window>,
    timings: LoopTimings,
) -> Result<(), pixels::Error> {
    let settings = shared.settings();
    let (width, height) = settings.logical_size;
    let window_size = window.inner_size();

    let surface_texture = SurfaceTexture::new(window_size.width, window_size.height, window.clone());
    let mut pixels = Pixels::new(width, height, surface_texture)?;
    let pacing = FramePacing::from_settings(&settings);

    info!(width, height, "software renderer started");

    while shared.is_running() {
        if shared.frame_ready.wait_timeout(timings.frame_wait).is_err() {
            break;
        }
        let tick_start = pacing.tick_start();

        if shared.display_mode_changed.swap(false, Ordering::SeqCst) {
            let size = window.inner_size();
            if size.width > 0 && size.height > 0 {
                if let Err(e) = pixels.resize_surface(size.width, size.height) {
                    warn!(error = %e, "software surface resize failed");
                }
            }
        }

        if shared.minimized.load(Ordering::SeqCst) {
            continue;
        }

        {
            let frame = shared.lock_frame();
            draw_frame(&frame, pixels.frame_mut());
        }

        if let Err(e) = pixels.render() {
            debug!(error = %e, "software frame not presented");
        }

        pacing.throttle(tick_start);
    }

    info!("software renderer stopped");
    Ok(())
}
