// Test pattern - Demo producer for the shared framebuffer
//
// Fills the indexed framebuffer with scrolling diagonal bands and publishes a
// color ramp palette, standing in for the legacy renderer that normally
// writes the framebuffer.

use crate::shared::{palette_from_rgb, FrameData, Palette, SharedState, PALETTE_ENTRIES};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Width of one color band in pixels
const BAND_WIDTH: u64 = 8;

/// Scrolling test pattern generator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestPattern {
    width: u32,
    height: u32,
}

impl TestPattern {
    /// Create a pattern for a framebuffer size
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Render frame number `frame` into `out` (`width * height` indices)
    pub fn render(&self, frame: u64, out: &mut [u8]) {
        let width = self.width as usize;
        if width == 0 {
            return;
        }

        for (y, row) in out.chunks_exact_mut(width).take(self.height as usize).enumerate() {
            for (x, pixel) in row.iter_mut().enumerate() {
                *pixel = ((x as u64 + y as u64 + frame) / BAND_WIDTH) as u8;
            }
        }
    }

    /// Color ramp palette; entry 0 is black
    pub fn palette() -> Palette {
        let colors: Vec<u32> = (0..PALETTE_ENTRIES as u32)
            .map(|i| match i {
                0 => 0,
                _ => (i << 16) | ((255 - i) << 8) | ((i * 4) & 0xFF),
            })
            .collect();
        palette_from_rgb(&colors)
    }
}

/// Cutscene predicate: everything outside the top-left reference area is index 0
///
/// Cutscenes authored for a smaller resolution only cover that area; the rest
/// of the framebuffer stays blank while they play.
///
/// # Arguments
/// * `reference` - Cutscene reference resolution (width, height)
pub fn outside_reference_is_blank(reference: (u32, u32)) -> impl FnMut(&FrameData) -> bool + Send {
    move |frame: &FrameData| {
        if frame.width <= reference.0 && frame.height <= reference.1 {
            return false;
        }

        (0..frame.height).all(|y| {
            let row = frame.row(y);
            if y >= reference.1 {
                row.iter().all(|&index| index == 0)
            } else {
                row.iter()
                    .skip(reference.0 as usize)
                    .all(|&index| index == 0)
            }
        })
    }
}

/// Spawn a producer thread that publishes the test pattern
///
/// # Arguments
/// * `shared` - State to publish into
/// * `fps` - Frames produced per second
/// * `frame_limit` - Stop after this many frames, `None` to run until shutdown
///
/// # Returns
/// Handle yielding the number of frames produced
pub fn spawn_producer(
    shared: Arc<SharedState>,
    fps: u32,
    frame_limit: Option<u64>,
) -> io::Result<JoinHandle<u64>> {
    let frame_duration = Duration::from_micros(1_000_000 / fps.max(1) as u64);

    thread::Builder::new()
        .name("producer".to_string())
        .spawn(move || {
            let (width, height) = shared.settings().logical_size;
            let pattern = TestPattern::new(width, height);
            let mut pixels = vec![0u8; width as usize * height as usize];
            let mut produced = 0;

            shared.submit_palette(&TestPattern::palette());

            while shared.is_running() && frame_limit.map_or(true, |limit| produced < limit) {
                pattern.render(produced, &mut pixels);
                shared.submit_surface(&pixels);
                produced += 1;
                thread::sleep(frame_duration);
            }

            debug!(produced, "producer finished");
            produced
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_scrolls() {
        let pattern = TestPattern::new(16, 2);
        let mut first = vec![0; 32];
        let mut second = vec![0; 32];
        pattern.render(0, &mut first);
        pattern.render(8, &mut second);

        assert_eq!(first[0], 0);
        assert_eq!(first[8], 1);
        assert_eq!(second[0], 1);
        assert_eq!(first[16], 0);
        assert_eq!(first[16 + 7], 1);
    }

    #[test]
    fn test_palette_entry_zero_is_black() {
        let palette = TestPattern::palette();
        assert_eq!(&palette[0..4], &[0, 0, 0, 0]);
        assert_eq!(&palette[255 * 4..256 * 4], &[0xFC, 0x00, 0xFF, 0x00]);
    }

    #[test]
    fn test_cutscene_predicate() {
        let mut detect = outside_reference_is_blank((4, 2));
        let mut frame = FrameData::new(8, 4);
        for y in 0..2 {
            for x in 0..4 {
                frame.surface[y * 8 + x] = 5;
            }
        }
        assert!(detect(&frame));

        frame.surface[8 * 3 + 7] = 1;
        assert!(!detect(&frame));
    }

    #[test]
    fn test_cutscene_predicate_small_frame() {
        let mut detect = outside_reference_is_blank((640, 400));
        assert!(!detect(&FrameData::new(320, 200)));
    }
}
