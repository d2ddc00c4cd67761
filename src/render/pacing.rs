// Frame pacing - Max-FPS policy and per-frame sleep
//
// Policy:
// - negative max FPS means "match the display refresh rate"
// - zero (or an unknown refresh rate) means the default of 125 FPS
// - 1000 FPS or more, or vsync, means uncapped (never sleep)

use crate::shared::DisplaySettings;
use std::time::{Duration, Instant};

/// Frame rate used when no usable limit is configured
pub const DEFAULT_MAX_FPS: u32 = 125;

/// Limits at or above this value disable pacing
pub const UNCAPPED_THRESHOLD: u32 = 1000;

/// Frame budget derived from the max-FPS policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePacing {
    fps: Option<u32>,
}

impl FramePacing {
    /// Resolve the max-FPS policy
    ///
    /// # Arguments
    /// * `max_fps` - Configured limit (negative = refresh rate, 0 = default)
    /// * `refresh_rate` - Display refresh rate in Hz, 0 if unknown
    /// * `vsync` - Presents already wait for vertical blank
    pub fn new(max_fps: i32, refresh_rate: u32, vsync: bool) -> Self {
        let mut fps = if max_fps < 0 {
            refresh_rate
        } else {
            max_fps as u32
        };

        if fps == 0 {
            fps = DEFAULT_MAX_FPS;
        }

        if fps >= UNCAPPED_THRESHOLD || vsync {
            return Self::uncapped();
        }

        Self { fps: Some(fps) }
    }

    /// Resolve the policy from display settings
    pub fn from_settings(settings: &DisplaySettings) -> Self {
        Self::new(settings.max_fps, settings.refresh_rate, settings.vsync)
    }

    /// No frame limit
    pub fn uncapped() -> Self {
        Self { fps: None }
    }

    /// Effective frame rate limit, `None` when uncapped
    pub fn fps(&self) -> Option<u32> {
        self.fps
    }

    /// Time budget of one frame, `None` when uncapped
    pub fn budget(&self) -> Option<Duration> {
        self.fps
            .map(|fps| Duration::from_micros(1_000_000 / fps as u64))
    }

    /// Start timing a frame, `None` when uncapped
    pub fn tick_start(&self) -> Option<Instant> {
        self.fps.map(|_| Instant::now())
    }

    /// Time left in the budget after `elapsed`
    pub fn remaining(&self, elapsed: Duration) -> Option<Duration> {
        let budget = self.budget()?;
        budget.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Sleep out the rest of the frame started at `tick_start`
    ///
    /// # Returns
    /// The time slept, if any
    pub fn throttle(&self, tick_start: Option<Instant>) -> Option<Duration> {
        let remaining = self.remaining(tick_start?.elapsed())?;
        std::thread::sleep(remaining);
        Some(remaining)
    }
}

impl Default for FramePacing {
    fn default() -> Self {
        Self::new(0, 0, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy() {
        assert_eq!(FramePacing::new(60, 144, false).fps(), Some(60));
        assert_eq!(FramePacing::new(-1, 144, false).fps(), Some(144));
        assert_eq!(FramePacing::new(-1, 0, false).fps(), Some(DEFAULT_MAX_FPS));
        assert_eq!(FramePacing::new(0, 60, false).fps(), Some(DEFAULT_MAX_FPS));
        assert_eq!(FramePacing::new(999, 60, false).fps(), Some(999));
        assert_eq!(FramePacing::new(1000, 60, false).fps(), None);
        assert_eq!(FramePacing::new(60, 60, true).fps(), None);
    }

    #[test]
    fn test_budget() {
        assert_eq!(
            FramePacing::new(60, 60, false).budget(),
            Some(Duration::from_micros(16_666))
        );
        assert_eq!(
            FramePacing::default().budget(),
            Some(Duration::from_micros(8_000))
        );
        assert_eq!(FramePacing::uncapped().budget(), None);
    }

    #[test]
    fn test_remaining() {
        let pacing = FramePacing::new(100, 0, false);
        assert_eq!(
            pacing.remaining(Duration::from_millis(4)),
            Some(Duration::from_millis(6))
        );
        assert_eq!(pacing.remaining(Duration::from_millis(10)), None);
        assert_eq!(pacing.remaining(Duration::from_millis(25)), None);
    }

    #[test]
    fn test_throttle_fills_budget() {
        let pacing = FramePacing::new(60, 0, false);
        let start = pacing.tick_start();
        pacing.throttle(start);
        assert!(start.unwrap().elapsed() >= pacing.budget().unwrap());
    }

    #[test]
    fn test_uncapped_never_sleeps() {
        let pacing = FramePacing::uncapped();
        let start = pacing.tick_start();
        assert!(start.is_none());
        assert_eq!(pacing.throttle(start), None);
    }
}
