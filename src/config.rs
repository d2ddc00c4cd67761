// Configuration management
//
// Handles presenter configuration: display mode, frame pacing, cutscene
// handling, loop timings and log level, persisted as TOML.

use crate::geometry::{Viewport, CUTSCENE_HEIGHT, CUTSCENE_WIDTH};
use crate::render::LoopTimings;
use crate::shared::DisplaySettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default configuration file path
pub const CONFIG_FILE: &str = "presenter_config.toml";

/// Errors raised while loading, saving or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Presenter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PresenterConfig {
    /// Display settings
    #[serde(default)]
    pub display: DisplayConfig,

    /// Loop timings
    #[serde(default)]
    pub timing: TimingConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Display configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Logical framebuffer width
    pub width: u32,

    /// Logical framebuffer height
    pub height: u32,

    /// Output (window or display mode) width
    pub output_width: u32,

    /// Output (window or display mode) height
    pub output_height: u32,

    /// Present into a window instead of taking over the display
    pub windowed: bool,

    /// Enable VSync (disables frame limiting)
    pub vsync: bool,

    /// Frame limit: negative = refresh rate, 0 = default (125), >= 1000 = uncapped
    pub max_fps: i32,

    /// Display refresh rate in Hz, 0 if unknown
    pub refresh_rate: u32,

    /// Keep the framebuffer aspect ratio (letterbox / pillarbox)
    pub maintain_aspect: bool,

    /// Rescale cutscenes authored for a smaller resolution
    pub vhack: bool,

    /// Cutscene reference width
    pub cutscene_width: u32,

    /// Cutscene reference height
    pub cutscene_height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            output_width: 1280,
            output_height: 960,
            windowed: true,
            vsync: false,
            max_fps: -1,
            refresh_rate: 60,
            maintain_aspect: true,
            vhack: false,
            cutscene_width: CUTSCENE_WIDTH,
            cutscene_height: CUTSCENE_HEIGHT,
        }
    }
}

/// Loop timing configuration, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Delay before the first device creation
    pub startup_delay_ms: u64,

    /// Longest wait for a new frame
    pub frame_wait_ms: u64,

    /// Sleep between creation attempts while suspended
    pub suspend_retry_ms: u64,

    /// Sleep after releasing the device on minimize or mode change
    pub suspend_settle_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: 500,
            frame_wait_ms: 200,
            suspend_retry_ms: 500,
            suspend_settle_ms: 200,
        }
    }
}

impl TimingConfig {
    /// Timings used by the supervisor and the frame loop
    pub fn loop_timings(&self) -> LoopTimings {
        LoopTimings {
            startup_delay: Duration::from_millis(self.startup_delay_ms),
            frame_wait: Duration::from_millis(self.frame_wait_ms),
            suspend_retry: Duration::from_millis(self.suspend_retry_ms),
            suspend_settle: Duration::from_millis(self.suspend_settle_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    /// Parsed log level
    pub fn level(&self) -> Result<tracing::Level, ConfigError> {
        tracing::Level::from_str(&self.level).map_err(|e| ConfigError::Invalid {
            field: "logging.level",
            reason: e.to_string(),
        })
    }
}

impl PresenterConfig {
    /// Load configuration from file or create default
    ///
    /// If the configuration file doesn't exist or can't be parsed, the default
    /// configuration is used and written back.
    ///
    /// # Returns
    ///
    /// The loaded or default configuration
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_else(|_| {
            let config = Self::default();
            // Try to save the default config, but don't fail if we can't
            let _ = config.save();
            config
        })
    }

    /// Load configuration from the default file
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load and validate configuration from `path`
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(CONFIG_FILE)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let display = &self.display;
        let sizes = [
            ("display.width", display.width),
            ("display.height", display.height),
            ("display.output_width", display.output_width),
            ("display.output_height", display.output_height),
            ("display.cutscene_width", display.cutscene_width),
            ("display.cutscene_height", display.cutscene_height),
        ];

        for (field, value) in sizes {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        self.logging.level()?;
        Ok(())
    }

    /// Display settings for the shared presenter state
    pub fn display_settings(&self) -> DisplaySettings {
        let display = &self.display;
        let logical = (display.width, display.height);
        let output = (display.output_width, display.output_height);

        DisplaySettings {
            windowed: display.windowed,
            vsync: display.vsync,
            logical_size: logical,
            output_size: output,
            viewport: Viewport::fit(logical, output, display.maintain_aspect),
            max_fps: display.max_fps,
            refresh_rate: display.refresh_rate,
            vhack: display.vhack,
            cutscene_size: (display.cutscene_width, display.cutscene_height),
        }
    }
}
