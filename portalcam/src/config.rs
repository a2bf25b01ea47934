//! Configuration for the portalcam binary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use portalcam_core::capture::pattern::{PATTERN_FPS, PATTERN_HEIGHT, PATTERN_WIDTH};
use portalcam_core::capture::validate::{
    DEFAULT_MAX_SAMPLES, DEFAULT_MAX_WRITE_FAILURES, DEFAULT_MIN_VALID_RATIO,
    DEFAULT_WARMUP_FRAMES,
};
use portalcam_core::portal::CursorMode;
use portalcam_core::{PipelineConfig, SourceSelection, SourceTypes};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CamConfig {
    /// Output device settings.
    pub device: DeviceConfig,
    /// Frame filtering and failure handling.
    pub capture: CaptureConfig,
    /// Screencast source selection.
    pub portal: PortalConfig,
    /// Colour-bar mode.
    pub pattern: PatternConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Output device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Loopback device node; the positional CLI argument overrides it.
    pub path: String,
}

/// Capture pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Frames discarded after every format change.
    pub warmup_frames: u32,
    /// Fraction of sampled pixels that must be non-black.
    pub min_valid_ratio: f64,
    /// Upper bound on pixels sampled per frame.
    pub max_samples: usize,
    /// Consecutive write failures before giving up.
    pub max_write_failures: u32,
}

/// Screencast source selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    /// Any of "monitor", "window", "virtual".
    pub source_types: Vec<String>,
    /// Allow selecting more than one source.
    pub multiple: bool,
    /// Pointer handling: "hidden", "embedded", "metadata".
    pub cursor_mode: String,
}

/// Colour-bar mode geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: "/dev/video0".into(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            warmup_frames: DEFAULT_WARMUP_FRAMES,
            min_valid_ratio: DEFAULT_MIN_VALID_RATIO,
            max_samples: DEFAULT_MAX_SAMPLES,
            max_write_failures: DEFAULT_MAX_WRITE_FAILURES,
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            source_types: vec!["monitor".into()],
            multiple: false,
            cursor_mode: "embedded".into(),
        }
    }
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            width: PATTERN_WIDTH,
            height: PATTERN_HEIGHT,
            fps: PATTERN_FPS,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl CamConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// The default configuration as TOML, for `--gen-config`.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Pipeline tunables, clamped to workable ranges.
    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            warmup_frames: self.capture.warmup_frames.min(600),
            min_valid_ratio: self.capture.min_valid_ratio.clamp(0.0, 1.0),
            max_samples: self.capture.max_samples.clamp(1, 100_000),
            max_write_failures: self.capture.max_write_failures.max(1),
        }
    }

    /// Select-sources options. Unknown names are skipped; an empty set
    /// falls back to monitors.
    pub fn to_source_selection(&self) -> SourceSelection {
        let mut source_types = SourceTypes::empty();
        for name in &self.portal.source_types {
            match name.to_ascii_lowercase().as_str() {
                "monitor" => source_types |= SourceTypes::MONITOR,
                "window" => source_types |= SourceTypes::WINDOW,
                "virtual" => source_types |= SourceTypes::VIRTUAL,
                other => tracing::warn!("unknown source type {other:?}; ignored"),
            }
        }
        if source_types.is_empty() {
            source_types = SourceTypes::default();
        }

        let cursor_mode = match self.portal.cursor_mode.to_ascii_lowercase().as_str() {
            "hidden" => CursorMode::Hidden,
            "metadata" => CursorMode::Metadata,
            "embedded" => CursorMode::Embedded,
            other => {
                tracing::warn!("unknown cursor mode {other:?}; using embedded");
                CursorMode::Embedded
            }
        };

        SourceSelection {
            source_types,
            multiple: self.portal.multiple,
            cursor_mode,
        }
    }

    /// Pattern geometry rounded down to even width and clamped rate.
    pub fn pattern_geometry(&self) -> (u32, u32, u32) {
        let width = (self.pattern.width.clamp(2, 7680)) & !1;
        let height = self.pattern.height.clamp(1, 4320);
        let fps = self.pattern.fps.clamp(1, 60);
        (width, height, fps)
    }
}

// ── Tests ────────────────────────────────────────────────────────
