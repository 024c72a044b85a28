//! Configuration
//!
//! JSON configuration for capture, effects, inference and presentation.
//! Every field has a default, so `{}` is a complete config.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compositor::Compositor;
use crate::flash::FlashController;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device identifier, or "default" for the first enumerated device
    pub device: String,
    /// Requested frame width
    pub width: u32,
    /// Requested frame height
    pub height: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        // Portrait, front-camera framing
        Self {
            device: "default".to_string(),
            width: 720,
            height: 1280,
        }
    }
}

/// Pixel effect tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectsConfig {
    /// Background R, G, B multiplier
    pub attenuation: f32,
    /// Landmark pixel R, G, B multiplier
    pub landmark_gain: f32,
    /// Flash turns on when sampled brightness is below this (0-255)
    pub flash_threshold: f32,
    /// Opacity of the white flash overlay
    pub flash_opacity: f32,
    /// Sample every n-th pixel for brightness
    pub sample_stride: usize,
}

impl Default for EffectsConfig {
    fn default() -> Self {
        Self {
            attenuation: 0.25,
            landmark_gain: 1.2,
            flash_threshold: 40.0,
            flash_opacity: 0.2,
            sample_stride: 100,
        }
    }
}

impl EffectsConfig {
    pub fn compositor(&self) -> Compositor {
        Compositor::new(self.attenuation, self.landmark_gain)
    }

    pub fn flash_controller(&self) -> FlashController {
        FlashController::new(self.flash_threshold, self.flash_opacity, self.sample_stride)
    }
}

/// Model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub segmentation_enabled: bool,
    pub landmarks_enabled: bool,
    /// Models directory; searched for when unset
    pub models_dir: Option<PathBuf>,
    /// Upper bound on each model call, in milliseconds
    pub timeout_ms: u64,
    /// Person probability at or above which a pixel is foreground
    pub segmentation_threshold: f32,
    /// Minimum face presence probability
    pub face_presence_threshold: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            segmentation_enabled: true,
            landmarks_enabled: true,
            models_dir: None,
            timeout_ms: 500,
            segmentation_threshold: 0.5,
            face_presence_threshold: 0.5,
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Presentation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresentConfig {
    /// Refresh rate of the headless presenter
    pub refresh_hz: u32,
}

impl Default for PresentConfig {
    fn default() -> Self {
        Self { refresh_hz: 60 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashcamConfig {
    pub capture: CaptureConfig,
    pub effects: EffectsConfig,
    pub inference: InferenceConfig,
    pub present: PresentConfig,
}

impl FlashcamConfig {
    /// Read and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let e = &self.effects;
        if !(0.0..=1.0).contains(&e.attenuation) {
            return Err(ConfigError::Invalid(format!(
                "effects.attenuation must be within [0, 1], got {}",
                e.attenuation
            )));
        }
        if !e.landmark_gain.is_finite() || e.landmark_gain < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "effects.landmark_gain must be a finite value >= 1, got {}",
                e.landmark_gain
            )));
        }
        if !e.flash_threshold.is_finite() {
            return Err(ConfigError::Invalid("effects.flash_threshold must be finite".to_string()));
        }
        if !(0.0..=1.0).contains(&e.flash_opacity) {
            return Err(ConfigError::Invalid(format!(
                "effects.flash_opacity must be within [0, 1], got {}",
                e.flash_opacity
            )));
        }
        if e.sample_stride == 0 {
            return Err(ConfigError::Invalid("effects.sample_stride must be at least 1".to_string()));
        }
        if self.inference.timeout_ms == 0 {
            return Err(ConfigError::Invalid("inference.timeout_ms must be at least 1".to_string()));
        }
        if self.present.refresh_hz == 0 {
            return Err(ConfigError::Invalid("present.refresh_hz must be at least 1".to_string()));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigError::Invalid("capture size must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config = FlashcamConfig::from_json("{}").unwrap();
        assert_eq!(config, FlashcamConfig::default());
        assert_eq!(config.effects.attenuation, 0.25);
        assert_eq!(config.effects.sample_stride, 100);
        assert_eq!(config.inference.timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_override() {
        let config = FlashcamConfig::from_json(
            r#"{ "effects": { "landmark_gain": 1.1, "flash_threshold": 55 }, "capture": { "device": "1" } }"#,
        )
        .unwrap();

        assert_eq!(config.effects.landmark_gain, 1.1);
        assert_eq!(config.effects.flash_threshold, 55.0);
        assert_eq!(config.effects.attenuation, 0.25);
        assert_eq!(config.capture.device, "1");
        assert_eq!(config.capture.width, 720);
    }

    #[test]
    fn test_validation() {
        let cases = [
            r#"{ "effects": { "attenuation": 1.5 } }"#,
            r#"{ "effects": { "landmark_gain": 0.5 } }"#,
            r#"{ "effects": { "flash_opacity": -0.1 } }"#,
            r#"{ "effects": { "sample_stride": 0 } }"#,
            r#"{ "inference": { "timeout_ms": 0 } }"#,
            r#"{ "present": { "refresh_hz": 0 } }"#,
            r#"{ "capture": { "width": 0 } }"#,
        ];
        for case in cases {
            assert!(
                matches!(FlashcamConfig::from_json(case), Err(ConfigError::Invalid(_))),
                "expected {} to be rejected",
                case
            );
        }
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            FlashcamConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join("flashcam-config-that-does-not-exist.json");
        assert!(matches!(FlashcamConfig::load(&path), Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_round_trip_file() {
        let path = std::env::temp_dir().join(format!("flashcam-config-{}.json", std::process::id()));
        let mut config = FlashcamConfig::default();
        config.effects.attenuation = 0.4;
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = FlashcamConfig::load(&path).unwrap();
        let _ = fs::remove_file(&path);

        assert_eq!(loaded.effects.attenuation, 0.4);
    }
}
