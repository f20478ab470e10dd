//! Pipeline configuration, loadable from TOML.

use crate::enums::{Device, Precision};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Clinical intensity window and the range it is rescaled to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntensityWindow {
    pub a_min: f32,
    pub a_max: f32,
    pub b_min: f32,
    pub b_max: f32,
}

impl Default for IntensityWindow {
    fn default() -> Self {
        Self {
            a_min: -100.0,
            a_max: 200.0,
            b_min: 0.0,
            b_max: 1.0,
        }
    }
}

impl IntensityWindow {
    /// Clamp to `[a_min, a_max]` and map linearly onto `[b_min, b_max]`.
    #[inline]
    pub fn apply(&self, value: f32) -> f32 {
        let clipped = value.clamp(self.a_min, self.a_max);
        let scaled = (clipped - self.a_min) / (self.a_max - self.a_min);
        scaled * (self.b_max - self.b_min) + self.b_min
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ONNX export of the segmentation network.
    pub model_path: PathBuf,
    /// Canonical voxel spacing in millimetres.
    pub spacing: [f64; 3],
    /// Network input (patch) size in voxels.
    pub roi_size: [usize; 3],
    /// Fraction of the patch shared by neighbouring windows.
    pub overlap: f64,
    /// Patches per network call.
    pub sw_batch_size: usize,
    pub intensity: IntensityWindow,
    pub device: Device,
    pub precision: Precision,
    /// Inserted before the extension of the source name for mask files.
    pub mask_suffix: String,
    /// Prepended to the source name for the normalized copy.
    pub fixed_prefix: String,
    /// Requests admitted to the service queue at once.
    pub queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/liver_unet.onnx"),
            spacing: [1.5, 1.5, 2.0],
            roi_size: [64, 64, 64],
            overlap: 0.25,
            sw_batch_size: 1,
            intensity: IntensityWindow::default(),
            device: Device::Auto,
            precision: Precision::F32,
            mask_suffix: "_seg".to_string(),
            fixed_prefix: "fixed_".to_string(),
            queue_depth: 4,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "spacing must be positive, got {:?}",
                self.spacing
            )));
        }
        if self.roi_size.contains(&0) {
            return Err(ConfigError::Invalid(format!(
                "roi_size must be non-zero, got {:?}",
                self.roi_size
            )));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(ConfigError::Invalid(format!(
                "overlap must be in [0, 1), got {}",
                self.overlap
            )));
        }
        let window = &self.intensity;
        if !(window.a_max > window.a_min) || !(window.b_max > window.b_min) {
            return Err(ConfigError::Invalid(format!(
                "intensity bounds must be increasing, got {window:?}"
            )));
        }
        if self.sw_batch_size == 0 {
            return Err(ConfigError::Invalid("sw_batch_size must be at least 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be at least 1".into()));
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}
