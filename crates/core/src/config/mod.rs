use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, WavtapError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub frames: FrameConfig,
}

impl AppConfig {
    /// Parses a JSON document. Missing sections fall back to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.frames.validate()
    }
}

/// Configuration of a playback session and its analysis tap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub sample_rate: u32,
    /// Window length of the analysis transform. Must be a power of two.
    pub fft_size: usize,
    /// Weight of the previous magnitude when smoothing successive spectra.
    pub smoothing_time_constant: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            fft_size: 8192,
            smoothing_time_constant: 0.1,
        }
    }
}

impl SessionConfig {
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(WavtapError::Config("sample_rate must be positive".into()));
        }
        if self.fft_size < 32 || !self.fft_size.is_power_of_two() {
            return Err(WavtapError::Config(format!(
                "fft_size must be a power of two of at least 32, got {}",
                self.fft_size
            )));
        }
        if !(0.0..=1.0).contains(&self.smoothing_time_constant) {
            return Err(WavtapError::Config(format!(
                "smoothing_time_constant must lie in [0, 1], got {}",
                self.smoothing_time_constant
            )));
        }
        Ok(())
    }

    /// Number of magnitude bins reported by the analysis tap.
    pub fn bin_count(&self) -> usize {
        self.fft_size / 2
    }
}

/// Configuration of the frame loop driving visual updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub refresh_hz: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { refresh_hz: 60 }
    }
}

impl FrameConfig {
    pub fn validate(&self) -> Result<()> {
        if self.refresh_hz == 0 {
            return Err(WavtapError::Config("refresh_hz must be positive".into()));
        }
        Ok(())
    }
}
