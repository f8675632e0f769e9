//! VAD configuration types

use serde::{Deserialize, Serialize};

/// Configuration for the energy-based voice activity detector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VADConfig {
    /// Frame energy (dBFS) at or above which a frame counts as speech.
    /// Telephony speech usually sits between -30 and -15 dBFS; line noise
    /// below -50 dBFS.
    pub threshold_dbfs: f32,

    /// Minimum speech duration before triggering speech_start (ms)
    /// Filters clicks and single-frame noise spikes
    pub min_speech_duration_ms: u32,

    /// Minimum silence duration before triggering speech_end (ms)
    /// Keeps a segment alive across short pauses between words
    pub min_silence_duration_ms: u32,

    /// Sample rate of the analysed audio (Hz)
    pub sample_rate: u32,
}

impl Default for VADConfig {
    fn default() -> Self {
        Self {
            threshold_dbfs: -38.0,
            min_speech_duration_ms: 60,
            min_silence_duration_ms: 200,
            sample_rate: 8000,
        }
    }
}

impl VADConfig {
    /// Create a new VADConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("VAD sample rate must be greater than 0".to_string());
        }
        if !(-96.0..=0.0).contains(&self.threshold_dbfs) {
            return Err(format!(
                "VAD threshold must be between -96 and 0 dBFS, got {}",
                self.threshold_dbfs
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VADConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sample_rate, 8000);
    }

    #[test]
    fn test_validate_rejects_positive_threshold() {
        let config = VADConfig {
            threshold_dbfs: 3.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_rate() {
        let config = VADConfig {
            sample_rate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
