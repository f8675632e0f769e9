//! Call timing thresholds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every tunable threshold of the call engine, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallTimingConfig {
    /// Barge-in: minimum continuous caller speech
    pub min_speech_ms: u64,
    /// Barge-in: minimum time since the AI turn started speaking
    pub anti_echo_cooldown_ms: u64,
    /// Barge-in: minimum time since the last AI audio chunk
    pub last_audio_age_ms: u64,
    /// Barge-in: hold-off after a confirmed interrupt
    pub interrupt_lock_ms: u64,
    /// Barge-in: transcript-triggered candidates older than this are stale
    pub late_transcript_ms: u64,
    /// Sustained speech that confirms a human answered an outbound call
    pub human_confirm_speech_ms: u64,
    /// Outbound calls with no human after this long are closed
    pub human_confirm_timeout_ms: u64,
    /// Caller and AI both silent for this long closes the call
    pub silence_hangup_ms: u64,
    /// An in-flight response request older than this is presumed lost
    pub stale_in_flight_ms: u64,
    /// Identical utterances inside this window trigger one response
    pub dedup_window_ms: u64,
    /// Diagnostics are logged when a response has no audio after this long
    pub first_audio_timeout_ms: u64,
    /// One response-create retry after a caller turn with no response
    pub response_retry_ms: u64,
    /// Wait for a cancel outcome before flushing anyway
    pub cancel_ack_timeout_ms: u64,
}

impl Default for CallTimingConfig {
    fn default() -> Self {
        Self {
            min_speech_ms: 150,
            anti_echo_cooldown_ms: 200,
            last_audio_age_ms: 150,
            interrupt_lock_ms: 700,
            late_transcript_ms: 600,
            human_confirm_speech_ms: 600,
            human_confirm_timeout_ms: 45_000,
            silence_hangup_ms: 20_000,
            stale_in_flight_ms: 6_000,
            dedup_window_ms: 4_000,
            first_audio_timeout_ms: 2_500,
            response_retry_ms: 3_000,
            cancel_ack_timeout_ms: 500,
        }
    }
}

impl CallTimingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(120..=180).contains(&self.min_speech_ms) {
            return Err(format!(
                "min_speech_ms must be between 120 and 180, got {}",
                self.min_speech_ms
            ));
        }
        let non_zero = [
            ("silence_hangup_ms", self.silence_hangup_ms),
            ("stale_in_flight_ms", self.stale_in_flight_ms),
            ("dedup_window_ms", self.dedup_window_ms),
            ("first_audio_timeout_ms", self.first_audio_timeout_ms),
            ("response_retry_ms", self.response_retry_ms),
            ("cancel_ack_timeout_ms", self.cancel_ack_timeout_ms),
            ("human_confirm_speech_ms", self.human_confirm_speech_ms),
            ("human_confirm_timeout_ms", self.human_confirm_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        if self.human_confirm_timeout_ms <= self.human_confirm_speech_ms {
            return Err("human_confirm_timeout_ms must exceed human_confirm_speech_ms".to_string());
        }
        Ok(())
    }

    #[inline]
    pub fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = CallTimingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interrupt_lock_ms, 700);
        assert_eq!(config.silence_hangup_ms, 20_000);
    }

    #[test]
    fn test_min_speech_range() {
        let config = CallTimingConfig {
            min_speech_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("min_speech_ms"));

        let config = CallTimingConfig {
            min_speech_ms: 180,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = CallTimingConfig {
            cancel_ack_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("cancel_ack_timeout_ms"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config: CallTimingConfig = serde_yaml::from_str("silence_hangup_ms: 30000").unwrap();
        assert_eq!(config.silence_hangup_ms, 30_000);
        assert_eq!(config.min_speech_ms, 150);
    }
}
