//! Energy-based VAD detector implementation

use tracing::{debug, trace};

use super::config::VADConfig;

/// Floor used for digital silence, in dBFS.
const SILENCE_FLOOR_DBFS: f32 = -96.0;

/// Result of VAD processing for a single audio frame
#[derive(Debug, Clone, Default)]
pub struct VADResult {
    /// Whether the detector is inside a confirmed speech segment
    pub is_speech: bool,
    /// Speech probability (0.0 - 1.0)
    pub probability: f32,
    /// Whether speech just started (transition from silence to speech)
    pub speech_start: bool,
    /// Whether speech just ended (transition from speech to silence)
    pub speech_end: bool,
    /// Duration of the current speech segment in milliseconds, counted from
    /// its first voiced frame and including pauses shorter than the
    /// configured minimum silence
    pub speech_duration_ms: u32,
    /// Duration of current silence run in milliseconds
    pub silence_duration_ms: u32,
    /// Audio time of this frame's end since the detector was created
    pub timestamp_ms: u64,
}

/// State machine for VAD transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VADState {
    /// No speech detected
    Silence,
    /// Potential speech detected, waiting for confirmation
    PotentialSpeech,
    /// Confirmed speech in progress
    Speech,
    /// Potential end of speech, waiting for confirmation
    PotentialSilence,
}

/// Trait for Voice Activity Detection implementations
pub trait VoiceActivityDetector: Send + Sync {
    /// Process a single audio frame and return VAD result
    fn process_frame(&mut self, audio: &[i16]) -> VADResult;

    /// Reset internal state (call when starting a new audio stream)
    fn reset(&mut self);

    /// Get the current speech probability
    fn speech_probability(&self) -> f32;

    /// Check if currently in speech state
    fn is_speaking(&self) -> bool;

    /// Get the configuration
    fn config(&self) -> &VADConfig;
}

/// Frame energy in dBFS.
pub fn frame_dbfs(audio: &[i16]) -> f32 {
    if audio.is_empty() {
        return SILENCE_FLOOR_DBFS;
    }
    let sum: f64 = audio.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let rms = (sum / audio.len() as f64).sqrt() / 32768.0;
    if rms <= 0.0 {
        SILENCE_FLOOR_DBFS
    } else {
        (20.0 * rms.log10() as f32).max(SILENCE_FLOOR_DBFS)
    }
}

/// RMS-threshold detector with onset and release hysteresis.
///
/// Cheap enough to run on every 20ms caller frame inside the ingress task.
#[derive(Debug)]
pub struct EnergyVAD {
    config: VADConfig,
    state: VADState,
    current_probability: f32,
    /// Voiced audio since the last unvoiced frame (onset confirmation)
    voiced_run_ms: u32,
    /// Unvoiced audio since the last voiced frame
    silence_run_ms: u32,
    /// Length of the current segment including tolerated gaps
    segment_ms: u32,
    elapsed_ms: u64,
}

impl EnergyVAD {
    pub fn new(config: VADConfig) -> Self {
        debug!(
            "Energy VAD initialized: threshold={:.1}dBFS, min_speech={}ms, min_silence={}ms",
            config.threshold_dbfs, config.min_speech_duration_ms, config.min_silence_duration_ms
        );
        Self {
            config,
            state: VADState::Silence,
            current_probability: 0.0,
            voiced_run_ms: 0,
            silence_run_ms: 0,
            segment_ms: 0,
            elapsed_ms: 0,
        }
    }

    fn frame_ms(&self, audio: &[i16]) -> u32 {
        (audio.len() as u64 * 1000 / self.config.sample_rate.max(1) as u64) as u32
    }

    /// Map energy onto 0..1 around the threshold (±10dB).
    fn probability(&self, dbfs: f32) -> f32 {
        ((dbfs - self.config.threshold_dbfs + 10.0) / 20.0).clamp(0.0, 1.0)
    }

    pub fn process_frame(&mut self, audio: &[i16]) -> VADResult {
        let frame_ms = self.frame_ms(audio);
        let dbfs = frame_dbfs(audio);
        let voiced = dbfs >= self.config.threshold_dbfs;
        self.current_probability = self.probability(dbfs);
        self.elapsed_ms += frame_ms as u64;

        if voiced {
            self.voiced_run_ms += frame_ms;
            self.silence_run_ms = 0;
        } else {
            self.silence_run_ms += frame_ms;
            self.voiced_run_ms = 0;
        }

        let mut speech_start = false;
        let mut speech_end = false;
        let prev_state = self.state;

        self.state = match (self.state, voiced) {
            (VADState::Silence, true) => {
                self.segment_ms = frame_ms;
                self.confirm_onset(&mut speech_start)
            }
            (VADState::Silence, false) => VADState::Silence,
            (VADState::PotentialSpeech, true) => {
                self.segment_ms += frame_ms;
                self.confirm_onset(&mut speech_start)
            }
            (VADState::PotentialSpeech, false) => {
                self.segment_ms = 0;
                VADState::Silence
            }
            (VADState::Speech | VADState::PotentialSilence, true) => {
                self.segment_ms += frame_ms;
                VADState::Speech
            }
            (VADState::Speech | VADState::PotentialSilence, false) => {
                self.segment_ms += frame_ms;
                if self.silence_run_ms >= self.config.min_silence_duration_ms {
                    speech_end = true;
                    debug!(
                        "Speech ended after {}ms segment ({}ms trailing silence)",
                        self.segment_ms, self.silence_run_ms
                    );
                    self.segment_ms = 0;
                    VADState::Silence
                } else {
                    VADState::PotentialSilence
                }
            }
        };

        let is_speech = matches!(self.state, VADState::Speech | VADState::PotentialSilence);
        let result = VADResult {
            is_speech,
            probability: self.current_probability,
            speech_start,
            speech_end,
            speech_duration_ms: if self.state == VADState::Silence {
                0
            } else {
                self.segment_ms
            },
            silence_duration_ms: self.silence_run_ms,
            timestamp_ms: self.elapsed_ms,
        };

        trace!(
            "VAD frame: {:.1}dBFS prob={:.2} state={:?}->{:?}",
            dbfs, self.current_probability, prev_state, self.state
        );

        result
    }

    fn confirm_onset(&self, speech_start: &mut bool) -> VADState {
        if self.voiced_run_ms >= self.config.min_speech_duration_ms {
            *speech_start = true;
            VADState::Speech
        } else {
            VADState::PotentialSpeech
        }
    }

    pub fn reset(&mut self) {
        self.state = VADState::Silence;
        self.current_probability = 0.0;
        self.voiced_run_ms = 0;
        self.silence_run_ms = 0;
        self.segment_ms = 0;
    }
}

impl VoiceActivityDetector for EnergyVAD {
    fn process_frame(&mut self, audio: &[i16]) -> VADResult {
        EnergyVAD::process_frame(self, audio)
    }

    fn reset(&mut self) {
        EnergyVAD::reset(self)
    }

    fn speech_probability(&self) -> f32 {
        self.current_probability
    }

    fn is_speaking(&self) -> bool {
        matches!(self.state, VADState::Speech | VADState::PotentialSilence)
    }

    fn config(&self) -> &VADConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16) -> Vec<i16> {
        (0..160)
            .map(|n| if n % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    fn silence() -> Vec<i16> {
        vec![0; 160]
    }

    #[test]
    fn test_vad_result_default() {
        let result = VADResult::default();
        assert!(!result.is_speech);
        assert_eq!(result.probability, 0.0);
        assert!(!result.speech_start);
        assert!(!result.speech_end);
    }

    #[test]
    fn test_frame_dbfs() {
        assert_eq!(frame_dbfs(&silence()), SILENCE_FLOOR_DBFS);
        let full = frame_dbfs(&tone(i16::MAX));
        assert!(full > -0.1 && full <= 0.0);
        let quiet = frame_dbfs(&tone(100));
        assert!(quiet < -40.0);
    }

    #[test]
    fn test_onset_requires_min_speech() {
        let mut vad = EnergyVAD::new(VADConfig::default());

        let r1 = vad.process_frame(&tone(8000));
        assert!(!r1.is_speech);
        let r2 = vad.process_frame(&tone(8000));
        assert!(!r2.is_speech);
        let r3 = vad.process_frame(&tone(8000));
        assert!(r3.is_speech);
        assert!(r3.speech_start);
        assert_eq!(r3.speech_duration_ms, 60);
    }

    #[test]
    fn test_noise_spike_is_rejected() {
        let mut vad = EnergyVAD::new(VADConfig::default());
        vad.process_frame(&tone(8000));
        let r = vad.process_frame(&silence());
        assert!(!r.is_speech);
        assert_eq!(r.speech_duration_ms, 0);
    }

    #[test]
    fn test_short_pause_keeps_segment() {
        let mut vad = EnergyVAD::new(VADConfig::default());
        for _ in 0..5 {
            vad.process_frame(&tone(8000));
        }
        // 100ms gap < 200ms min silence
        for _ in 0..5 {
            let r = vad.process_frame(&silence());
            assert!(r.is_speech);
        }
        let r = vad.process_frame(&tone(8000));
        assert!(r.is_speech);
        assert_eq!(r.speech_duration_ms, 220);
    }

    #[test]
    fn test_speech_end_after_min_silence() {
        let mut vad = EnergyVAD::new(VADConfig::default());
        for _ in 0..10 {
            vad.process_frame(&tone(8000));
        }
        let mut ended = false;
        for _ in 0..10 {
            let r = vad.process_frame(&silence());
            if r.speech_end {
                ended = true;
                assert!(!r.is_speech);
                assert_eq!(r.silence_duration_ms, 200);
            }
        }
        assert!(ended);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn test_reset() {
        let mut vad = EnergyVAD::new(VADConfig::default());
        for _ in 0..5 {
            vad.process_frame(&tone(8000));
        }
        assert!(vad.is_speaking());
        vad.reset();
        assert!(!vad.is_speaking());
        assert_eq!(vad.speech_probability(), 0.0);
    }
}
