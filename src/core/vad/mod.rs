//! Voice Activity Detection (VAD) module
//!
//! Local, acoustic-level speech detection on caller audio. Provider-side
//! speech events arrive late and cannot distinguish the caller from an echo
//! of the AI's own voice, so the call engine verifies speech here before it:
//!
//! - confirms a barge-in (minimum continuous speech)
//! - confirms a human answered an outbound call
//! - measures caller silence for the hangup watchdog
//!
//! # Example
//!
//! ```rust,ignore
//! use callvox_gateway::core::vad::{EnergyVAD, VADConfig, VoiceActivityDetector};
//!
//! let mut vad = EnergyVAD::new(VADConfig::default());
//!
//! // 160 samples at 8kHz = 20ms
//! let result = vad.process_frame(&samples);
//! if result.speech_start {
//!     println!("Speech started!");
//! }
//! ```

pub mod config;
pub mod detector;

pub use config::VADConfig;
pub use detector::{EnergyVAD, VADResult, VoiceActivityDetector, frame_dbfs};

/// Create a VAD instance with the given configuration
pub fn create_vad(config: VADConfig) -> Result<EnergyVAD, String> {
    config.validate()?;
    Ok(EnergyVAD::new(config))
}
