//! Telephony media stream WebSocket
//!
//! The carrier opens `GET /telephony/stream` and speaks the Twilio Media
//! Streams JSON protocol.
//!
//! ## Carrier → Gateway
//!
//! - **connected**: socket handshake, ignored
//! - **start**: stream and call ids, custom parameters (`direction`,
//!   `business_id`, `provider`, `from`, `to`), media format
//! - **media**: base64 μ-law 8kHz caller audio
//! - **mark**: playback marker acknowledgement
//! - **stop**: the call is over
//!
//! ## Gateway → Carrier
//!
//! - **media**: one paced 20ms frame of assistant audio
//! - **clear**: drop audio the carrier has buffered (barge-in)
//!
//! A socket must send `start` within the configured start timeout, and
//! `media` before `start` is closed with a policy-violation close frame.

mod handler;
pub mod messages;

pub use handler::telephony_handler;
