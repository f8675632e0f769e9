//! HTTP and WebSocket request handlers
//!
//! - `api` - health check and live call listing
//! - `telephony` - carrier media stream WebSocket

pub mod api;
pub mod telephony;

pub use telephony::telephony_handler;
