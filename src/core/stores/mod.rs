//! Collaborator stores consulted around a call.
//!
//! - [`PromptStore`]: prompt blocks and voice per business, read at call start
//! - [`LeadStore`]: caller context looked up by phone number
//! - [`RecordingSink`]: post-call recording and transcript persistence
//!
//! None of these sit on the real-time path: prompt and lead lookups run
//! during setup, and persistence runs after the call has ended.

pub mod lead;
pub mod prompt;
pub mod recording;

pub use lead::{HttpLeadStore, InMemoryLeadStore, LeadContext, LeadStore};
pub use prompt::{PromptCatalog, PromptStore, StaticPromptStore};
pub use recording::{CallRecorder, ObjectStoreSink, RecordingSink, recording_object_key};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
