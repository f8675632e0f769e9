pub mod audio;
pub mod call;
pub mod realtime;
pub mod stores;
pub mod vad;

// Re-export commonly used types for convenience
pub use audio::{AudioError, AudioFrame, AudioResult, DropCounters, DropReason, FrameQueue};

pub use call::{
    CallDirection, CallEngine, CallError, CallHandle, CallMetadata, CallRegistry, CallResult,
    CallServices, CallState, CallTimingConfig, CloseReason, TransportCommand, spawn_call,
};

pub use realtime::{
    BaseRealtime, RealtimeClient, RealtimeConfig, RealtimeError, RealtimeEvent, RealtimeProvider,
    RealtimeResult, create_realtime_client, get_supported_realtime_providers,
};

pub use stores::{LeadStore, PromptStore, RecordingSink, StoreError, StoreResult};

pub use vad::{EnergyVAD, VADConfig, VADResult};
