//! Shared application state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::{RecordingBackend, ServerConfig};
use crate::core::call::{CallRegistry, CallServices};
use crate::core::stores::{
    HttpLeadStore, LeadStore, ObjectStoreSink, PromptCatalog, PromptStore, RecordingSink,
    StaticPromptStore, StoreResult,
};

/// Why a telephony socket was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
}

/// One occupied call slot; released on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub services: CallServices,
    pub started_at: Instant,
    active_connections: Arc<AtomicUsize>,
}

impl AppState {
    /// Build the collaborators named in `config` and the call services.
    pub fn new(config: ServerConfig) -> StoreResult<Arc<Self>> {
        let prompts: Arc<dyn PromptStore> = match &config.prompts_path {
            Some(path) => Arc::new(StaticPromptStore::from_file(
                path.clone(),
                Duration::from_secs(config.prompts_cache_ttl_seconds),
            )),
            None => Arc::new(StaticPromptStore::from_catalog(PromptCatalog::default())),
        };

        let leads: Option<Arc<dyn LeadStore>> = match &config.leads_base_url {
            Some(base_url) => Some(Arc::new(HttpLeadStore::new(
                base_url,
                config.leads_api_key.clone(),
                Duration::from_millis(config.leads_timeout_ms),
            )?)),
            None => None,
        };

        let prefix = config.recording_prefix.clone();
        let recordings: Option<Arc<dyn RecordingSink>> = match &config.recording {
            None => None,
            Some(RecordingBackend::Memory) => Some(Arc::new(ObjectStoreSink::memory(prefix))),
            Some(RecordingBackend::Local { path }) => {
                Some(Arc::new(ObjectStoreSink::local(path, prefix)?))
            }
            Some(RecordingBackend::S3 { bucket, region }) => Some(Arc::new(ObjectStoreSink::s3(
                bucket,
                region.as_deref(),
                prefix,
            )?)),
        };

        info!(
            prompts = config.prompts_path.is_some(),
            leads = leads.is_some(),
            recording = recordings.is_some(),
            "Call collaborators configured"
        );

        let services = CallServices {
            default_provider: config.default_provider,
            providers: Arc::new(config.provider_configs()),
            timing: config.timing.clone(),
            pipeline: config.pipeline.clone(),
            vad: config.vad.clone(),
            prompts,
            leads,
            recordings,
            registry: Arc::new(CallRegistry::new()),
        };

        Ok(Self::with_services(config, services))
    }

    /// State around prebuilt services; tests use this to inject in-memory stores.
    pub fn with_services(config: ServerConfig, services: CallServices) -> Arc<Self> {
        Arc::new(Self {
            config,
            services,
            started_at: Instant::now(),
            active_connections: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.services.registry
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.config.start_timeout_ms)
    }

    /// Claim a telephony socket slot under `max_concurrent_calls`.
    pub fn try_acquire_connection(&self) -> Result<ConnectionSlot, ConnectionLimitError> {
        let limit = self.config.max_concurrent_calls.unwrap_or(usize::MAX);
        self.active_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| ConnectionLimitError::GlobalLimitReached)?;
        Ok(ConnectionSlot {
            active: self.active_connections.clone(),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.active_connections.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(limit: Option<usize>) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.openai_api_key = Some("sk-test".to_string());
        config.max_concurrent_calls = limit;
        config
    }

    #[test]
    fn test_connection_slots_are_released_on_drop() {
        let state = AppState::new(config(Some(2))).unwrap();
        assert_eq!(state.connection_count(), 0);

        let a = state.try_acquire_connection().unwrap();
        let _b = state.try_acquire_connection().unwrap();
        assert_eq!(state.connection_count(), 2);
        assert_eq!(
            state.try_acquire_connection().unwrap_err(),
            ConnectionLimitError::GlobalLimitReached
        );

        drop(a);
        assert_eq!(state.connection_count(), 1);
        assert!(state.try_acquire_connection().is_ok());
    }

    #[test]
    fn test_unlimited_connections() {
        let state = AppState::new(config(None)).unwrap();
        let slots: Vec<_> = (0..100)
            .map(|_| state.try_acquire_connection().unwrap())
            .collect();
        assert_eq!(state.connection_count(), 100);
        drop(slots);
        assert_eq!(state.connection_count(), 0);
    }

    #[test]
    fn test_services_from_config() {
        let mut config = config(None);
        config.recording = Some(RecordingBackend::Memory);
        config.leads_base_url = Some("http://127.0.0.1:9".to_string());
        let state = AppState::new(config).unwrap();

        assert!(state.services.recordings.is_some());
        assert!(state.services.leads.is_some());
        assert_eq!(state.services.providers.len(), 1);
        assert!(state.registry().is_empty());
    }
}
