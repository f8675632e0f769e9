//! Prompt catalog backed by a YAML file.
//!
//! ```yaml
//! universal: |
//!   You are a phone assistant. Keep answers short.
//! default_voice: alloy
//! default_business: acme
//! call_types:
//!   inbound: Greet the caller and ask how you can help.
//!   outbound: Introduce yourself and confirm you reached the right person.
//! businesses:
//!   acme:
//!     voice: shimmer
//!     content: |
//!       Acme Dental is open Monday to Friday.
//!     outbound: Remind the patient about their appointment.
//! ```
//!
//! The parsed catalog is cached; once the entry expires the file is read
//! again, so edits take effect without a restart.

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{StoreError, StoreResult};
use crate::core::call::prompt::PromptBundle;
use crate::core::call::state::CallDirection;

#[async_trait]
pub trait PromptStore: Send + Sync {
    /// Prompt blocks for a business and call direction.
    async fn get_prompt(
        &self,
        business_id: Option<&str>,
        direction: CallDirection,
    ) -> StoreResult<PromptBundle>;

    /// Voice configured for a business, if any.
    async fn get_voice(&self, business_id: Option<&str>) -> StoreResult<Option<String>>;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallTypeBlocks {
    #[serde(default)]
    pub inbound: String,
    #[serde(default)]
    pub outbound: String,
}

impl CallTypeBlocks {
    fn for_direction(&self, direction: CallDirection) -> &str {
        match direction {
            CallDirection::Inbound => &self.inbound,
            CallDirection::Outbound => &self.outbound,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusinessEntry {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub voice: Option<String>,
    /// Overrides the catalog-wide inbound block
    #[serde(default)]
    pub inbound: Option<String>,
    /// Overrides the catalog-wide outbound block
    #[serde(default)]
    pub outbound: Option<String>,
}

/// Parsed catalog file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptCatalog {
    #[serde(default)]
    pub universal: String,
    #[serde(default)]
    pub default_voice: Option<String>,
    #[serde(default)]
    pub default_business: Option<String>,
    #[serde(default)]
    pub call_types: CallTypeBlocks,
    #[serde(default)]
    pub businesses: HashMap<String, BusinessEntry>,
}

impl PromptCatalog {
    pub fn from_yaml(text: &str) -> StoreResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    fn business(&self, business_id: Option<&str>) -> StoreResult<Option<&BusinessEntry>> {
        let Some(id) = business_id.or(self.default_business.as_deref()) else {
            return Ok(None);
        };
        self.businesses
            .get(id)
            .map(Some)
            .ok_or_else(|| StoreError::NotFound(format!("business '{id}'")))
    }

    /// Resolve the bundle for a business. With no id and no default
    /// business, only the universal and call-type blocks are used.
    pub fn resolve(
        &self,
        business_id: Option<&str>,
        direction: CallDirection,
    ) -> StoreResult<PromptBundle> {
        let entry = self.business(business_id)?;
        let override_block = entry.and_then(|e| match direction {
            CallDirection::Inbound => e.inbound.as_deref(),
            CallDirection::Outbound => e.outbound.as_deref(),
        });
        Ok(PromptBundle {
            universal: self.universal.clone(),
            business: entry.map(|e| e.content.clone()).unwrap_or_default(),
            call_type: override_block
                .unwrap_or_else(|| self.call_types.for_direction(direction))
                .to_string(),
        })
    }

    pub fn voice(&self, business_id: Option<&str>) -> StoreResult<Option<String>> {
        let entry = self.business(business_id)?;
        Ok(entry
            .and_then(|e| e.voice.clone())
            .or_else(|| self.default_voice.clone()))
    }
}

enum CatalogSource {
    File(PathBuf),
    Inline(Arc<PromptCatalog>),
}

/// [`PromptStore`] over a YAML catalog with a TTL cache in front.
pub struct StaticPromptStore {
    source: CatalogSource,
    cache: Cache<String, Arc<PromptCatalog>>,
}

const CATALOG_KEY: &str = "catalog";

impl StaticPromptStore {
    pub fn from_file(path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            source: CatalogSource::File(path.into()),
            cache: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
        }
    }

    pub fn from_catalog(catalog: PromptCatalog) -> Self {
        Self {
            source: CatalogSource::Inline(Arc::new(catalog)),
            cache: Cache::builder().max_capacity(1).build(),
        }
    }

    async fn load(&self) -> StoreResult<Arc<PromptCatalog>> {
        match &self.source {
            CatalogSource::Inline(catalog) => Ok(catalog.clone()),
            CatalogSource::File(path) => {
                let path = path.clone();
                self.cache
                    .try_get_with(CATALOG_KEY.to_string(), async move {
                        debug!(path = %path.display(), "Loading prompt catalog");
                        let text = tokio::fs::read_to_string(&path).await?;
                        PromptCatalog::from_yaml(&text).map(Arc::new)
                    })
                    .await
                    .map_err(|e: Arc<StoreError>| match e.as_ref() {
                        StoreError::NotFound(what) => StoreError::NotFound(what.clone()),
                        other => StoreError::Unavailable(other.to_string()),
                    })
            }
        }
    }

    /// Drop the cached catalog so the next lookup re-reads the file.
    pub async fn invalidate(&self) {
        self.cache.invalidate(CATALOG_KEY).await;
    }
}

#[async_trait]
impl PromptStore for StaticPromptStore {
    async fn get_prompt(
        &self,
        business_id: Option<&str>,
        direction: CallDirection,
    ) -> StoreResult<PromptBundle> {
        self.load().await?.resolve(business_id, direction)
    }

    async fn get_voice(&self, business_id: Option<&str>) -> StoreResult<Option<String>> {
        self.load().await?.voice(business_id)
    }
}
