//! Caller context lookup.
//!
//! The lead store is consulted once per call, in parallel with the provider
//! connect. A miss or a failure never blocks the call: the prompt is simply
//! built without caller context.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

use super::StoreResult;

/// What the lead system knows about a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadContext {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl LeadContext {
    /// Block appended to the call prompt. `None` when there is nothing to say.
    pub fn prompt_context(&self) -> Option<String> {
        let mut lines = Vec::new();
        if let Some(name) = self.name.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(format!("- Name: {}", name.trim()));
        }
        if let Some(company) = self.company.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(format!("- Company: {}", company.trim()));
        }
        for (key, value) in &self.fields {
            if !value.trim().is_empty() {
                lines.push(format!("- {}: {}", key, value.trim()));
            }
        }
        if let Some(notes) = self.notes.as_deref().filter(|s| !s.trim().is_empty()) {
            lines.push(format!("- Notes: {}", notes.trim()));
        }
        if lines.is_empty() {
            return None;
        }
        Some(format!("Caller context:\n{}", lines.join("\n")))
    }
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Look up a caller by phone number. `Ok(None)` for an unknown number.
    async fn find_by_phone(&self, phone: &str) -> StoreResult<Option<LeadContext>>;
}

/// Lead store behind an HTTP API: `GET {base_url}/leads?phone=<number>`.
///
/// `200` carries a [`LeadContext`] JSON body, `404` means unknown caller.
pub struct HttpLeadStore {
    client: Client,
    base_url: String,
    api_key: Option<Zeroizing<String>>,
}

impl HttpLeadStore {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> StoreResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(Zeroizing::new),
        })
    }
}

#[async_trait]
impl LeadStore for HttpLeadStore {
    async fn find_by_phone(&self, phone: &str) -> StoreResult<Option<LeadContext>> {
        let mut request = self
            .client
            .get(format!("{}/leads", self.base_url))
            .query(&[("phone", phone)]);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key.as_str());
        }

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(phone = %phone, "No lead for caller");
            return Ok(None);
        }
        let lead = response.error_for_status()?.json::<LeadContext>().await?;
        Ok(Some(lead))
    }
}

/// Lead store held in memory, keyed by phone number.
#[derive(Default)]
pub struct InMemoryLeadStore {
    leads: DashMap<String, LeadContext>,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, phone: impl Into<String>, lead: LeadContext) {
        self.leads.insert(phone.into(), lead);
    }
}

#[async_trait]
impl LeadStore for InMemoryLeadStore {
    async fn find_by_phone(&self, phone: &str) -> StoreResult<Option<LeadContext>> {
        Ok(self.leads.get(phone).map(|l| l.clone()))
    }
}
