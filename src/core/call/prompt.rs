//! Layered call prompts.
//!
//! A prompt is three blocks joined in order: universal rules, business
//! content, call-type block. Caller context from the lead store is appended
//! last. The compact variant truncates only the business block so the first
//! greeting can start sooner; the full prompt replaces it once, after the
//! greeting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::realtime::MAX_INSTRUCTIONS_CHARS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("instructions are {len} chars, limit is {limit}")]
    InstructionsTooLong { len: usize, limit: usize },
}

/// Prompt text for one business and call direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptBundle {
    #[serde(default)]
    pub universal: String,
    #[serde(default)]
    pub business: String,
    #[serde(default)]
    pub call_type: String,
}

/// Prompts ready to send, produced once per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    /// Sent with the first session configuration
    pub initial: String,
    /// Set when `initial` was compact; sent once after the greeting
    pub upgrade: Option<String>,
}

/// Cut `text` to at most `max_chars` characters, backing up to a word boundary.
fn truncate_at_word(text: &str, max_chars: usize) -> &str {
    if text.chars().count() <= max_chars {
        return text;
    }
    let byte_end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let cut = &text[..byte_end];
    match cut.rfind(char::is_whitespace) {
        Some(ws) if ws > 0 => cut[..ws].trim_end(),
        _ => cut,
    }
}

impl PromptBundle {
    fn join(&self, business: &str, lead_context: Option<&str>) -> String {
        let mut blocks: Vec<&str> = [self.universal.as_str(), business, self.call_type.as_str()]
            .into_iter()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .collect();
        if let Some(ctx) = lead_context.map(str::trim).filter(|c| !c.is_empty()) {
            blocks.push(ctx);
        }
        blocks.join("\n\n")
    }

    pub fn full(&self, lead_context: Option<&str>) -> String {
        self.join(&self.business, lead_context)
    }

    /// Business block truncated to `business_chars`.
    pub fn compact(&self, business_chars: usize, lead_context: Option<&str>) -> String {
        self.join(truncate_at_word(self.business.trim(), business_chars), lead_context)
    }

    /// Build the initial prompt and the optional one-time upgrade.
    ///
    /// `compact_business_chars` of `None` disables the compact greeting.
    /// The full prompt must fit the provider limit; a compact prompt that
    /// would not be shorter than the full one is not used.
    pub fn compose(
        &self,
        compact_business_chars: Option<usize>,
        lead_context: Option<&str>,
    ) -> Result<ComposedPrompt, PromptError> {
        let full = self.full(lead_context);
        let len = full.chars().count();
        if len > MAX_INSTRUCTIONS_CHARS {
            return Err(PromptError::InstructionsTooLong {
                len,
                limit: MAX_INSTRUCTIONS_CHARS,
            });
        }

        match compact_business_chars {
            Some(chars) => {
                let compact = self.compact(chars, lead_context);
                if compact.len() < full.len() {
                    Ok(ComposedPrompt {
                        initial: compact,
                        upgrade: Some(full),
                    })
                } else {
                    Ok(ComposedPrompt {
                        initial: full,
                        upgrade: None,
                    })
                }
            }
            None => Ok(ComposedPrompt {
                initial: full,
                upgrade: None,
            }),
        }
    }
}
