//! Token counting and estimation
//!
//! Counts are estimates tuned per model family; exact counts come back from
//! providers in `usage` and the ledger prefers those. The estimator exists
//! for budget checks and cost/latency routing, where being deterministic and
//! cheap matters more than being exact.

use crate::llm::CompletionRequest;
use crate::config::ModelMapping;

/// Model families with distinct token densities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Gpt,
    Claude,
    Cohere,
    Llama,
    Unknown,
}

impl ModelFamily {
    /// Family from the logical-id prefix, e.g. `anthropic.claude-3-sonnet`.
    pub fn of(logical_id: &str) -> Self {
        let id = logical_id.to_ascii_lowercase();
        if id.starts_with("openai.") || id.starts_with("azure") || id.contains("gpt") {
            ModelFamily::Gpt
        } else if id.starts_with("anthropic.") || id.contains("claude") {
            ModelFamily::Claude
        } else if id.starts_with("cohere.") || id.contains("command") {
            ModelFamily::Cohere
        } else if id.starts_with("meta.") || id.contains("llama") {
            ModelFamily::Llama
        } else {
            ModelFamily::Unknown
        }
    }

    /// Completion-length assumption when the caller sets no `max_tokens`.
    pub fn default_completion_tokens(&self) -> u32 {
        match self {
            ModelFamily::Gpt => 1024,
            ModelFamily::Claude => 2048,
            _ => 512,
        }
    }
}

/// Token estimate for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub prompt_tokens: u32,
    pub est_completion_tokens: u32,
    pub total_tokens: u32,
}

/// Tokens GPT-family chat framing adds per message.
const GPT_MESSAGE_OVERHEAD: u32 = 4;

/// Count tokens for `text` under the encoder of `logical_id`'s family.
///
/// Deterministic; returns 0 for empty text; walks `char` boundaries so
/// malformed or multi-byte input never panics.
pub fn count_tokens(text: &str, logical_id: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    match ModelFamily::of(logical_id) {
        ModelFamily::Gpt => count_bpe_like(text),
        ModelFamily::Claude => chars_per_token(text, 3.5),
        ModelFamily::Cohere => count_words_and_punct(text),
        ModelFamily::Llama => chars_per_token(text, 3.8),
        ModelFamily::Unknown => chars_per_token(text, 4.0),
    }
}

/// Prompt + completion estimate for a request against its mapping.
///
/// `est_completion_tokens` is `max_tokens` when set, else the family default,
/// always clamped to the remaining context window (floor 0).
pub fn estimate_for_request(request: &CompletionRequest, mapping: &ModelMapping) -> TokenEstimate {
    let family = ModelFamily::of(&request.model);

    let mut prompt_tokens: u32 = request
        .messages
        .iter()
        .map(|m| count_tokens(&m.content, &request.model))
        .sum();
    if family == ModelFamily::Gpt {
        prompt_tokens += GPT_MESSAGE_OVERHEAD * request.messages.len() as u32;
    }

    let remaining = mapping.context_window.saturating_sub(prompt_tokens);
    let requested = request
        .max_tokens
        .unwrap_or_else(|| family.default_completion_tokens());
    let est_completion_tokens = requested.min(remaining);

    TokenEstimate {
        prompt_tokens,
        est_completion_tokens,
        total_tokens: prompt_tokens + est_completion_tokens,
    }
}

/// BPE-style segmentation estimate: words weighted by length, punctuation and
/// digits counted individually. Tracks observed GPT tokenizer output closely
/// enough for budgeting.
fn count_bpe_like(text: &str) -> u32 {
    let mut tokens: u32 = 0;
    for word in text.split_whitespace() {
        let chars = word.chars().count() as u32;
        if chars == 0 {
            continue;
        }
        let punct = word.chars().filter(|c| c.is_ascii_punctuation()).count() as u32;
        // A word contributes roughly one token per 4 characters, minimum one;
        // punctuation usually splits off as its own token.
        tokens += ((chars - punct.min(chars)) + 3) / 4 + punct;
        tokens = tokens.max(1);
    }
    tokens.max(1)
}

fn count_words_and_punct(text: &str) -> u32 {
    let words = text.split_whitespace().count() as u32;
    let punct = text.chars().filter(|c| c.is_ascii_punctuation()).count() as u32;
    (words + punct / 2).max(1)
}

fn chars_per_token(text: &str, ratio: f64) -> u32 {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }
    ((chars as f64 / ratio).ceil() as u32).max(1)
}
