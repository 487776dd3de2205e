use crate::client_wrapper::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One executed exchange with a generation service.
///
/// Invariants: `retry_count` counts only failed attempts; when `error` is set,
/// `response` holds an `[Error: …]` placeholder rather than being empty, and
/// `cost` is `0.0`; otherwise `cost` is always derived from `(model, tokens)`
/// via [`calculate_cost`](crate::pricing::calculate_cost).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Turn {
    /// 1-based sequence number, unique within a session.
    pub number: usize,
    /// Free-text role label from the plan (e.g. `"opening_statement"`).
    pub role: String,
    /// Participant tag the turn was dispatched to (e.g. `"claude"`).
    pub participant: String,
    /// Resolved model identifier the provider was called with.
    pub model: String,
    /// Fully rendered prompt text as sent to the provider.
    pub prompt: String,
    /// Generated text, or an error placeholder when the turn failed.
    pub response: String,
    pub tokens: TokenUsage,
    /// Wall-clock latency in seconds, including retries and backoff sleeps.
    pub latency: f64,
    /// RFC 3339 timestamp of turn completion.
    pub timestamp: String,
    /// Sequence numbers of the prior turns this turn's context was built from.
    pub context_from: Vec<usize>,
    pub cost: f64,
    pub error: Option<String>,
    pub retry_count: usize,
}

/// A complete orchestration run.
///
/// Turns are appended as they complete; under a parallel topology that order
/// is completion order, not sequence-number order. The aggregates are always
/// recomputed from the turn list via [`Conversation::update_totals`], never
/// accumulated incrementally.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub session_id: String,
    pub mode: String,
    pub topic: String,
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub started_at: String,
    pub completed_at: Option<String>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_tokens: usize,
}

impl Conversation {
    pub fn new(
        session_id: impl Into<String>,
        mode: impl Into<String>,
        topic: impl Into<String>,
        metadata: HashMap<String, Value>,
        started_at: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            mode: mode.into(),
            topic: topic.into(),
            turns: Vec::new(),
            metadata,
            started_at: started_at.into(),
            completed_at: None,
            total_cost: 0.0,
            total_tokens: 0,
        }
    }

    /// Recompute total cost and tokens as sums over the turn list.
    pub fn update_totals(&mut self) {
        self.total_cost = self.turns.iter().map(|t| t.cost).sum();
        self.total_tokens = self.turns.iter().map(|t| t.tokens.total).sum();
    }

    /// Look up a completed turn by its sequence number.
    pub fn turn_by_number(&self, number: usize) -> Option<&Turn> {
        self.turns.iter().find(|t| t.number == number)
    }
}
