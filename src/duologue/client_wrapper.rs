use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A GenerationClient is a thin wrapper around a specific cloud LLM service.
/// It exposes exactly one capability — generate text for a prompt and report
/// how many tokens were spent — so the engine can treat Claude, Grok, or any
/// future participant interchangeably. It keeps no conversation state; the
/// [`ProtocolEngine`](crate::ProtocolEngine) owns turn history and context.

/// How many tokens were spent on prompt vs. completion.
///
/// `total` is `prompt + completion` when the provider reports usage, and `0`
/// when it does not (or when the turn failed before any tokens were billed).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt: usize,
    pub completion: usize,
    pub total: usize,
}

impl TokenUsage {
    pub fn new(prompt: usize, completion: usize) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }

    /// The all-zero usage recorded for turns that never reached the provider.
    pub fn zero() -> Self {
        Self::default()
    }
}

/// The text and token accounting returned by a successful generation call.
#[derive(Clone, Debug)]
pub struct GenerationOutput {
    pub text: String,
    pub usage: TokenUsage,
}

/// The three failure classes the engine distinguishes for retry purposes.
///
/// `Timeout` and `Transient` are eligible for exponential-backoff retry;
/// `Fatal` terminates the turn immediately without consuming the remaining
/// retry budget. Clients classify provider errors into `Transient`/`Fatal`;
/// `Timeout` is normally produced by the engine's own per-turn deadline.
#[derive(Clone, Debug)]
pub enum GenerationError {
    /// The call exceeded its deadline.
    Timeout(String),
    /// Connection failure or an explicit rate-limit signal — worth retrying.
    Transient(String),
    /// Any other service-reported error — retrying will not help.
    Fatal(String),
}

impl GenerationError {
    /// Whether the backoff/retry policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, GenerationError::Fatal(_))
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::Timeout(msg) => write!(f, "{}", msg),
            GenerationError::Transient(msg) => write!(f, "transient error: {}", msg),
            GenerationError::Fatal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for GenerationError {}

/// Trait defining the interface to interact with a text-generation service.
///
/// Implementations must be safe for concurrent use: a parallel topology phase
/// will have several turns in flight against the same client at once.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// The model this client targets when the plan does not override one.
    fn model_name(&self) -> &str;

    /// Generate a completion for `prompt` against `model`.
    ///
    /// Returns the generated text plus token usage, or one of the three
    /// typed failure classes. Implementations should not retry internally —
    /// the engine owns the backoff policy.
    async fn generate(
        &self,
        prompt: &str,
        model: &str,
    ) -> Result<GenerationOutput, GenerationError>;
}
