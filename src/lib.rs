//! # duologue
//!
//! duologue is an async engine for orchestrating multi-turn text-generation
//! dialogues between two (or more) LLM participants. A dialogue is described by
//! a [`PlanConfig`] — an ordered list of turn templates plus a topology — and
//! executed by the [`ProtocolEngine`], which handles per-turn timeouts,
//! exponential-backoff retries, token accounting, and cost tracking.
//!
//! The crate provides:
//!
//! * **Turn execution**: one retry/backoff/timeout state machine per turn, with
//!   transient errors retried and fatal ones surfaced immediately. A failed
//!   turn never aborts the session — it is recorded with its error and the
//!   dialogue continues.
//! * **Topologies**: `sequential` (each turn sees the results of the turns it
//!   declares as dependencies), `parallel` (independent turns run
//!   concurrently), and `mixed` (ordered phases of either kind).
//! * **Dynamic plans**: the [`DynamicEngine`] layers a variable store on top of
//!   the engine, substituting `<UPPER_SNAKE>` tokens into templates, extracting
//!   adaptive instructions from responses, and re-running a whole plan in
//!   bounded cycles until a lexical convergence test passes.
//! * **Provider clients**: [`GenerationClient`] implementations for Anthropic
//!   Claude and xAI Grok over their OpenAI-compatible chat surfaces.
//! * **Persistence**: a [`StateSink`] seam with a JSON-file implementation and
//!   a markdown transcript exporter.
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use duologue::clients::claude::ClaudeClient;
//! use duologue::clients::grok::GrokClient;
//! use duologue::{FileStateManager, ProtocolEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     duologue::init_logger();
//!
//!     let state = Arc::new(FileStateManager::new("sessions")?);
//!     let engine = ProtocolEngine::new(state)
//!         .with_participant(
//!             "claude",
//!             Arc::new(ClaudeClient::new_with_model_str(
//!                 &std::env::var("ANTHROPIC_KEY")?,
//!                 "claude-3-sonnet-20240229",
//!             )),
//!         )
//!         .with_participant(
//!             "grok",
//!             Arc::new(GrokClient::new_with_model_str(
//!                 &std::env::var("XAI_API_KEY")?,
//!                 "grok-4-fast-reasoning-latest",
//!             )),
//!         );
//!
//!     let conversation = engine
//!         .run("loop", "Rust error handling idioms", None, None)
//!         .await?;
//!
//!     println!(
//!         "{} turns, {} tokens, ${:.6}",
//!         conversation.turns.len(),
//!         conversation.total_tokens,
//!         conversation.total_cost
//!     );
//!     Ok(())
//! }
//! ```
//!
//! For self-modifying plans, wrap the engine in a [`DynamicEngine`] and call
//! [`DynamicEngine::run_dynamic`] with a task string and an optional
//! [`CycleConfig`].

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications embedding duologue can opt in to `RUST_LOG` driven diagnostics
/// without committing to a logging backend of their own.
///
/// ```rust
/// duologue::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

pub mod duologue;

// Re-export the key types so callers don't have to spell the module path.
pub use crate::duologue::client_wrapper;
pub use crate::duologue::client_wrapper::{
    GenerationClient, GenerationError, GenerationOutput, TokenUsage,
};
pub use crate::duologue::clients;
pub use crate::duologue::dynamic;
pub use crate::duologue::dynamic::{jaccard_similarity, ContextStore, CycleConfig, DynamicEngine};
pub use crate::duologue::engine;
pub use crate::duologue::engine::{ProtocolEngine, ProtocolError, TurnHooks};
pub use crate::duologue::plan;
pub use crate::duologue::plan::{Phase, PlanConfig, PlanLoader, Topology, TurnTemplate};
pub use crate::duologue::planner;
pub use crate::duologue::planner::{
    Complexity, ExecutionStrategy, StrategyKind, StrategyPlanner, Subtask,
};
pub use crate::duologue::pricing;
pub use crate::duologue::pricing::calculate_cost;
pub use crate::duologue::state;
pub use crate::duologue::state::{
    render_markdown, FileStateManager, NullStateSink, StateError, StateSink,
};
pub use crate::duologue::turn;
pub use crate::duologue::turn::{Conversation, Turn};
