//! Core protocol orchestration engine.
//!
//! The [`ProtocolEngine`] drives a [`PlanConfig`] to completion: it renders
//! each turn's prompt from its template and declared context, dispatches the
//! turn to the participant's generation client under a timeout, retries
//! transient failures with exponential backoff and jitter, and records
//! latency, token usage, cost, and errors on the resulting [`Turn`].
//!
//! Failure semantics are graceful degradation, not fail-fast: a turn that
//! exhausts its retries (or hits a non-retryable error) is recorded with an
//! error description and the dialogue continues. Only configuration problems —
//! a missing plan, an unrecognized topology tag — abort the invocation.
//!
//! # Topologies
//!
//! - **Sequential**: turns run in ascending order; each turn's context map is
//!   built from the completed turns its template names in `context_from`.
//! - **Parallel**: all turns launch concurrently with empty context and are
//!   appended to the session in completion order, persisting each as it
//!   resolves.
//! - **Mixed**: ordered phases, each sequential or parallel over an explicit
//!   set of sequence numbers.
//!
//! All suspension points (service calls bounded by their timeout, backoff
//! sleeps) are cancellable: dropping the `run` future cancels in-flight calls
//! and skips the remaining turns, while a per-turn timeout cancels only that
//! turn's call.

use crate::client_wrapper::{GenerationClient, GenerationError, GenerationOutput, TokenUsage};
use crate::duologue::plan::{PlanConfig, PlanLoader, Topology, TurnTemplate};
use crate::duologue::pricing::calculate_cost;
use crate::duologue::state::StateSink;
use crate::duologue::turn::{Conversation, Turn};
use chrono::{Local, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use lazy_static::lazy_static;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_BACKOFF_BASE: f64 = 2.0;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap();
}

/// Errors that abort a whole invocation before (or instead of) running turns.
///
/// Turn-level failures are never surfaced here — they are recorded on the
/// individual [`Turn`]'s `error` field and the session completes anyway.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// The named plan does not exist in the modes directory.
    PlanNotFound(String),
    /// The plan file exists but could not be parsed.
    InvalidPlan { name: String, detail: String },
    /// The plan carries a topology tag the engine does not implement.
    UnknownTopology(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PlanNotFound(name) => write!(f, "Plan not found: {}", name),
            ProtocolError::InvalidPlan { name, detail } => {
                write!(f, "Invalid plan '{}': {}", name, detail)
            }
            ProtocolError::UnknownTopology(name) => {
                write!(f, "Unknown topology in plan '{}'", name)
            }
        }
    }
}

impl Error for ProtocolError {}

/// Seam for layering behavior around turn execution.
///
/// The dynamic layer implements this to substitute `<UPPER_SNAKE>` variables
/// into prompts before dispatch and to harvest results into its context store
/// afterwards. Both methods are called from the sequential driver only — never
/// from a turn in flight — so implementations need no internal locking.
pub trait TurnHooks: Send {
    /// Transform the rendered prompt just before it is handed to the client.
    fn shape_prompt(&mut self, _number: usize, prompt: String, _adaptive: bool) -> String {
        prompt
    }

    /// Observe a completed turn after it has been appended to the session.
    fn observe_turn(&mut self, _turn: &Turn) {}
}

/// Core protocol orchestration engine.
///
/// Owns the participant registry (tag → client lookup table — adding a third
/// participant requires no engine changes), the persistence sink, the plan
/// loader, and the retry/timeout policy defaults.
pub struct ProtocolEngine {
    participants: HashMap<String, Arc<dyn GenerationClient>>,
    state: Arc<dyn StateSink>,
    loader: PlanLoader,
    max_retries: usize,
    timeout_secs: u64,
    retry_backoff_base: f64,
}

impl ProtocolEngine {
    /// Create an engine with default policy: 3 retries, 30 s timeout, backoff
    /// base 2.0, plans loaded from `"modes"`.
    pub fn new(state: Arc<dyn StateSink>) -> Self {
        log::info!(
            "ProtocolEngine initialized: max_retries={}, timeout={}s, backoff_base={}",
            DEFAULT_MAX_RETRIES,
            DEFAULT_TIMEOUT_SECS,
            DEFAULT_BACKOFF_BASE
        );

        Self {
            participants: HashMap::new(),
            state,
            loader: PlanLoader::new("modes"),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            retry_backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }

    /// Register a generation client under a participant tag (builder pattern).
    pub fn with_participant(
        mut self,
        tag: impl Into<String>,
        client: Arc<dyn GenerationClient>,
    ) -> Self {
        self.participants.insert(tag.into(), client);
        self
    }

    /// Override the directory plans are loaded from (builder pattern).
    pub fn with_modes_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.loader = PlanLoader::new(dir);
        self
    }

    /// Override the default retry budget (builder pattern).
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Override the default per-turn timeout (builder pattern).
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Override the exponential backoff base (builder pattern).
    pub fn with_backoff_base(mut self, base: f64) -> Self {
        self.retry_backoff_base = base.max(0.0);
        self
    }

    /// The persistence sink this engine records into.
    pub fn state(&self) -> &Arc<dyn StateSink> {
        &self.state
    }

    /// Execute a complete plan.
    ///
    /// - `mode`: plan name resolved against the modes directory, unless
    ///   `inline_plan` supplies the configuration directly.
    /// - `topic`: fills the `{topic}` placeholder in every template.
    /// - `turns_override`: caps/extends the number of turns, clamped to the
    ///   plan's prompt list.
    ///
    /// Returns the completed [`Conversation`]. Individual turn failures do not
    /// produce an `Err`: inspect each turn's `error` field.
    pub async fn run(
        &self,
        mode: &str,
        topic: &str,
        turns_override: Option<usize>,
        inline_plan: Option<PlanConfig>,
    ) -> Result<Conversation, ProtocolError> {
        self.run_with_hooks(mode, topic, turns_override, inline_plan, None)
            .await
    }

    /// [`run`](Self::run) with a [`TurnHooks`] layer attached.
    pub async fn run_with_hooks(
        &self,
        mode: &str,
        topic: &str,
        turns_override: Option<usize>,
        inline_plan: Option<PlanConfig>,
        mut hooks: Option<&mut (dyn TurnHooks + '_)>,
    ) -> Result<Conversation, ProtocolError> {
        let plan = match inline_plan {
            Some(plan) => plan,
            None => self.loader.load_plan(mode)?,
        };

        let session_id = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let mut conversation = Conversation::new(
            session_id,
            mode,
            topic,
            plan.metadata.clone(),
            Utc::now().to_rfc3339(),
        );

        let count = plan.effective_turn_count(turns_override);

        log::info!("Starting {} mode conversation: {}", mode, topic);
        log::info!("Session ID: {}", conversation.session_id);
        log::info!("Turns: {}", count);

        match plan.structure {
            Topology::Sequential => {
                self.execute_sequential(&mut conversation, &plan, count, topic, hooks.as_deref_mut())
                    .await
            }
            Topology::Parallel => {
                self.execute_parallel(&mut conversation, &plan, count, topic, hooks.as_deref_mut())
                    .await
            }
            Topology::Mixed => {
                self.execute_mixed(&mut conversation, &plan, topic, hooks.as_deref_mut())
                    .await
            }
            // Rejected before any turn executes.
            Topology::Unknown => return Err(ProtocolError::UnknownTopology(mode.to_string())),
        }

        conversation.completed_at = Some(Utc::now().to_rfc3339());
        conversation.update_totals();

        if let Err(err) = self.state.record_session(&conversation).await {
            log::warn!(
                "Failed to persist session {}: {}",
                conversation.session_id,
                err
            );
        }

        log::info!("Conversation completed: {} turns", conversation.turns.len());
        log::info!("Total tokens: {}", conversation.total_tokens);
        log::info!("Total cost: ${:.6}", conversation.total_cost);

        Ok(conversation)
    }

    /// Sequential topology: each turn sees the results of the completed turns
    /// it declares in `context_from`, and is persisted before the next starts.
    ///
    /// A declared dependency on a turn that has not executed simply leaves the
    /// corresponding key out of the context map — the template render step
    /// decides whether that is fatal for the turn. Dependency cycles are the
    /// plan author's responsibility; the engine does not detect them.
    async fn execute_sequential(
        &self,
        conversation: &mut Conversation,
        plan: &PlanConfig,
        count: usize,
        topic: &str,
        mut hooks: Option<&mut (dyn TurnHooks + '_)>,
    ) {
        for number in 1..=count {
            let tpl = &plan.prompts[number - 1];
            let context = build_context(conversation, &tpl.context_from);

            let turn = self
                .execute_turn(number, tpl, topic, &context, hooks.as_deref_mut())
                .await;

            self.persist_turn(&conversation.session_id, &turn).await;
            log::info!("Turn {} completed: {}", number, turn.participant);

            if let Some(h) = hooks.as_deref_mut() {
                h.observe_turn(&turn);
            }
            conversation.turns.push(turn);
        }
    }

    /// Parallel topology: all turns launch concurrently with empty context
    /// (parallel turns share no dependencies by definition) and results are
    /// appended in completion order.
    async fn execute_parallel(
        &self,
        conversation: &mut Conversation,
        plan: &PlanConfig,
        count: usize,
        topic: &str,
        mut hooks: Option<&mut (dyn TurnHooks + '_)>,
    ) {
        let empty = HashMap::new();
        let mut pending = FuturesUnordered::new();

        for number in 1..=count {
            let tpl = &plan.prompts[number - 1];
            let prepared = self.prepare_prompt(number, tpl, topic, &empty, hooks.as_deref_mut());
            pending.push(self.execute_prepared(number, tpl, prepared));
        }

        while let Some(turn) = pending.next().await {
            self.persist_turn(&conversation.session_id, &turn).await;
            if let Some(h) = hooks.as_deref_mut() {
                h.observe_turn(&turn);
            }
            conversation.turns.push(turn);
        }

        log::info!(
            "Parallel execution completed: {} turns",
            conversation.turns.len()
        );
    }

    /// Mixed topology: ordered phases, each sequential or parallel over the
    /// sequence numbers it names. Phase boundaries are strict — a phase never
    /// starts before every turn of the previous phase is recorded.
    async fn execute_mixed(
        &self,
        conversation: &mut Conversation,
        plan: &PlanConfig,
        topic: &str,
        mut hooks: Option<&mut (dyn TurnHooks + '_)>,
    ) {
        for phase in &plan.phases {
            match phase.kind {
                Topology::Parallel => {
                    let empty = HashMap::new();
                    let mut pending = FuturesUnordered::new();

                    for &number in &phase.turns {
                        let tpl = match lookup_template(plan, number) {
                            Some(tpl) => tpl,
                            None => continue,
                        };
                        let prepared =
                            self.prepare_prompt(number, tpl, topic, &empty, hooks.as_deref_mut());
                        pending.push(self.execute_prepared(number, tpl, prepared));
                    }

                    while let Some(turn) = pending.next().await {
                        self.persist_turn(&conversation.session_id, &turn).await;
                        if let Some(h) = hooks.as_deref_mut() {
                            h.observe_turn(&turn);
                        }
                        conversation.turns.push(turn);
                    }
                }
                _ => {
                    for &number in &phase.turns {
                        let tpl = match lookup_template(plan, number) {
                            Some(tpl) => tpl,
                            None => continue,
                        };
                        let context = build_context(conversation, &tpl.context_from);

                        let turn = self
                            .execute_turn(number, tpl, topic, &context, hooks.as_deref_mut())
                            .await;

                        self.persist_turn(&conversation.session_id, &turn).await;
                        if let Some(h) = hooks.as_deref_mut() {
                            h.observe_turn(&turn);
                        }
                        conversation.turns.push(turn);
                    }
                }
            }
        }
    }

    /// Execute one turn end to end. Never returns an error: every failure mode
    /// is folded into the returned [`Turn`].
    async fn execute_turn(
        &self,
        number: usize,
        tpl: &TurnTemplate,
        topic: &str,
        context: &HashMap<String, String>,
        hooks: Option<&mut (dyn TurnHooks + '_)>,
    ) -> Turn {
        let prepared = self.prepare_prompt(number, tpl, topic, context, hooks);
        self.execute_prepared(number, tpl, prepared).await
    }

    /// Render the template against `topic` + context and apply the hook layer.
    ///
    /// An unresolved `{placeholder}` is a template error that terminates the
    /// turn locally — no generation call is made and no retries are consumed.
    fn prepare_prompt(
        &self,
        number: usize,
        tpl: &TurnTemplate,
        topic: &str,
        context: &HashMap<String, String>,
        mut hooks: Option<&mut (dyn TurnHooks + '_)>,
    ) -> Result<String, String> {
        let mut prompt = render_template(&tpl.template, topic, context)?;

        if let Some(h) = hooks.as_deref_mut() {
            prompt = h.shape_prompt(number, prompt, tpl.adaptive);
        }

        if let Some(role_instruction) = &tpl.role_instruction {
            prompt = format!("{}\n\n{}", role_instruction, prompt);
        }

        log::debug!("Turn {}: {}", number, tpl.participant);

        Ok(prompt)
    }

    /// The retry/backoff/timeout state machine around one generation call.
    async fn execute_prepared(
        &self,
        number: usize,
        tpl: &TurnTemplate,
        prepared: Result<String, String>,
    ) -> Turn {
        let start = Instant::now();

        let prompt = match prepared {
            Ok(prompt) => prompt,
            Err(msg) => {
                log::error!("Turn {} template error: {}", number, msg);
                let model = tpl.model.clone().unwrap_or_default();
                return self.finish_turn(number, tpl, String::new(), model, None, Some(msg), 0, start);
            }
        };

        let client = match self.participants.get(&tpl.participant) {
            Some(client) => Arc::clone(client),
            None => {
                let msg = format!("Unknown participant: {}", tpl.participant);
                log::error!("Turn {}: {}", number, msg);
                let model = tpl.model.clone().unwrap_or_default();
                return self.finish_turn(number, tpl, prompt, model, None, Some(msg), 0, start);
            }
        };

        let model = tpl
            .model
            .clone()
            .unwrap_or_else(|| client.model_name().to_string());
        let timeout = Duration::from_secs(tpl.timeout_secs.unwrap_or(self.timeout_secs));
        let max_retries = tpl.max_retries.unwrap_or(self.max_retries).max(1);

        let mut output: Option<GenerationOutput> = None;
        let mut error_msg: Option<String> = None;
        let mut retry_count = 0usize;

        for attempt in 0..max_retries {
            let outcome = match tokio::time::timeout(timeout, client.generate(&prompt, &model)).await
            {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(format!(
                    "Timeout after {}s",
                    timeout.as_secs()
                ))),
            };

            match outcome {
                Ok(generated) => {
                    log::info!(
                        "Turn {} ({}) succeeded on attempt {}",
                        number,
                        tpl.participant,
                        attempt + 1
                    );
                    output = Some(generated);
                    error_msg = None;
                    break;
                }
                Err(err) => {
                    error_msg = Some(err.to_string());
                    retry_count = attempt + 1;

                    if err.is_retryable() && attempt + 1 < max_retries {
                        let wait = self.backoff_delay(attempt);
                        log::warn!(
                            "Turn {} {}. Retrying in {:.2}s (attempt {}/{})",
                            number,
                            err,
                            wait.as_secs_f64(),
                            attempt + 1,
                            max_retries
                        );
                        tokio::time::sleep(wait).await;
                    } else if !err.is_retryable() {
                        log::error!("Turn {} failed: {}", number, err);
                        log::debug!("Turn {} error is not retryable, giving up", number);
                        break;
                    } else {
                        log::error!(
                            "Turn {} failed after {} attempts: {}",
                            number,
                            max_retries,
                            err
                        );
                    }
                }
            }
        }

        self.finish_turn(number, tpl, prompt, model, output, error_msg, retry_count, start)
    }

    /// Exponential backoff with up-to-10% uniform jitter.
    fn backoff_delay(&self, attempt: usize) -> Duration {
        let wait = self.retry_backoff_base.powi(attempt as i32);
        let jitter = if wait > 0.0 {
            rand::thread_rng().gen_range(0.0..wait * 0.1)
        } else {
            0.0
        };
        Duration::from_secs_f64(wait + jitter)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_turn(
        &self,
        number: usize,
        tpl: &TurnTemplate,
        prompt: String,
        model: String,
        output: Option<GenerationOutput>,
        error: Option<String>,
        retry_count: usize,
        start: Instant,
    ) -> Turn {
        let latency = start.elapsed().as_secs_f64();

        let (response, tokens) = match output {
            Some(out) => (out.text, out.usage),
            None => {
                let detail = error.as_deref().unwrap_or("unknown error");
                (format!("[Error: {}]", detail), TokenUsage::zero())
            }
        };

        // Cost only when tokens were actually billed.
        let cost = if tokens.total > 0 {
            calculate_cost(&model, &tokens)
        } else {
            0.0
        };

        Turn {
            number,
            role: tpl.role.clone(),
            participant: tpl.participant.clone(),
            model,
            prompt,
            response,
            tokens,
            latency,
            timestamp: Utc::now().to_rfc3339(),
            context_from: tpl.context_from.clone(),
            cost,
            error,
            retry_count,
        }
    }

    /// Persistence is fire-and-forget: a sink failure is logged, never fatal.
    async fn persist_turn(&self, session_id: &str, turn: &Turn) {
        if let Err(err) = self.state.record_turn(session_id, turn).await {
            log::warn!("Failed to persist turn {}: {}", turn.number, err);
        }
    }
}

/// Build the context map for a turn from its declared dependency list.
///
/// Missing dependencies are silently absent — see `execute_sequential`.
fn build_context(conversation: &Conversation, context_from: &[usize]) -> HashMap<String, String> {
    let mut context = HashMap::new();

    for &number in context_from {
        if let Some(turn) = conversation.turn_by_number(number) {
            context.insert(format!("turn_{}", number), turn.response.clone());
            context.insert(
                format!("turn_{}_participant", number),
                turn.participant.clone(),
            );
        }
    }

    context
}

fn lookup_template(plan: &PlanConfig, number: usize) -> Option<&TurnTemplate> {
    number.checked_sub(1).and_then(|idx| plan.prompts.get(idx))
}

/// Substitute `{topic}` and `{turn_N}` style placeholders.
///
/// Every placeholder must resolve; an unresolved one is reported as a
/// template error naming the missing variable.
fn render_template(
    template: &str,
    topic: &str,
    context: &HashMap<String, String>,
) -> Result<String, String> {
    let mut missing: Vec<&str> = Vec::new();

    for captures in PLACEHOLDER.captures_iter(template) {
        let name = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        if name != "topic" && !context.contains_key(name) {
            missing.push(name);
        }
    }

    if let Some(name) = missing.first() {
        return Err(format!("Missing context variable '{}'", name));
    }

    let rendered = PLACEHOLDER.replace_all(template, |captures: &regex::Captures| {
        let name = &captures[1];
        if name == "topic" {
            topic.to_string()
        } else {
            context.get(name).cloned().unwrap_or_default()
        }
    });

    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_topic_and_context() {
        let mut context = HashMap::new();
        context.insert("turn_1".to_string(), "prior result".to_string());

        let rendered =
            render_template("Discuss {topic} given {turn_1}", "rust", &context).unwrap();
        assert_eq!(rendered, "Discuss rust given prior result");
    }

    #[test]
    fn render_fails_on_missing_variable() {
        let err = render_template("Build on {turn_2}", "rust", &HashMap::new()).unwrap_err();
        assert!(err.contains("turn_2"));
    }

    #[test]
    fn render_leaves_dynamic_tokens_alone() {
        // <UPPER_SNAKE> tokens belong to the dynamic layer, not this renderer.
        let rendered = render_template("Work on <TASK> about {topic}", "x", &HashMap::new()).unwrap();
        assert_eq!(rendered, "Work on <TASK> about x");
    }
}
