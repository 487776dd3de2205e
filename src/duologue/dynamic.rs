//! Dynamic protocol engine: adaptive, self-modifying plans.
//!
//! The [`DynamicEngine`] wraps a [`ProtocolEngine`] with a per-invocation
//! [`ContextStore`] and three behaviors layered around the same turn-execution
//! call:
//!
//! - **Variable substitution**: `<UPPER_SNAKE>` tokens in templates are
//!   replaced with context-store values before dispatch; unknown tokens pass
//!   through verbatim so a template can resolve across multiple passes.
//! - **Adaptive instructions**: completed responses are scanned for marker
//!   prefixes (`NEXT_STEP:`, `MODIFY_APPROACH:`, `CHANGE_DIRECTION:`); the
//!   first line after the first matching marker is stored and prepended to the
//!   next turn flagged `adaptive`.
//! - **Cycles**: a whole plan can be re-run up to `max_cycles` times, with a
//!   summary of the previous cycle injected into the store and an optional
//!   lexical convergence test stopping early.
//!
//! Per invocation the layer moves through
//! `INIT → (RUN_CYCLE → CHECK_CONVERGENCE)* → FINALIZE`; exhausting the cycle
//! budget and converging early are both successful completions, distinguished
//! only by the recorded cycle count. The store is written exclusively in the
//! sequential post-turn step (via the engine's [`TurnHooks`] seam), never from
//! a turn in flight, so it needs no locking.

use crate::duologue::engine::{ProtocolEngine, ProtocolError, TurnHooks};
use crate::duologue::turn::{Conversation, Turn};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

lazy_static! {
    static ref VARIABLE: Regex = Regex::new(r"<([A-Z][A-Z0-9_]*)>").unwrap();
}

/// Ordered extraction rules: the first prefix found in a response wins, and
/// the remainder of its line is stored under the destination key.
const ADAPTIVE_MARKERS: &[(&str, &str)] = &[
    ("NEXT_STEP:", "ADAPTIVE_INSTRUCTION"),
    ("MODIFY_APPROACH:", "ADAPTIVE_INSTRUCTION"),
    ("CHANGE_DIRECTION:", "ADAPTIVE_INSTRUCTION"),
];

/// Configuration for cycle execution.
#[derive(Clone, Debug)]
pub struct CycleConfig {
    /// Upper bound on full plan executions.
    pub max_cycles: usize,
    /// Jaccard similarity (`0.0..=1.0`) at which cycling stops early.
    /// `None` disables the convergence test.
    pub convergence_threshold: Option<f64>,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_cycles: 3,
            convergence_threshold: None,
        }
    }
}

/// Mutable variable map threaded through a dynamic invocation.
///
/// Keys are uppercase-snake-case. The store is scoped to one orchestration
/// invocation and never persisted. It implements [`TurnHooks`] so the engine
/// consults it before and after every turn.
#[derive(Debug, Default)]
pub struct ContextStore {
    values: HashMap<String, String>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }

    /// Substitute `<UPPER_SNAKE>` tokens with stored values.
    ///
    /// Unknown tokens are left verbatim — never an error.
    pub fn substitute(&self, template: &str) -> String {
        VARIABLE
            .replace_all(template, |captures: &regex::Captures| {
                match self.values.get(&captures[1]) {
                    Some(value) => value.clone(),
                    None => captures[0].to_string(),
                }
            })
            .into_owned()
    }

    /// Harvest a completed turn: store its result for later substitution and
    /// scan it for adaptive instructions.
    fn absorb(&mut self, turn: &Turn) {
        self.values
            .insert(format!("TURN_{}_RESULT", turn.number), turn.response.clone());

        if !turn.role.is_empty() {
            let role_key = turn.role.to_uppercase().replace(' ', "_");
            self.values
                .insert(format!("LAST_{}", role_key), turn.response.clone());
        }

        self.extract_adaptive_instruction(&turn.response);
    }

    /// Apply the ordered marker rules; the first matching rule overwrites the
    /// destination key with the first line following its marker.
    fn extract_adaptive_instruction(&mut self, response: &str) {
        for (marker, key) in ADAPTIVE_MARKERS {
            if let Some(position) = response.find(marker) {
                let rest = &response[position + marker.len()..];
                let instruction = rest.lines().next().unwrap_or("").trim();
                if !instruction.is_empty() {
                    log::info!("Extracted adaptive instruction: {}", instruction);
                    self.values.insert((*key).to_string(), instruction.to_string());
                }
                return;
            }
        }
    }
}

impl TurnHooks for ContextStore {
    fn shape_prompt(&mut self, number: usize, prompt: String, adaptive: bool) -> String {
        let mut prompt = self.substitute(&prompt);

        // Adaptive instructions only reach turns explicitly flagged for them,
        // and never the opening turn.
        if adaptive && number > 1 {
            if let Some(instruction) = self.values.get("ADAPTIVE_INSTRUCTION") {
                prompt = format!("{}\n\n{}", instruction, prompt);
            }
        }

        prompt
    }

    fn observe_turn(&mut self, turn: &Turn) {
        self.absorb(turn);
    }
}

/// Protocol engine with dynamic capabilities layered on top.
pub struct DynamicEngine {
    engine: ProtocolEngine,
}

impl DynamicEngine {
    pub fn new(engine: ProtocolEngine) -> Self {
        Self { engine }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Execute a plan with template substitution and, optionally, cycles.
    ///
    /// - `mode`: plan name, resolved like [`ProtocolEngine::run`].
    /// - `task`: primary task description; seeds the `TASK` variable and
    ///   fills `{topic}` placeholders.
    /// - `variables`: additional seed variables for the context store.
    /// - `cycle_config`: when present with `max_cycles > 1`, the whole plan
    ///   is repeated until convergence or the budget runs out.
    pub async fn run_dynamic(
        &self,
        mode: &str,
        task: &str,
        variables: Option<HashMap<String, String>>,
        cycle_config: Option<CycleConfig>,
    ) -> Result<Conversation, ProtocolError> {
        let mut store = ContextStore::new();
        store.set("TASK", task);
        store.set("CYCLE", "0");
        if let Some(variables) = variables {
            for (key, value) in variables {
                store.set(key, value);
            }
        }

        match cycle_config {
            Some(config) if config.max_cycles > 1 => {
                self.execute_cycles(mode, task, &config, &mut store).await
            }
            _ => {
                self.engine
                    .run_with_hooks(mode, task, None, None, Some(&mut store as &mut dyn TurnHooks))
                    .await
            }
        }
    }

    /// Run the plan repeatedly, injecting a summary of the previous cycle and
    /// testing for convergence after each one.
    async fn execute_cycles(
        &self,
        mode: &str,
        task: &str,
        config: &CycleConfig,
        store: &mut ContextStore,
    ) -> Result<Conversation, ProtocolError> {
        let fallback_started_at = Utc::now().to_rfc3339();
        let mut all_turns: Vec<Turn> = Vec::new();
        let mut cycles_run = 0usize;
        let mut last_session_id = String::new();

        for cycle in 1..=config.max_cycles {
            log::info!("Starting cycle {}/{}", cycle, config.max_cycles);

            store.set("CYCLE", cycle.to_string());
            store.set("PREVIOUS_CYCLE_SUMMARY", previous_cycle_summary(&all_turns));

            let conversation = self
                .engine
                .run_with_hooks(mode, task, None, None, Some(&mut *store as &mut dyn TurnHooks))
                .await?;

            last_session_id = conversation.session_id.clone();
            all_turns.extend(conversation.turns);
            cycles_run = cycle;

            if let Some(threshold) = config.convergence_threshold {
                if check_convergence(&all_turns, threshold) {
                    log::info!("Convergence reached at cycle {}", cycle);
                    break;
                }
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert("cycles".to_string(), Value::from(cycles_run as u64));
        metadata.insert("max_cycles".to_string(), Value::from(config.max_cycles as u64));
        if let Some(threshold) = config.convergence_threshold {
            metadata.insert("convergence_threshold".to_string(), Value::from(threshold));
        }

        let started_at = all_turns
            .first()
            .map(|turn| turn.timestamp.clone())
            .unwrap_or(fallback_started_at);

        let mut conversation = Conversation::new(
            format!("{}-cycles", last_session_id),
            format!("{}-cyclic", mode),
            task,
            metadata,
            started_at,
        );
        conversation.turns = all_turns;
        conversation.completed_at = Some(Utc::now().to_rfc3339());
        conversation.update_totals();

        if let Err(err) = self.engine.state().record_session(&conversation).await {
            log::warn!(
                "Failed to persist cyclic session {}: {}",
                conversation.session_id,
                err
            );
        }

        Ok(conversation)
    }
}

/// Summarize the tail of the previous cycle for injection into the next one.
fn previous_cycle_summary(all_turns: &[Turn]) -> String {
    if all_turns.is_empty() {
        return "This is the first cycle.".to_string();
    }

    let start = all_turns.len().saturating_sub(3);
    let mut summary = String::from("Previous cycle summary:\n");
    for turn in &all_turns[start..] {
        let snippet: String = turn.response.chars().take(200).collect();
        summary.push_str(&format!("- {}: {}...\n", turn.role, snippet));
    }

    summary
}

/// Decide whether accumulated cycles have converged.
///
/// Requires at least 10 accumulated turns (roughly two cycles' worth), then
/// compares the first and second halves of all turn texts. Failed turns
/// contribute empty text. The heuristic is raw word overlap — deliberately
/// lexical, see [`jaccard_similarity`].
fn check_convergence(all_turns: &[Turn], threshold: f64) -> bool {
    if all_turns.len() < 10 {
        return false;
    }

    let mid_point = all_turns.len() / 2;
    let join = |turns: &[Turn]| {
        turns
            .iter()
            .map(turn_text)
            .collect::<Vec<_>>()
            .join(" ")
    };

    let previous = join(&all_turns[..mid_point]);
    let current = join(&all_turns[mid_point..]);

    let overlap = jaccard_similarity(&previous, &current);
    log::debug!(
        "Convergence check: overlap={:.3}, threshold={}",
        overlap,
        threshold
    );

    overlap >= threshold
}

/// A failed turn's text is treated as empty for convergence comparison.
fn turn_text(turn: &Turn) -> &str {
    if turn.error.is_some() {
        ""
    } else {
        &turn.response
    }
}

/// Jaccard similarity between two texts over case-folded word sets.
///
/// Returns `1.0` when both texts are empty and `0.0` when exactly one is.
/// Word overlap is a crude proxy for agreement — verbose-but-different text
/// can fool it — but it is cheap and dependency-free. A semantic-similarity
/// backend is a likely future swap, not a defect in this one.
pub fn jaccard_similarity(previous: &str, current: &str) -> f64 {
    let previous_words: HashSet<String> = previous
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();
    let current_words: HashSet<String> = current
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect();

    if previous_words.is_empty() && current_words.is_empty() {
        return 1.0;
    }
    if previous_words.is_empty() || current_words.is_empty() {
        return 0.0;
    }

    let intersection = previous_words.intersection(&current_words).count();
    let union = previous_words.union(&current_words).count();

    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_wrapper::TokenUsage;

    fn turn(number: usize, role: &str, response: &str) -> Turn {
        Turn {
            number,
            role: role.to_string(),
            participant: "claude".to_string(),
            model: "claude-3-sonnet-20240229".to_string(),
            prompt: String::new(),
            response: response.to_string(),
            tokens: TokenUsage::zero(),
            latency: 0.0,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            context_from: vec![],
            cost: 0.0,
            error: None,
            retry_count: 0,
        }
    }

    #[test]
    fn substitute_resolves_known_and_keeps_unknown() {
        let mut store = ContextStore::new();
        store.set("TASK", "a");

        assert_eq!(store.substitute("<TASK> and <X>"), "a and <X>");
    }

    #[test]
    fn substitute_handles_numbered_turn_results() {
        let mut store = ContextStore::new();
        store.absorb(&turn(2, "analysis", "the finding"));

        assert_eq!(store.substitute("Given <TURN_2_RESULT>"), "Given the finding");
        assert_eq!(store.get("LAST_ANALYSIS"), Some("the finding"));
    }

    #[test]
    fn first_matching_marker_rule_wins() {
        let mut store = ContextStore::new();
        store.extract_adaptive_instruction(
            "Done.\nMODIFY_APPROACH: go deeper\nNEXT_STEP: something else\n",
        );

        // NEXT_STEP is the first rule in the ordered list, so it wins even
        // though MODIFY_APPROACH appears earlier in the text.
        assert_eq!(store.get("ADAPTIVE_INSTRUCTION"), Some("something else"));
    }

    #[test]
    fn adaptive_instruction_overwrites_previous_value() {
        let mut store = ContextStore::new();
        store.extract_adaptive_instruction("NEXT_STEP: first");
        store.extract_adaptive_instruction("NEXT_STEP: second");

        assert_eq!(store.get("ADAPTIVE_INSTRUCTION"), Some("second"));
    }

    #[test]
    fn adaptive_prepend_requires_flag_and_later_turn() {
        let mut store = ContextStore::new();
        store.set("ADAPTIVE_INSTRUCTION", "focus on tests");

        let shaped = store.shape_prompt(2, "do the work".to_string(), true);
        assert!(shaped.starts_with("focus on tests\n\n"));

        let unflagged = store.shape_prompt(2, "do the work".to_string(), false);
        assert_eq!(unflagged, "do the work");

        let opening = store.shape_prompt(1, "do the work".to_string(), true);
        assert_eq!(opening, "do the work");
    }

    #[test]
    fn jaccard_identical_texts_is_one() {
        assert_eq!(jaccard_similarity("alpha beta Gamma", "gamma ALPHA beta"), 1.0);
    }

    #[test]
    fn jaccard_disjoint_texts_is_zero() {
        assert_eq!(jaccard_similarity("alpha beta", "gamma delta"), 0.0);
    }

    #[test]
    fn jaccard_empty_edge_cases() {
        assert_eq!(jaccard_similarity("", ""), 1.0);
        assert_eq!(jaccard_similarity("alpha", ""), 0.0);
    }

    #[test]
    fn convergence_needs_ten_turns() {
        let turns: Vec<Turn> = (1..=9).map(|n| turn(n, "r", "same words here")).collect();
        assert!(!check_convergence(&turns, 0.1));

        let turns: Vec<Turn> = (1..=10).map(|n| turn(n, "r", "same words here")).collect();
        assert!(check_convergence(&turns, 1.0));
    }

    #[test]
    fn failed_turns_count_as_empty_text() {
        let mut turns: Vec<Turn> = (1..=10).map(|n| turn(n, "r", "same words")).collect();
        for t in turns.iter_mut() {
            t.error = Some("boom".to_string());
            t.response = "[Error: boom]".to_string();
        }
        // All failed: both halves empty -> similarity 1.0.
        assert!(check_convergence(&turns, 1.0));
    }

    #[test]
    fn summary_covers_last_three_turns() {
        assert_eq!(previous_cycle_summary(&[]), "This is the first cycle.");

        let turns: Vec<Turn> = (1..=5)
            .map(|n| turn(n, &format!("role{}", n), &format!("result {}", n)))
            .collect();
        let summary = previous_cycle_summary(&turns);

        assert!(summary.starts_with("Previous cycle summary:"));
        assert!(!summary.contains("result 2"));
        assert!(summary.contains("- role3: result 3..."));
        assert!(summary.contains("- role5: result 5..."));
    }
}
