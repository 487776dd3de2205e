//! Decomposition parsing and turn-plan generation.
//!
//! The [`StrategyPlanner`] turns a semi-structured free-text task breakdown
//! into typed [`Subtask`] records and renders them into a concrete turn plan
//! under one of three generation strategies. It is a pure transformation —
//! no retries, no concurrency — whose output feeds
//! [`DynamicEngine::run_dynamic`](crate::DynamicEngine::run_dynamic) as an
//! inline plan.
//!
//! The expected input grammar:
//!
//! ```text
//! SUBTASKS:
//! 1. TaskName - Complexity: simple
//!    Description: what to do
//!    Dependencies: other_task, another_task
//!
//! LOOP_STRATEGY: single_loop
//! REASONING: why this strategy fits
//! ```

use crate::duologue::plan::{PlanConfig, Topology, TurnTemplate};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;

lazy_static! {
    static ref SUBTASKS_SECTION: Regex =
        Regex::new(r"(?s)SUBTASKS:(.*?)(?:LOOP_STRATEGY:|$)").unwrap();
    static ref SUBTASK_HEADER: Regex =
        Regex::new(r"(?m)^\s*\d+\.\s*(.+?)\s*-\s*Complexity:\s*(\w+)").unwrap();
    static ref DESCRIPTION: Regex = Regex::new(r"Description:\s*(.+)").unwrap();
    static ref DEPENDENCIES: Regex = Regex::new(r"Dependencies:\s*(.+)").unwrap();
    static ref STRATEGY_TAG: Regex = Regex::new(r"LOOP_STRATEGY:\s*(\w+)").unwrap();
    static ref REASONING: Regex = Regex::new(r"(?s)REASONING:\s*(.+?)(?:\n\n|$)").unwrap();
}

/// How demanding a subtask is; drives validation and loop generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    fn parse(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "simple" => Complexity::Simple,
            "moderate" => Complexity::Moderate,
            "complex" => Complexity::Complex,
            other => {
                log::warn!("Unknown complexity '{}', treating as moderate", other);
                Complexity::Moderate
            }
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Simple => write!(f, "simple"),
            Complexity::Moderate => write!(f, "moderate"),
            Complexity::Complex => write!(f, "complex"),
        }
    }
}

/// One decomposed unit of work.
#[derive(Clone, Debug)]
pub struct Subtask {
    pub name: String,
    pub description: String,
    pub complexity: Complexity,
    /// Names of subtasks whose results this one builds on.
    pub dependencies: Vec<String>,
}

/// The three turn-generation strategies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    /// One execution pass per subtask, with a validation turn appended for
    /// non-trivial subtasks.
    SingleLoop,
    /// A research → execute → validate loop per moderate/complex subtask;
    /// simple subtasks get a single pass.
    OneLoopPerTask,
    /// One batch turn for all simple subtasks plus individual loops for the
    /// rest.
    Mixed,
}

impl StrategyKind {
    fn parse(tag: &str) -> Self {
        match tag.to_lowercase().as_str() {
            "single_loop" => StrategyKind::SingleLoop,
            "one_loop_per_task" => StrategyKind::OneLoopPerTask,
            "mixed" => StrategyKind::Mixed,
            other => {
                log::warn!("Unknown strategy: {}, falling back to single loop", other);
                StrategyKind::SingleLoop
            }
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::SingleLoop => write!(f, "single_loop"),
            StrategyKind::OneLoopPerTask => write!(f, "one_loop_per_task"),
            StrategyKind::Mixed => write!(f, "mixed"),
        }
    }
}

/// Chosen strategy plus derived planning facts.
#[derive(Clone, Debug)]
pub struct ExecutionStrategy {
    pub kind: StrategyKind,
    pub total_estimated_turns: usize,
    /// Groups of subtask names that could run concurrently (no dependencies).
    pub parallel_groups: Vec<Vec<String>>,
    pub reasoning: String,
}

/// The planner was asked for output before parsing a decomposition.
#[derive(Debug, Clone)]
pub struct PlannerError {
    details: String,
}

impl fmt::Display for PlannerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.details)
    }
}

impl Error for PlannerError {}

/// Action recommended after a subtask failure report.
#[derive(Clone, Debug)]
pub enum AdaptiveAction {
    /// Re-run with a refinement prompt addressing the reported issues.
    Refine { prompt: String },
    /// Re-run the original execution prompt from scratch.
    Redo { prompt: String },
    /// Minor issues only; proceed without rework.
    Continue { note: String },
    /// The named subtask does not exist.
    Skip { reason: String },
}

/// Parses decompositions and renders turn plans.
#[derive(Default)]
pub struct StrategyPlanner {
    subtasks: Vec<Subtask>,
    strategy: Option<ExecutionStrategy>,
}

impl StrategyPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subtasks(&self) -> &[Subtask] {
        &self.subtasks
    }

    pub fn strategy(&self) -> Option<&ExecutionStrategy> {
        self.strategy.as_ref()
    }

    /// Parse a decomposition response into typed subtasks and a strategy.
    ///
    /// Unknown strategy tags fall back to `single_loop`; a missing SUBTASKS
    /// section simply yields an empty subtask list.
    pub fn parse_decomposition(&mut self, decomposition_text: &str) -> ExecutionStrategy {
        let mut subtasks = Vec::new();

        if let Some(section) = SUBTASKS_SECTION
            .captures(decomposition_text)
            .and_then(|c| c.get(1))
        {
            let section_text = section.as_str();
            let headers: Vec<regex::Captures> =
                SUBTASK_HEADER.captures_iter(section_text).collect();

            for (index, header) in headers.iter().enumerate() {
                let name = header[1].trim().to_string();
                let complexity = Complexity::parse(header[2].trim());

                // Details run from the end of this header to the start of the
                // next one (or the end of the section).
                let details_start = header.get(0).map(|m| m.end()).unwrap_or(0);
                let details_end = headers
                    .get(index + 1)
                    .and_then(|next| next.get(0))
                    .map(|m| m.start())
                    .unwrap_or(section_text.len());
                let details = &section_text[details_start..details_end];

                let description = DESCRIPTION
                    .captures(details)
                    .map(|c| c[1].trim().to_string())
                    .unwrap_or_default();

                let dependencies = DEPENDENCIES
                    .captures(details)
                    .map(|c| {
                        c[1].split(',')
                            .map(|d| d.trim().to_string())
                            .filter(|d| !d.is_empty() && d.to_lowercase() != "none")
                            .collect()
                    })
                    .unwrap_or_default();

                subtasks.push(Subtask {
                    name,
                    description,
                    complexity,
                    dependencies,
                });
            }
        }

        let kind = STRATEGY_TAG
            .captures(decomposition_text)
            .map(|c| StrategyKind::parse(&c[1]))
            .unwrap_or(StrategyKind::SingleLoop);

        let reasoning = REASONING
            .captures(decomposition_text)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();

        let strategy = ExecutionStrategy {
            kind,
            total_estimated_turns: estimate_total_turns(&subtasks, kind),
            parallel_groups: identify_parallel_groups(&subtasks),
            reasoning,
        };

        log::info!("Parsed {} subtasks, strategy: {}", subtasks.len(), kind);

        self.subtasks = subtasks;
        self.strategy = Some(strategy.clone());
        strategy
    }

    /// Render the parsed decomposition into concrete turn templates.
    pub fn generate_turn_templates(&self) -> Result<Vec<TurnTemplate>, PlannerError> {
        let strategy = self.strategy.as_ref().ok_or_else(|| PlannerError {
            details: "Must parse a decomposition first".to_string(),
        })?;

        let prompts = match strategy.kind {
            StrategyKind::SingleLoop => self.generate_single_loop(),
            StrategyKind::OneLoopPerTask => self.generate_per_task_loops(),
            StrategyKind::Mixed => self.generate_mixed(),
        };

        log::info!("Generated {} execution prompts", prompts.len());
        Ok(prompts)
    }

    /// Package the generated templates as a sequential inline plan.
    pub fn build_plan(&self) -> Result<PlanConfig, PlannerError> {
        let prompts = self.generate_turn_templates()?;
        let strategy = self.strategy.as_ref().ok_or_else(|| PlannerError {
            details: "Must parse a decomposition first".to_string(),
        })?;

        let mut metadata = HashMap::new();
        metadata.insert("strategy".to_string(), Value::from(strategy.kind.to_string()));
        metadata.insert(
            "estimated_turns".to_string(),
            Value::from(strategy.total_estimated_turns as u64),
        );

        Ok(PlanConfig {
            structure: Topology::Sequential,
            turns: None,
            prompts,
            phases: Vec::new(),
            metadata,
        })
    }

    fn generate_single_loop(&self) -> Vec<TurnTemplate> {
        let mut prompts: Vec<TurnTemplate> = Vec::new();
        let mut executor_turns: HashMap<&str, usize> = HashMap::new();

        for (index, subtask) in self.subtasks.iter().enumerate() {
            let executor = TurnTemplate::new(
                format!("execute_{}", subtask.name),
                if index % 2 == 0 { "grok" } else { "claude" },
                executor_prompt(subtask, false),
            )
            .with_context_from(dependency_turn_numbers(subtask, &executor_turns));
            prompts.push(executor);
            executor_turns.insert(subtask.name.as_str(), prompts.len());

            // Quick validation for non-trivial subtasks.
            if subtask.complexity != Complexity::Simple {
                let validator = TurnTemplate::new(
                    format!("validate_{}", subtask.name),
                    if index % 2 == 0 { "claude" } else { "grok" },
                    validator_prompt(subtask),
                )
                .with_context_from(vec![prompts.len()]);
                prompts.push(validator);
            }
        }

        self.push_synthesis(&mut prompts);
        prompts
    }

    fn generate_per_task_loops(&self) -> Vec<TurnTemplate> {
        let mut prompts: Vec<TurnTemplate> = Vec::new();
        let mut executor_turns: HashMap<&str, usize> = HashMap::new();

        for subtask in &self.subtasks {
            if subtask.complexity == Complexity::Simple {
                let executor = TurnTemplate::new(
                    format!("execute_{}", subtask.name),
                    "grok",
                    executor_prompt(subtask, false),
                )
                .with_context_from(dependency_turn_numbers(subtask, &executor_turns));
                prompts.push(executor);
                executor_turns.insert(subtask.name.as_str(), prompts.len());
            } else {
                let executed_at = self.push_task_loop(&mut prompts, subtask, &executor_turns);
                executor_turns.insert(subtask.name.as_str(), executed_at);
            }
        }

        self.push_synthesis(&mut prompts);
        prompts
    }

    fn generate_mixed(&self) -> Vec<TurnTemplate> {
        let mut prompts: Vec<TurnTemplate> = Vec::new();
        let mut executor_turns: HashMap<&str, usize> = HashMap::new();

        let simple: Vec<&Subtask> = self
            .subtasks
            .iter()
            .filter(|s| s.complexity == Complexity::Simple)
            .collect();
        if !simple.is_empty() {
            prompts.push(TurnTemplate::new(
                "batch_simple_tasks",
                "grok",
                batch_prompt(&simple),
            ));
            let batch_turn = prompts.len();
            for subtask in &simple {
                executor_turns.insert(subtask.name.as_str(), batch_turn);
            }
        }

        for subtask in &self.subtasks {
            if subtask.complexity != Complexity::Simple {
                let executed_at = self.push_task_loop(&mut prompts, subtask, &executor_turns);
                executor_turns.insert(subtask.name.as_str(), executed_at);
            }
        }

        self.push_synthesis(&mut prompts);
        prompts
    }

    /// Append a research → execute → validate loop for one subtask, returning
    /// the sequence number of its execute turn.
    fn push_task_loop(
        &self,
        prompts: &mut Vec<TurnTemplate>,
        subtask: &Subtask,
        executor_turns: &HashMap<&str, usize>,
    ) -> usize {
        let start = prompts.len();

        let mut research = TurnTemplate::new(
            format!("research_{}", subtask.name),
            "grok",
            format!(
                "**RESEARCH: {}**\n\n{}\n\nResearch necessary background and gather information needed to complete this subtask effectively.",
                subtask.name, subtask.description
            ),
        )
        .with_context_from(dependency_turn_numbers(subtask, executor_turns));
        research.model = Some("grok-4-fast-non-reasoning-latest".to_string());
        prompts.push(research);

        prompts.push(
            TurnTemplate::new(
                format!("execute_{}", subtask.name),
                "claude",
                executor_prompt(subtask, true),
            )
            .with_context_from(vec![start + 1]),
        );
        let executed_at = prompts.len();

        prompts.push(
            TurnTemplate::new(
                format!("validate_{}", subtask.name),
                "grok",
                validator_prompt(subtask),
            )
            .with_context_from(vec![start + 2]),
        );

        executed_at
    }

    fn push_synthesis(&self, prompts: &mut Vec<TurnTemplate>) {
        let context_from: Vec<usize> = (1..=prompts.len()).collect();
        prompts.push(
            TurnTemplate::new("final_synthesis", "claude", synthesis_prompt(&self.subtasks))
                .with_context_from(context_from),
        );
    }

    /// Recommend what to do after a subtask failure report.
    pub fn adapt_on_failure(&self, subtask_name: &str, failure_reason: &str) -> AdaptiveAction {
        let subtask = match self.subtasks.iter().find(|s| s.name == subtask_name) {
            Some(subtask) => subtask,
            None => {
                return AdaptiveAction::Skip {
                    reason: "Subtask not found".to_string(),
                }
            }
        };

        let lowered = failure_reason.to_lowercase();
        if lowered.contains("incomplete") {
            AdaptiveAction::Refine {
                prompt: refinement_prompt(subtask, failure_reason),
            }
        } else if lowered.contains("error") || lowered.contains("incorrect") {
            AdaptiveAction::Redo {
                prompt: executor_prompt(subtask, false),
            }
        } else {
            AdaptiveAction::Continue {
                note: "Minor issues, proceeding".to_string(),
            }
        }
    }
}

/// Estimate the turn count each strategy will generate (synthesis included).
fn estimate_total_turns(subtasks: &[Subtask], kind: StrategyKind) -> usize {
    let simple = subtasks
        .iter()
        .filter(|s| s.complexity == Complexity::Simple)
        .count();
    let involved = subtasks.len() - simple;

    match kind {
        StrategyKind::SingleLoop => subtasks.len() + involved + 1,
        StrategyKind::OneLoopPerTask => simple + involved * 3 + 1,
        StrategyKind::Mixed => {
            let batch = if simple > 0 { 1 } else { 0 };
            batch + involved * 3 + 1
        }
    }
}

/// Subtasks with no dependencies could run concurrently.
fn identify_parallel_groups(subtasks: &[Subtask]) -> Vec<Vec<String>> {
    let no_deps: Vec<String> = subtasks
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .map(|s| s.name.clone())
        .collect();

    if no_deps.len() > 1 {
        vec![no_deps]
    } else {
        Vec::new()
    }
}

/// Resolve a subtask's declared dependencies to the sequence numbers of the
/// turns that executed them. Unresolved names are skipped.
fn dependency_turn_numbers(subtask: &Subtask, executor_turns: &HashMap<&str, usize>) -> Vec<usize> {
    subtask
        .dependencies
        .iter()
        .filter_map(|name| executor_turns.get(name.as_str()).copied())
        .collect()
}

fn executor_prompt(subtask: &Subtask, with_research: bool) -> String {
    let mut prompt = format!("**EXECUTE SUBTASK: {}**\n\n", subtask.name);
    prompt.push_str(&format!("Description: {}\n", subtask.description));
    prompt.push_str(&format!("Complexity: {}\n\n", subtask.complexity));

    if with_research {
        prompt.push_str("Based on the research provided, ");
    }

    prompt.push_str("execute this subtask:\n\n");
    prompt.push_str("1. **Understand what's needed**\n");
    prompt.push_str("   - Clarify requirements\n");
    prompt.push_str("   - Identify success criteria\n\n");
    prompt.push_str("2. **Execute the task**\n");
    prompt.push_str("   - Provide concrete outputs\n");
    prompt.push_str("   - Be thorough and accurate\n\n");
    prompt.push_str("3. **Document results**\n");
    prompt.push_str("   - What was accomplished?\n");
    prompt.push_str("   - What outputs/artifacts created?\n");
    prompt.push_str("   - What context needed for next steps?\n\n");
    prompt.push_str("Provide clear, actionable results.");

    prompt
}

fn validator_prompt(subtask: &Subtask) -> String {
    format!(
        "**VALIDATE: {}**\n\n\
         Review the execution results and validate:\n\n\
         1. **Completeness**\n\
            - Was the subtask fully completed?\n\
            - What's missing or needs improvement?\n\n\
         2. **Quality Check**\n\
            - Does it meet the requirements?\n\
            - Are there errors or issues?\n\n\
         3. **Decision**\n\
            Provide structured response:\n\
            ```\n\
            STATUS: [complete | needs_refinement | incomplete]\n\
            ISSUES: [list any problems or none]\n\
            RECOMMENDATION: [proceed | refine | redo]\n\
            ```\n\n\
         Be thorough but fair.",
        subtask.name
    )
}

fn synthesis_prompt(subtasks: &[Subtask]) -> String {
    let subtask_list: Vec<String> = subtasks
        .iter()
        .map(|s| format!("- {}: {}", s.name, s.description))
        .collect();

    format!(
        "**FINAL SYNTHESIS**\n\n\
         All subtasks completed:\n{}\n\n\
         Synthesize complete solution:\n\n\
         1. **Integration**\n\
            - Combine all subtask results into cohesive solution\n\
            - Resolve any conflicts or gaps\n\
            - Ensure completeness\n\n\
         2. **Quality Assessment**\n\
            - Does this solve the original task?\n\
            - What are the strengths?\n\
            - What are the limitations?\n\n\
         3. **Deliverables**\n\
            - Provide complete, ready-to-use output\n\
            - Include necessary documentation\n\
            - Suggest next steps if applicable\n\n\
         Provide comprehensive, actionable results.",
        subtask_list.join("\n")
    )
}

fn batch_prompt(simple_tasks: &[&Subtask]) -> String {
    let task_list: Vec<String> = simple_tasks
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}: {}", i + 1, s.name, s.description))
        .collect();

    format!(
        "**BATCH EXECUTION: Simple Tasks**\n\n\
         Execute the following straightforward tasks:\n\n{}\n\n\
         For each task:\n\
         1. Complete it efficiently\n\
         2. Provide clear output\n\
         3. Note any issues\n\n\
         Batch results in structured format.",
        task_list.join("\n")
    )
}

fn refinement_prompt(subtask: &Subtask, issues: &str) -> String {
    format!(
        "**REFINE: {}**\n\n\
         Previous attempt had issues:\n{}\n\n\
         Refine and improve:\n\
         1. Address the specific issues raised\n\
         2. Enhance quality and completeness\n\
         3. Provide improved output\n\n\
         Focus on fixing what was problematic.",
        subtask.name, issues
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_resolution_skips_unknown_names() {
        let subtask = Subtask {
            name: "b".to_string(),
            description: String::new(),
            complexity: Complexity::Simple,
            dependencies: vec!["a".to_string(), "missing".to_string()],
        };

        let mut executor_turns = HashMap::new();
        executor_turns.insert("a", 1usize);

        assert_eq!(dependency_turn_numbers(&subtask, &executor_turns), vec![1]);
    }

    #[test]
    fn estimates_match_strategy_shapes() {
        let subtasks = vec![
            Subtask {
                name: "one".to_string(),
                description: String::new(),
                complexity: Complexity::Simple,
                dependencies: vec![],
            },
            Subtask {
                name: "two".to_string(),
                description: String::new(),
                complexity: Complexity::Complex,
                dependencies: vec![],
            },
        ];

        // 2 executors + 1 validation + synthesis
        assert_eq!(estimate_total_turns(&subtasks, StrategyKind::SingleLoop), 4);
        // 1 simple + 3-turn loop + synthesis
        assert_eq!(
            estimate_total_turns(&subtasks, StrategyKind::OneLoopPerTask),
            5
        );
        // 1 batch + 3-turn loop + synthesis
        assert_eq!(estimate_total_turns(&subtasks, StrategyKind::Mixed), 5);
    }
}
