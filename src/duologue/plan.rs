//! Plan configuration: the declarative description of a dialogue.
//!
//! A plan is an ordered list of turn templates plus a topology tag, loaded
//! from a JSON file in the modes directory (or supplied inline). The engine
//! consumes plans, it does not own them — see
//! [`ProtocolEngine::run`](crate::ProtocolEngine::run).

use crate::duologue::engine::ProtocolError;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// The structural pattern governing turn ordering within one plan execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Topology {
    Sequential,
    Parallel,
    Mixed,
    /// Catch-all for unrecognized tags; rejected with a
    /// [`ProtocolError::UnknownTopology`] before any turn executes.
    Unknown,
}

impl Topology {
    /// Parse a topology tag. Unrecognized tags map to [`Topology::Unknown`]
    /// so a plan file can be loaded and rejected with a precise error at run
    /// time instead of a generic parse failure.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "sequential" => Topology::Sequential,
            "parallel" => Topology::Parallel,
            "mixed" => Topology::Mixed,
            _ => Topology::Unknown,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Topology::Sequential => "sequential",
            Topology::Parallel => "parallel",
            Topology::Mixed => "mixed",
            Topology::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl Serialize for Topology {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for Topology {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(Topology::from_tag(&tag))
    }
}

/// Template for one turn of a plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TurnTemplate {
    /// Free-text role label (e.g. `"opening_statement"`).
    #[serde(default)]
    pub role: String,
    /// Participant tag, resolved against the engine's participant registry.
    pub participant: String,
    /// Prompt template with `{topic}` / `{turn_N}` placeholders.
    pub template: String,
    /// Optional instruction prepended to the rendered prompt.
    #[serde(default)]
    pub role_instruction: Option<String>,
    /// Model override; when absent the participant's default model is used.
    #[serde(default)]
    pub model: Option<String>,
    /// Sequence numbers of prior turns whose results feed this turn's context.
    #[serde(default)]
    pub context_from: Vec<usize>,
    /// Per-turn timeout override in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Per-turn retry budget override.
    #[serde(default)]
    pub max_retries: Option<usize>,
    /// Whether the dynamic layer may prepend an adaptive instruction.
    #[serde(default)]
    pub adaptive: bool,
}

impl TurnTemplate {
    pub fn new(
        role: impl Into<String>,
        participant: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            participant: participant.into(),
            template: template.into(),
            role_instruction: None,
            model: None,
            context_from: Vec::new(),
            timeout_secs: None,
            max_retries: None,
            adaptive: false,
        }
    }

    /// Set the dependency list (builder pattern).
    pub fn with_context_from(mut self, context_from: Vec<usize>) -> Self {
        self.context_from = context_from;
        self
    }
}

/// One phase of a mixed-topology plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase {
    /// `sequential` or `parallel`; anything else runs sequentially.
    #[serde(rename = "type")]
    pub kind: Topology,
    /// Sequence numbers belonging to this phase, 1-based.
    pub turns: Vec<usize>,
}

/// A full dialogue plan.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanConfig {
    pub structure: Topology,
    /// Number of turns to execute; defaults to the full prompt list.
    #[serde(default)]
    pub turns: Option<usize>,
    pub prompts: Vec<TurnTemplate>,
    /// Mixed topology only; ignored by the other two.
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl PlanConfig {
    /// Resolve the number of turns to run, honoring a caller override but
    /// never exceeding the configured prompt list.
    pub fn effective_turn_count(&self, turns_override: Option<usize>) -> usize {
        let configured = self.turns.unwrap_or(self.prompts.len());
        turns_override
            .unwrap_or(configured)
            .min(self.prompts.len())
    }
}

/// Loads named plans from a directory of JSON mode files.
pub struct PlanLoader {
    modes_dir: PathBuf,
}

impl PlanLoader {
    pub fn new(modes_dir: impl Into<PathBuf>) -> Self {
        Self {
            modes_dir: modes_dir.into(),
        }
    }

    /// Load `<modes_dir>/<name>.json`.
    ///
    /// A missing file is a fatal, non-retryable [`ProtocolError::PlanNotFound`];
    /// malformed JSON is [`ProtocolError::InvalidPlan`].
    pub fn load_plan(&self, name: &str) -> Result<PlanConfig, ProtocolError> {
        let path = self.modes_dir.join(format!("{}.json", name));

        let raw = std::fs::read_to_string(&path)
            .map_err(|_| ProtocolError::PlanNotFound(format!("{} ({})", name, path.display())))?;

        serde_json::from_str(&raw).map_err(|err| ProtocolError::InvalidPlan {
            name: name.to_string(),
            detail: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_turn_count_is_clamped_to_prompts() {
        let plan = PlanConfig {
            structure: Topology::Sequential,
            turns: None,
            prompts: vec![
                TurnTemplate::new("a", "claude", "x"),
                TurnTemplate::new("b", "grok", "y"),
            ],
            phases: vec![],
            metadata: HashMap::new(),
        };

        assert_eq!(plan.effective_turn_count(None), 2);
        assert_eq!(plan.effective_turn_count(Some(1)), 1);
        assert_eq!(plan.effective_turn_count(Some(10)), 2);
    }

    #[test]
    fn unknown_topology_tag_deserializes_to_unknown() {
        let raw = r#"{
            "structure": "ring",
            "prompts": [
                { "role": "a", "participant": "claude", "template": "{topic}" }
            ]
        }"#;

        let plan: PlanConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(plan.structure, Topology::Unknown);
    }

    #[test]
    fn phase_kind_uses_type_tag() {
        let raw = r#"{ "type": "parallel", "turns": [2, 3] }"#;
        let phase: Phase = serde_json::from_str(raw).unwrap();
        assert_eq!(phase.kind, Topology::Parallel);
        assert_eq!(phase.turns, vec![2, 3]);
    }
}
