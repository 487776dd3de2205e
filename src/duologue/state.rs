//! Session persistence and transcript export.
//!
//! The engine only needs two side effects — "persist this turn" and "persist
//! this completed session" — expressed by the [`StateSink`] trait. Both are
//! fire-and-forget from the orchestrator's perspective: a sink failure is
//! logged and never fails a turn.
//!
//! [`FileStateManager`] is the default implementation: one JSON file per
//! session under a sessions directory, plus a markdown transcript exporter.
//! [`NullStateSink`] is a no-op for callers that do not persist.

use crate::duologue::turn::{Conversation, Turn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug)]
pub enum StateError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    NotFound(String),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Io(err) => write!(f, "I/O error: {}", err),
            StateError::Serialization(err) => write!(f, "Serialization error: {}", err),
            StateError::NotFound(session_id) => write!(f, "Session not found: {}", session_id),
        }
    }
}

impl Error for StateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StateError::Io(err) => Some(err),
            StateError::Serialization(err) => Some(err),
            StateError::NotFound(_) => None,
        }
    }
}

impl From<std::io::Error> for StateError {
    fn from(err: std::io::Error) -> Self {
        StateError::Io(err)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err)
    }
}

/// Persistence seam consumed by the engine.
///
/// `record_turn` must be idempotent on duplicate sequence numbers: a second
/// write of the same turn number for a session is a no-op.
#[async_trait]
pub trait StateSink: Send + Sync {
    async fn record_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StateError>;

    async fn record_session(&self, conversation: &Conversation) -> Result<(), StateError>;
}

/// Sink that discards everything.
pub struct NullStateSink;

#[async_trait]
impl StateSink for NullStateSink {
    async fn record_turn(&self, _session_id: &str, _turn: &Turn) -> Result<(), StateError> {
        Ok(())
    }

    async fn record_session(&self, _conversation: &Conversation) -> Result<(), StateError> {
        Ok(())
    }
}

/// Lightweight session metadata returned by [`FileStateManager::list_sessions`].
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub session_id: String,
    pub mode: String,
    pub topic: String,
    pub turns: usize,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub status: &'static str,
}

/// JSON-file-per-session persistence.
pub struct FileStateManager {
    sessions_dir: PathBuf,
}

impl FileStateManager {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let sessions_dir = sessions_dir.into();
        fs::create_dir_all(&sessions_dir)?;
        log::info!("State manager initialized: {}", sessions_dir.display());
        Ok(Self { sessions_dir })
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.json", session_id))
    }

    /// Save a complete conversation, overwriting any previous snapshot.
    pub fn save_conversation(&self, conversation: &Conversation) -> Result<PathBuf, StateError> {
        let path = self.session_path(&conversation.session_id);
        let data = serde_json::to_string_pretty(conversation)?;
        fs::write(&path, data)?;
        log::debug!("Conversation saved: {}", path.display());
        Ok(path)
    }

    pub fn load_conversation(&self, session_id: &str) -> Result<Conversation, StateError> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Err(StateError::NotFound(session_id.to_string()));
        }

        let raw = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// List recent sessions, most recently modified first.
    ///
    /// Files that fail to parse are skipped with a warning rather than
    /// failing the whole listing.
    pub fn list_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>, StateError> {
        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();

        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let modified = entry
                    .metadata()?
                    .modified()
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                files.push((modified, path));
            }
        }

        files.sort_by(|a, b| b.0.cmp(&a.0));

        let mut sessions = Vec::new();
        for (_, path) in files.into_iter().take(limit) {
            match fs::read_to_string(&path)
                .map_err(StateError::from)
                .and_then(|raw| serde_json::from_str::<Conversation>(&raw).map_err(StateError::from))
            {
                Ok(conversation) => {
                    let status = if conversation.completed_at.is_some() {
                        "completed"
                    } else {
                        "in_progress"
                    };
                    sessions.push(SessionSummary {
                        session_id: conversation.session_id,
                        mode: conversation.mode,
                        topic: conversation.topic,
                        turns: conversation.turns.len(),
                        started_at: conversation.started_at,
                        completed_at: conversation.completed_at,
                        status,
                    });
                }
                Err(err) => {
                    log::warn!("Error loading session {}: {}", path.display(), err);
                }
            }
        }

        Ok(sessions)
    }

    /// Delete a session file. Returns whether a file was removed.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, StateError> {
        let path = self.session_path(session_id);
        if path.exists() {
            fs::remove_file(&path)?;
            log::info!("Session deleted: {}", session_id);
            Ok(true)
        } else {
            log::warn!("Session not found for deletion: {}", session_id);
            Ok(false)
        }
    }

    /// Export a conversation transcript to a markdown file next to its JSON.
    pub fn export_markdown(
        &self,
        conversation: &Conversation,
        output_path: Option<&Path>,
    ) -> Result<PathBuf, StateError> {
        let path = match output_path {
            Some(path) => path.to_path_buf(),
            None => self
                .sessions_dir
                .join(format!("{}.md", conversation.session_id)),
        };

        fs::write(&path, render_markdown(conversation))?;
        log::info!("Markdown exported: {}", path.display());
        Ok(path)
    }
}

#[async_trait]
impl StateSink for FileStateManager {
    /// Incrementally record a turn so a session survives a crash mid-run.
    async fn record_turn(&self, session_id: &str, turn: &Turn) -> Result<(), StateError> {
        let mut conversation = match self.load_conversation(session_id) {
            Ok(conversation) => conversation,
            Err(StateError::NotFound(_)) => Conversation::new(
                session_id,
                "unknown",
                "",
                HashMap::new(),
                turn.timestamp.clone(),
            ),
            Err(err) => return Err(err),
        };

        // Idempotent on duplicate sequence numbers.
        if conversation.turns.iter().any(|t| t.number == turn.number) {
            return Ok(());
        }

        conversation.turns.push(turn.clone());
        self.save_conversation(&conversation)?;
        Ok(())
    }

    async fn record_session(&self, conversation: &Conversation) -> Result<(), StateError> {
        self.save_conversation(conversation)?;
        Ok(())
    }
}

/// Render a conversation transcript as markdown, including per-turn cost,
/// token, latency, and retry details plus the session cost summary.
pub fn render_markdown(conversation: &Conversation) -> String {
    // Recompute aggregates locally so an unfinalized snapshot still reports
    // accurate totals.
    let total_cost: f64 = conversation.turns.iter().map(|t| t.cost).sum();
    let total_tokens: usize = conversation.turns.iter().map(|t| t.tokens.total).sum();

    let mut md = format!(
        "# AI Dialogue: {} ({} Mode)\n\n",
        conversation.topic, conversation.mode
    );
    md.push_str(&format!("**Session**: {}\n", conversation.session_id));
    md.push_str(&format!("**Mode**: {}\n", conversation.mode));
    md.push_str(&format!("**Turns**: {}\n", conversation.turns.len()));
    md.push_str(&format!("**Started**: {}\n", conversation.started_at));
    md.push_str(&format!(
        "**Completed**: {}\n",
        conversation.completed_at.as_deref().unwrap_or("in progress")
    ));
    md.push_str(&format!("**Total Tokens**: {}\n", total_tokens));
    md.push_str(&format!("**Total Cost**: ${:.6}\n", total_cost));
    if !conversation.turns.is_empty() {
        md.push_str(&format!(
            "**Avg Cost per Turn**: ${:.6}\n",
            total_cost / conversation.turns.len() as f64
        ));
    }
    md.push_str("\n---\n\n");

    for turn in &conversation.turns {
        md.push_str(&format!(
            "## Turn {}: {} ({})\n\n",
            turn.number, turn.role, turn.participant
        ));
        md.push_str(&format!("**Timestamp**: {}\n", turn.timestamp));
        md.push_str(&format!("**Model**: {}\n", turn.model));
        md.push_str(&format!(
            "**Tokens**: {} prompt + {} completion = {} total\n",
            turn.tokens.prompt, turn.tokens.completion, turn.tokens.total
        ));
        md.push_str(&format!("**Cost**: ${:.6}\n", turn.cost));
        md.push_str(&format!("**Latency**: {:.2}s\n", turn.latency));

        if turn.retry_count > 0 {
            md.push_str(&format!("**Retries**: {}\n", turn.retry_count));
        }

        if let Some(error) = &turn.error {
            md.push_str(&format!("**Error**: {}\n", error));
        }

        if !turn.context_from.is_empty() {
            let numbers: Vec<String> =
                turn.context_from.iter().map(|n| n.to_string()).collect();
            md.push_str(&format!("**Context From**: Turns {}\n", numbers.join(", ")));
        }

        md.push_str(&format!("\n{}\n\n", turn.response));
        md.push_str("---\n\n");
    }

    md
}
