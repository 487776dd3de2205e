use duologue::client_wrapper::TokenUsage;
use duologue::state::{render_markdown, FileStateManager, StateSink};
use duologue::turn::{Conversation, Turn};
use std::collections::HashMap;

fn turn(number: usize, response: &str) -> Turn {
    Turn {
        number,
        role: format!("role_{}", number),
        participant: "claude".to_string(),
        model: "claude-3-sonnet-20240229".to_string(),
        prompt: format!("prompt {}", number),
        response: response.to_string(),
        tokens: TokenUsage::new(100, 50),
        latency: 1.25,
        timestamp: "2026-08-06T12:00:00Z".to_string(),
        context_from: vec![],
        cost: 0.0105,
        error: None,
        retry_count: 0,
    }
}

fn conversation(session_id: &str) -> Conversation {
    Conversation::new(
        session_id,
        "loop",
        "rust idioms",
        HashMap::new(),
        "2026-08-06T12:00:00Z",
    )
}

#[tokio::test]
async fn record_turn_creates_and_extends_a_session_file() {
    let dir = tempfile::tempdir().unwrap();
    let manager = FileStateManager::new(dir.path()).unwrap();

    manager.record_turn("s1", &turn(1, "first")).await.unwrap();
    manager.record_turn("s1", &turn(2, "second")).await.unwrap();

    let loaded = manager.load_conversation("s1").unwrap();
    assert_eq!(loaded.turns.len(), 2);
    assert_eq!(loaded.turns[0].response, "first");
    // A session bootstrapped from its first turn is not yet finalized.
    assert!(loaded.completed_at.is_none());
}

#[tokio::test]
async fn duplicate_turn_numbers_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let manager = FileStateManager::new(dir.path()).unwrap();

    manager.record_turn("s1", &turn(1, "original")).await.unwrap();
    manager.record_turn("s1", &turn(1, "replayed")).await.unwrap();

    let loaded = manager.load_conversation("s1").unwrap();
    assert_eq!(loaded.turns.len(), 1);
    assert_eq!(loaded.turns[0].response, "original");
}

#[tokio::test]
async fn record_session_roundtrips_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let manager = FileStateManager::new(dir.path()).unwrap();

    let mut conversation = conversation("s2");
    conversation.turns.push(turn(1, "only"));
    conversation.completed_at = Some("2026-08-06T12:05:00Z".to_string());
    conversation.update_totals();

    manager.record_session(&conversation).await.unwrap();

    let loaded = manager.load_conversation("s2").unwrap();
    assert_eq!(loaded.mode, "loop");
    assert_eq!(loaded.topic, "rust idioms");
    assert_eq!(loaded.turns.len(), 1);
    assert!((loaded.total_cost - 0.0105).abs() < 1e-9);
    assert_eq!(loaded.total_tokens, 150);
}

#[tokio::test]
async fn listing_reports_status_and_skips_nothing_valid() {
    let dir = tempfile::tempdir().unwrap();
    let manager = FileStateManager::new(dir.path()).unwrap();

    let mut finished = conversation("finished");
    finished.completed_at = Some("2026-08-06T12:05:00Z".to_string());
    manager.record_session(&finished).await.unwrap();

    manager
        .record_turn("in-flight", &turn(1, "partial"))
        .await
        .unwrap();

    let sessions = manager.list_sessions(20).unwrap();
    assert_eq!(sessions.len(), 2);

    let by_id: HashMap<&str, &str> = sessions
        .iter()
        .map(|s| (s.session_id.as_str(), s.status))
        .collect();
    assert_eq!(by_id["finished"], "completed");
    assert_eq!(by_id["in-flight"], "in_progress");
}

#[tokio::test]
async fn delete_session_reports_whether_anything_was_removed() {
    let dir = tempfile::tempdir().unwrap();
    let manager = FileStateManager::new(dir.path()).unwrap();

    manager.record_session(&conversation("doomed")).await.unwrap();

    assert!(manager.delete_session("doomed").unwrap());
    assert!(!manager.delete_session("doomed").unwrap());
    assert!(manager.load_conversation("doomed").is_err());
}

#[test]
fn markdown_export_includes_costs_and_errors() {
    let mut conversation = conversation("md");
    conversation.turns.push(turn(1, "a fine answer"));

    let mut failed = turn(2, "[Error: Timeout after 30s]");
    failed.error = Some("Timeout after 30s".to_string());
    failed.retry_count = 3;
    failed.cost = 0.0;
    failed.tokens = TokenUsage::zero();
    failed.context_from = vec![1];
    conversation.turns.push(failed);

    let md = render_markdown(&conversation);

    assert!(md.contains("# AI Dialogue: rust idioms"));
    assert!(md.contains("**Total Cost**: $0.010500"));
    assert!(md.contains("**Tokens**: 100 prompt + 50 completion = 150 total"));
    assert!(md.contains("**Retries**: 3"));
    assert!(md.contains("**Error**: Timeout after 30s"));
    assert!(md.contains("**Context From**: Turns 1"));
    assert!(md.contains("a fine answer"));
}

#[tokio::test]
async fn markdown_file_export_lands_next_to_the_json() {
    let dir = tempfile::tempdir().unwrap();
    let manager = FileStateManager::new(dir.path()).unwrap();

    let mut conversation = conversation("exported");
    conversation.turns.push(turn(1, "body text"));

    let path = manager.export_markdown(&conversation, None).unwrap();
    assert!(path.ends_with("exported.md"));

    let contents = std::fs::read_to_string(path).unwrap();
    assert!(contents.contains("body text"));
}
