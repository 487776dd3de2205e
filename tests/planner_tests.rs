use duologue::plan::Topology;
use duologue::planner::{AdaptiveAction, Complexity, StrategyKind, StrategyPlanner};

const DECOMPOSITION: &str = "\
Here is my breakdown of the work.

SUBTASKS:
1. gather_sources - Complexity: simple
   Description: Collect the primary references
   Dependencies: none
2. analyze_findings - Complexity: moderate
   Description: Extract the key mechanisms from the sources
   Dependencies: gather_sources
3. write_report - Complexity: complex
   Description: Draft the full report with citations
   Dependencies: gather_sources, analyze_findings

LOOP_STRATEGY: one_loop_per_task
REASONING: The writing task needs research and validation, the rest are cheap.

";

#[test]
fn parses_subtasks_strategy_and_reasoning() {
    let mut planner = StrategyPlanner::new();
    let strategy = planner.parse_decomposition(DECOMPOSITION);

    let subtasks = planner.subtasks();
    assert_eq!(subtasks.len(), 3);

    assert_eq!(subtasks[0].name, "gather_sources");
    assert_eq!(subtasks[0].complexity, Complexity::Simple);
    assert!(subtasks[0].dependencies.is_empty());

    assert_eq!(subtasks[1].complexity, Complexity::Moderate);
    assert_eq!(subtasks[1].dependencies, vec!["gather_sources"]);
    assert_eq!(
        subtasks[1].description,
        "Extract the key mechanisms from the sources"
    );

    assert_eq!(
        subtasks[2].dependencies,
        vec!["gather_sources", "analyze_findings"]
    );

    assert_eq!(strategy.kind, StrategyKind::OneLoopPerTask);
    assert!(strategy.reasoning.starts_with("The writing task"));
    // 1 simple + 2 three-turn loops + synthesis
    assert_eq!(strategy.total_estimated_turns, 8);
    // Only gather_sources has no dependencies, so no parallel group forms.
    assert!(strategy.parallel_groups.is_empty());
}

#[test]
fn per_task_loops_match_the_estimate() {
    let mut planner = StrategyPlanner::new();
    let strategy = planner.parse_decomposition(DECOMPOSITION);

    let templates = planner.generate_turn_templates().unwrap();
    assert_eq!(templates.len(), strategy.total_estimated_turns);

    // Simple subtask: one pass, no validation.
    assert_eq!(templates[0].role, "execute_gather_sources");

    // Moderate subtask: research -> execute -> validate.
    assert_eq!(templates[1].role, "research_analyze_findings");
    assert_eq!(templates[2].role, "execute_analyze_findings");
    assert_eq!(templates[3].role, "validate_analyze_findings");
    // Research sees the declared dependency's execution turn.
    assert_eq!(templates[1].context_from, vec![1]);
    assert_eq!(templates[2].context_from, vec![2]);
    assert_eq!(templates[3].context_from, vec![3]);

    // Synthesis closes the plan and references every prior turn.
    let synthesis = templates.last().unwrap();
    assert_eq!(synthesis.role, "final_synthesis");
    assert_eq!(synthesis.participant, "claude");
    assert_eq!(
        synthesis.context_from,
        (1..templates.len()).collect::<Vec<usize>>()
    );
}

#[test]
fn single_loop_adds_validation_for_nontrivial_subtasks() {
    let text = DECOMPOSITION.replace("one_loop_per_task", "single_loop");

    let mut planner = StrategyPlanner::new();
    let strategy = planner.parse_decomposition(&text);
    assert_eq!(strategy.kind, StrategyKind::SingleLoop);

    let templates = planner.generate_turn_templates().unwrap();
    // 3 executors + 2 validations + synthesis
    assert_eq!(templates.len(), 6);
    assert_eq!(templates.len(), strategy.total_estimated_turns);

    let roles: Vec<&str> = templates.iter().map(|t| t.role.as_str()).collect();
    assert_eq!(
        roles,
        vec![
            "execute_gather_sources",
            "execute_analyze_findings",
            "validate_analyze_findings",
            "execute_write_report",
            "validate_write_report",
            "final_synthesis",
        ]
    );

    // Participants alternate between executors.
    assert_eq!(templates[0].participant, "grok");
    assert_eq!(templates[1].participant, "claude");

    // write_report depends on both earlier subtasks' execution turns.
    assert_eq!(templates[3].context_from, vec![1, 2]);
}

#[test]
fn mixed_strategy_batches_simple_tasks_first() {
    let text = DECOMPOSITION.replace("one_loop_per_task", "mixed");

    let mut planner = StrategyPlanner::new();
    let strategy = planner.parse_decomposition(&text);

    let templates = planner.generate_turn_templates().unwrap();
    assert_eq!(templates.len(), strategy.total_estimated_turns);

    assert_eq!(templates[0].role, "batch_simple_tasks");
    assert!(templates[0].template.contains("gather_sources"));

    // The moderate loop's research turn resolves its dependency to the batch.
    assert_eq!(templates[1].role, "research_analyze_findings");
    assert_eq!(templates[1].context_from, vec![1]);
}

#[test]
fn unknown_strategy_falls_back_to_single_loop() {
    let text = DECOMPOSITION.replace("one_loop_per_task", "spiral");

    let mut planner = StrategyPlanner::new();
    let strategy = planner.parse_decomposition(&text);
    assert_eq!(strategy.kind, StrategyKind::SingleLoop);
}

#[test]
fn generation_requires_a_parsed_decomposition() {
    let planner = StrategyPlanner::new();
    assert!(planner.generate_turn_templates().is_err());
}

#[test]
fn build_plan_produces_a_sequential_inline_plan() {
    let mut planner = StrategyPlanner::new();
    planner.parse_decomposition(DECOMPOSITION);

    let plan = planner.build_plan().unwrap();
    assert_eq!(plan.structure, Topology::Sequential);
    assert_eq!(plan.prompts.len(), 8);
    assert_eq!(plan.metadata["strategy"], "one_loop_per_task");
    assert_eq!(plan.metadata["estimated_turns"], 8);
}

#[test]
fn failure_adaptation_maps_reports_to_actions() {
    let mut planner = StrategyPlanner::new();
    planner.parse_decomposition(DECOMPOSITION);

    match planner.adapt_on_failure("write_report", "STATUS: incomplete, missing citations") {
        AdaptiveAction::Refine { prompt } => {
            assert!(prompt.contains("REFINE: write_report"));
            assert!(prompt.contains("missing citations"));
        }
        other => panic!("expected Refine, got {:?}", other),
    }

    match planner.adapt_on_failure("write_report", "the output was incorrect") {
        AdaptiveAction::Redo { prompt } => {
            assert!(prompt.contains("EXECUTE SUBTASK: write_report"));
        }
        other => panic!("expected Redo, got {:?}", other),
    }

    assert!(matches!(
        planner.adapt_on_failure("write_report", "looks mostly fine"),
        AdaptiveAction::Continue { .. }
    ));

    assert!(matches!(
        planner.adapt_on_failure("no_such_task", "anything"),
        AdaptiveAction::Skip { .. }
    ));
}
