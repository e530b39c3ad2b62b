//! Allocate-then-execute integration tests.

use tokio::sync::mpsc;

use tierflow::budget::BudgetLedger;
use tierflow::core::{SubtaskId, Tier};
use tierflow::orchestration::{Allocator, AllocatorConfig, ExecutorConfig, StaticExecutor};
use tierflow::run::{HaltRecord, RunEvent, SkipReason};
use tierflow::simulate::SimulatedDispatcher;
use tierflow::summary::RunSummary;

use crate::fixtures::{drain, round_pricing, scenario_graph, ScriptedLadder};

fn executor(ladder: &ScriptedLadder, max_concurrent: usize) -> StaticExecutor {
    StaticExecutor::new(
        ladder.dispatchers(),
        ExecutorConfig {
            max_concurrent,
            ..ExecutorConfig::default()
        },
    )
}

fn allocator() -> Allocator {
    Allocator::new(round_pricing(), AllocatorConfig::default())
}

/// Given a budget that covers the default plan
/// When the plan runs with tiers using half their caps
/// Then every subtask completes at its default tier and half the spend is recycled
#[tokio::test]
async fn test_default_plan_runs_every_subtask() {
    let graph = scenario_graph();
    let plan = allocator().allocate(&graph, 0.08).unwrap();
    assert!(plan.record.is_empty());

    let ladder = ScriptedLadder::new(0.5);
    let ledger = BudgetLedger::new(0.08, round_pricing()).unwrap();
    let result = executor(&ladder, 2).execute(&graph, &plan, &ledger).await.unwrap();

    assert_eq!(result.completed().count(), 5);
    assert_eq!(
        result.deliverable,
        "[fast] gather\n\n[fast] collect\n\n[deep] analyse\n\n[verify] chart\n\n[deep] synthesize"
    );
    assert!((result.ledger.spent - 0.037888).abs() < 1e-9);
    let audit = result.surplus.unwrap();
    assert_eq!(audit.credited, 12288);
    assert_eq!(audit.boosted, 0);
    assert!(!result.is_halted());
}

/// Given the cascade budget of $0.02
/// When the degraded plan runs at full caps
/// Then the skipped Verify subtask never dispatches and spend matches the plan
#[tokio::test]
async fn test_cascade_plan_executes_within_budget() {
    let graph = scenario_graph();
    let plan = allocator().allocate(&graph, 0.02).unwrap();

    let ladder = ScriptedLadder::new(1.0);
    let ledger = BudgetLedger::new(0.02, round_pricing()).unwrap();
    let result = executor(&ladder, 1).execute(&graph, &plan, &ledger).await.unwrap();

    assert_eq!(
        result.outcome(SubtaskId(5)).unwrap().skip_reason(),
        Some(&SkipReason::Allocator)
    );
    let calls = ladder.calls();
    assert_eq!(calls.len(), 4);
    assert!(calls.iter().all(|(tier, _, cap)| *tier == Tier::Fast && *cap == 2048));
    assert!(calls.iter().all(|(_, subtask, _)| subtask != "chart"));
    assert!((result.ledger.spent - 0.016384).abs() < 1e-9);
    assert!(result.ledger.spent <= 0.02);

    let summary = RunSummary::from_run(&result, &graph);
    assert_eq!(summary.downgraded, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.tier_counts[&Tier::Fast], 4);
}

/// Given a budget that forces token scaling
/// When tiers leave half their caps unused
/// Then later subtasks are boosted, never past the tier ceiling or the credited surplus
#[tokio::test]
async fn test_scaled_plan_recycles_surplus() {
    let graph = scenario_graph();
    let plan = allocator().allocate(&graph, 0.01).unwrap();
    assert!(plan.record.scale.is_some());

    let ladder = ScriptedLadder::new(0.5);
    let ledger = BudgetLedger::new(0.01, round_pricing()).unwrap();
    let result = executor(&ladder, 1).execute(&graph, &plan, &ledger).await.unwrap();

    let audit = result.surplus.unwrap();
    assert!(audit.boosted > 0);
    assert!(audit.boosted <= audit.credited);
    assert_eq!(audit.balance, audit.credited - audit.boosted);

    let boosted: Vec<_> = result.outcomes.iter().filter(|o| o.surplus_boost > 0).collect();
    assert!(!boosted.is_empty());
    for outcome in &result.outcomes {
        assert!(outcome.tokens_budgeted <= 2048);
    }
    // The first subtask dispatched had nothing to draw on.
    let first = &ladder.calls()[0];
    assert_eq!(first.1, "gather");
    assert!(first.2 < 2048);
    assert!(result.ledger.spent <= 0.01);
    assert!(!result.is_halted());
}

/// Given a budget below even the floor plan
/// When the infeasible plan runs at full caps
/// Then the first debit that does not fit halts the run with partial results kept
#[tokio::test]
async fn test_infeasible_plan_halts_on_refused_debit() {
    let graph = scenario_graph();
    let plan = allocator().allocate(&graph, 0.001).unwrap();
    assert!(plan.allocation.is_infeasible());

    let ladder = ScriptedLadder::new(1.0);
    let ledger = BudgetLedger::new(0.001, round_pricing()).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = executor(&ladder, 1)
        .with_events(tx)
        .execute(&graph, &plan, &ledger)
        .await
        .unwrap();

    match &result.halt {
        Some(HaltRecord::Debit { subtask, .. }) => assert_eq!(*subtask, SubtaskId(4)),
        other => panic!("Expected debit halt, got {:?}", other),
    }
    assert!(result.outcome(SubtaskId(4)).unwrap().is_failed());
    for id in [1, 2, 3] {
        assert!(result.outcome(SubtaskId(id)).unwrap().is_completed());
    }
    assert!((result.ledger.spent - 0.000768).abs() < 1e-12);
    assert!(result.ledger.spent <= 0.001);
    assert_eq!(result.deliverable, "[fast] gather\n\n[fast] collect\n\n[fast] analyse");

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(e, RunEvent::Halted(_))));
    assert!(matches!(events.last(), Some(RunEvent::RunComplete { .. })));
}

/// Given a dependency whose dispatch fails
/// When the plan runs
/// Then only its downstream subtasks are skipped and independent branches finish
#[tokio::test]
async fn test_failure_is_contained_to_downstream() {
    let graph = scenario_graph();
    let plan = allocator().allocate(&graph, 0.08).unwrap();

    let ladder = ScriptedLadder::new(0.5).failing(Tier::Verify, "chart");
    let ledger = BudgetLedger::new(0.08, round_pricing()).unwrap();
    let result = executor(&ladder, 2).execute(&graph, &plan, &ledger).await.unwrap();

    assert!(result.outcome(SubtaskId(5)).unwrap().is_failed());
    assert_eq!(
        result.outcome(SubtaskId(4)).unwrap().skip_reason(),
        Some(&SkipReason::DependencyFailed {
            dependency: SubtaskId(5)
        })
    );
    for id in [1, 2, 3] {
        assert!(result.outcome(SubtaskId(id)).unwrap().is_completed());
    }
    assert!(!result.is_halted());
    assert!(!ladder.calls().iter().any(|(_, subtask, _)| subtask == "synthesize"));
}

/// Given the built-in simulated tiers
/// When the static path runs on default pricing
/// Then the run completes and the JSON result reads back
#[tokio::test]
async fn test_simulated_static_run_serializes() {
    let graph = scenario_graph();
    let pricing = tierflow::core::PricingTable::default();
    let plan = Allocator::new(pricing.clone(), AllocatorConfig::default())
        .allocate(&graph, 1.0)
        .unwrap();
    let ledger = BudgetLedger::new(1.0, pricing).unwrap();
    let result = StaticExecutor::new(SimulatedDispatcher::ladder(0.25), ExecutorConfig::default())
        .execute(&graph, &plan, &ledger)
        .await
        .unwrap();

    assert_eq!(result.completed().count(), 5);
    let json = serde_json::to_string(&result).unwrap();
    let back: tierflow::run::RunResult = serde_json::from_str(&json).unwrap();
    assert_eq!(back.run_id, result.run_id);
    assert_eq!(back.outcomes.len(), 5);
    assert_eq!(back.deliverable, result.deliverable);
}
