//! Dynamic (ROI escalation) integration tests.

use std::sync::Arc;

use tokio::sync::mpsc;

use tierflow::budget::BudgetLedger;
use tierflow::core::{PricingTable, SubtaskId, TaskGraph, Tier};
use tierflow::error::{Error, GraphError};
use tierflow::orchestration::{evaluate_escalation, DynamicConfig, DynamicExecutor};
use tierflow::run::{Decision, RunEvent, SkipReason, UpgradeBlocker};
use tierflow::simulate::{SimulatedDispatcher, TierTagScorer};

use crate::fixtures::{chain_graph, drain, round_pricing, scenario_graph, ScriptedLadder, ScriptedScorer};

fn executor(ladder: &ScriptedLadder, scorer: ScriptedScorer) -> DynamicExecutor {
    DynamicExecutor::new(ladder.dispatchers(), Arc::new(scorer), DynamicConfig::default())
}

/// Given a Fast output scoring 4.0 and a $0.0006 upgrade
/// When escalation is evaluated with money to spare
/// Then ROI of about 3333 clears the bar and the subtask moves to Verify
#[test]
fn test_low_score_with_cheap_upgrade_escalates() {
    let decision = evaluate_escalation(
        &DynamicConfig::default(),
        SubtaskId(3),
        Tier::Fast,
        4.0,
        0.0006,
        0.01,
    )
    .unwrap();
    assert_eq!(decision.decision, Decision::Upgrade);
    assert_eq!(decision.proposed_tier, Tier::Verify);
    assert_eq!(decision.roi.round(), 3333.0);
}

/// Given the same output but less than $0.0006 available
/// When escalation is evaluated
/// Then the current attempt is accepted and the reason names the budget
#[test]
fn test_low_score_without_budget_accepts() {
    let decision = evaluate_escalation(
        &DynamicConfig::default(),
        SubtaskId(3),
        Tier::Fast,
        4.0,
        0.0006,
        0.0004,
    )
    .unwrap();
    assert_eq!(decision.decision, Decision::Accept);
    assert_eq!(decision.blocker, Some(UpgradeBlocker::Budget));
    assert!(decision.reason.contains("$0.000600"));
    assert!(decision.reason.contains("$0.000400"));
}

/// Given a budget whose upstream share cannot pay for Verify
/// When a two-step chain runs with poor Fast scores
/// Then the first step is held at Fast while the sink, drawing on the reserve, upgrades
#[tokio::test]
async fn test_reserve_lets_sink_upgrade_when_upstream_cannot() {
    let graph = chain_graph(2);
    let ladder = ScriptedLadder::new(0.5);
    let ledger = BudgetLedger::new(0.004, PricingTable::default()).unwrap();
    let result = executor(&ladder, ScriptedScorer::tiers(4.0, 8.0, 9.0))
        .execute(&graph, &ledger)
        .await
        .unwrap();

    let first = result.outcome(SubtaskId(1)).unwrap();
    assert_eq!(first.tier, Some(Tier::Fast));
    assert_eq!(first.roi_decisions.len(), 1);
    assert_eq!(first.roi_decisions[0].blocker, Some(UpgradeBlocker::Budget));

    let sink = result.outcome(SubtaskId(2)).unwrap();
    assert_eq!(sink.tier, Some(Tier::Verify));
    assert_eq!(sink.chosen_attempt, Some(1));
    assert_eq!(sink.roi_decisions[0].decision, Decision::Upgrade);

    assert!(first.cost <= 0.004 * 0.65);
    assert!(result.ledger.spent <= 0.004);
}

/// Given a budget whose upstream share sits just above the Fast output ceiling
/// When a two-step chain runs at full caps with prompt tokens billed
/// Then the first step is skipped for budget while the sink still delivers
#[tokio::test]
async fn test_upstream_prompt_cost_does_not_halt_run() {
    let graph = chain_graph(2);
    let ladder = ScriptedLadder::new(1.0);
    let ledger = BudgetLedger::new(0.001264, PricingTable::default()).unwrap();
    let result = executor(&ladder, ScriptedScorer::tiers(8.0, 8.0, 8.0))
        .execute(&graph, &ledger)
        .await
        .unwrap();

    assert!(!result.is_halted());
    assert_eq!(
        result.outcome(SubtaskId(1)).unwrap().skip_reason(),
        Some(&SkipReason::BudgetExhausted)
    );
    let sink = result.outcome(SubtaskId(2)).unwrap();
    assert!(sink.is_completed());
    assert_eq!(result.deliverable, "[fast] step2");
    // 50 prompt tokens at $0.10/M plus 2048 completion tokens at $0.40/M
    assert!((result.ledger.spent - 0.0008242).abs() < 1e-12);
    assert!(result.ledger.spent <= 0.001264);
}

/// Given one subtask whose Fast output scores poorly
/// When the scenario graph runs
/// Then only that subtask is escalated and everything else stays on Fast
#[tokio::test]
async fn test_only_weak_output_is_escalated() {
    let graph = scenario_graph();
    let ladder = ScriptedLadder::new(0.5);
    let ledger = BudgetLedger::new(1.0, round_pricing()).unwrap();
    let scorer = ScriptedScorer::tiers(8.0, 8.0, 8.0).with_output("[fast] analyse", 2.0);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let result = executor(&ladder, scorer)
        .with_events(tx)
        .execute(&graph, &ledger)
        .await
        .unwrap();

    let analyse = result.outcome(SubtaskId(3)).unwrap();
    assert_eq!(analyse.tier, Some(Tier::Verify));
    assert_eq!(analyse.output, "[verify] analyse");
    assert_eq!(result.upgrades(), 1);
    for id in [1, 2, 4, 5] {
        assert_eq!(result.outcome(SubtaskId(id)).unwrap().tier, Some(Tier::Fast));
    }

    let calls = ladder.calls();
    assert_eq!(calls.len(), 6);
    assert_eq!(calls.last().unwrap().1, "synthesize");

    let upgraded: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, RunEvent::Upgraded { .. }))
        .collect();
    assert_eq!(
        upgraded,
        vec![RunEvent::Upgraded {
            subtask: SubtaskId(3),
            from: Tier::Fast,
            to: Tier::Verify
        }]
    );
}

/// Given an upgrade dispatch that fails
/// When the weak subtask escalates
/// Then its Fast attempt is kept and its dependents still run
#[tokio::test]
async fn test_failed_upgrade_keeps_earlier_attempt() {
    let graph = scenario_graph();
    let ladder = ScriptedLadder::new(0.5).failing(Tier::Verify, "analyse");
    let ledger = BudgetLedger::new(1.0, round_pricing()).unwrap();
    let scorer = ScriptedScorer::tiers(8.0, 8.0, 8.0).with_output("[fast] analyse", 2.0);
    let result = executor(&ladder, scorer).execute(&graph, &ledger).await.unwrap();

    let analyse = result.outcome(SubtaskId(3)).unwrap();
    assert!(analyse.is_completed());
    assert_eq!(analyse.output, "[fast] analyse");
    assert_eq!(analyse.attempts.len(), 1);
    assert!(result.outcome(SubtaskId(4)).unwrap().is_completed());
    assert!(result.deliverable.contains("[fast] analyse"));
}

/// Given a scorer that always errors
/// When the dynamic path runs
/// Then every subtask is accepted on its first attempt without escalation
#[tokio::test]
async fn test_scorer_outage_accepts_first_attempts() {
    let graph = scenario_graph();
    let ladder = ScriptedLadder::new(0.5);
    let ledger = BudgetLedger::new(1.0, round_pricing()).unwrap();
    let result = executor(&ladder, ScriptedScorer::failing())
        .execute(&graph, &ledger)
        .await
        .unwrap();

    assert_eq!(result.completed().count(), 5);
    assert_eq!(result.upgrades(), 0);
    for outcome in &result.outcomes {
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(outcome.attempts[0].quality, None);
    }
}

/// Given the built-in simulated tiers and tag scorer
/// When the dynamic path runs with a generous budget
/// Then every Fast output is upgraded once to Verify and accepted there
#[tokio::test]
async fn test_simulated_dynamic_run_upgrades_to_verify() {
    let graph = scenario_graph();
    let ledger = BudgetLedger::new(1.0, PricingTable::default()).unwrap();
    let result = DynamicExecutor::new(
        SimulatedDispatcher::ladder(0.5),
        Arc::new(TierTagScorer::default()),
        DynamicConfig::default(),
    )
    .execute(&graph, &ledger)
    .await
    .unwrap();

    assert_eq!(result.upgrades(), 5);
    for outcome in &result.outcomes {
        let tiers: Vec<Tier> = outcome.attempts.iter().map(|a| a.tier).collect();
        assert_eq!(tiers, vec![Tier::Fast, Tier::Verify]);
        assert_eq!(outcome.tier, Some(Tier::Verify));
    }
    assert!(result.downgrades.is_none());
    assert!(result.surplus.is_none());
}

/// Given a graph with a dependency cycle
/// When it is loaded
/// Then validation rejects it before any executor sees it
#[test]
fn test_cyclic_graph_rejected_before_run() {
    let json = r#"{"task": "loop", "subtasks": [
        {"id": 1, "description": "a", "complexity": "low", "dependencies": [3]},
        {"id": 2, "description": "b", "complexity": "low", "dependencies": [1]},
        {"id": 3, "description": "c", "complexity": "low", "dependencies": [2]}
    ]}"#;
    match TaskGraph::from_json(json) {
        Err(Error::Graph(GraphError::Cycle { path })) => {
            assert_eq!(path.first(), path.last());
            assert!(path.len() >= 4);
        }
        other => panic!("Expected cycle error, got {:?}", other.map(|g| g.len())),
    }
}
