//! Dynamic executor: start cheap, escalate on evidence.
//!
//! Every subtask first runs on the bottom rung. Its output is scored, and
//! only when the score misses the quality bar and the expected quality lift
//! per dollar of the next rung clears the ROI bar does the subtask run
//! again one rung up. The highest-scoring attempt wins.
//!
//! A fixed fraction of the budget is held back for the sink, which
//! synthesizes the deliverable. Other subtasks can never spend into it.

use crate::budget::BudgetLedger;
use crate::core::graph::TaskGraph;
use crate::core::subtask::SubtaskId;
use crate::core::tier::{estimate_prompt_tokens, Tier};
use crate::error::{Error, Result};
use crate::orchestration::context::{assemble_deliverable, ContextCompressor, Passthrough, PromptBuilder};
use crate::orchestration::dispatch::{QualityScorer, TierDispatchers};
use crate::run::{
    Attempt, Decision, HaltRecord, RoiDecision, RunEvent, RunId, RunMode, RunResult, SkipReason,
    SubtaskOutcome, UpgradeBlocker,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dynamic executor tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicConfig {
    /// Scores at or above this are accepted outright.
    pub quality_threshold: f64,
    /// Minimum expected quality lift per dollar to justify an upgrade.
    pub roi_threshold: f64,
    /// Share of the budget held back for the sink.
    pub reserve_fraction: f64,
    pub lift_fast_to_verify: f64,
    pub lift_verify_to_deep: f64,
    /// Per-dispatch timeout in seconds.
    pub dispatch_timeout_secs: u64,
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 6.0,
            roi_threshold: 50.0,
            reserve_fraction: 0.35,
            lift_fast_to_verify: 2.0,
            lift_verify_to_deep: 1.5,
            dispatch_timeout_secs: 120,
        }
    }
}

impl DynamicConfig {
    /// Expected quality lift of moving from `from` to `to`.
    ///
    /// Only adjacent rungs have a lift; the ladder is climbed one step at a time.
    pub fn lift(&self, from: Tier, to: Tier) -> Option<f64> {
        match (from, to) {
            (Tier::Fast, Tier::Verify) => Some(self.lift_fast_to_verify),
            (Tier::Verify, Tier::Deep) => Some(self.lift_verify_to_deep),
            _ => None,
        }
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if !(0.0..1.0).contains(&self.reserve_fraction) {
            return Err(format!(
                "reserve_fraction must be in [0, 1), got {}",
                self.reserve_fraction
            ));
        }
        if !self.quality_threshold.is_finite() || !self.roi_threshold.is_finite() {
            return Err("quality and ROI thresholds must be finite".to_string());
        }
        Ok(())
    }
}

/// Decide whether a subtask that scored `quality` at `current` should move up a rung.
///
/// Returns `None` at the top of the ladder. Otherwise the upgrade happens
/// only if `lift / upgrade_cost` reaches the ROI threshold and
/// `upgrade_cost` fits in `available`.
pub fn evaluate_escalation(
    config: &DynamicConfig,
    subtask: SubtaskId,
    current: Tier,
    quality: f64,
    upgrade_cost: f64,
    available: f64,
) -> Option<RoiDecision> {
    let proposed = current.next()?;
    let lift = config.lift(current, proposed)?;
    let roi = if upgrade_cost > 0.0 {
        lift / upgrade_cost
    } else {
        f64::INFINITY
    };

    let (decision, blocker, reason) = if roi < config.roi_threshold {
        (
            Decision::Accept,
            Some(UpgradeBlocker::Roi),
            format!(
                "Quality {:.1} < {}, ROI {:.0} < {}, not worth upgrading",
                quality, config.quality_threshold, roi, config.roi_threshold
            ),
        )
    } else if upgrade_cost > available {
        (
            Decision::Accept,
            Some(UpgradeBlocker::Budget),
            format!(
                "Quality {:.1} < {}, but upgrade cost ${:.6} > ${:.6} available",
                quality, config.quality_threshold, upgrade_cost, available
            ),
        )
    } else {
        (
            Decision::Upgrade,
            None,
            format!(
                "Quality {:.1} < {}, ROI {:.0} >= {}, upgrading",
                quality, config.quality_threshold, roi, config.roi_threshold
            ),
        )
    };

    Some(RoiDecision {
        subtask,
        current_tier: current,
        current_quality: quality,
        proposed_tier: proposed,
        upgrade_cost,
        expected_lift: lift,
        roi,
        decision,
        blocker,
        reason,
    })
}

/// Index of the highest-scoring attempt; the earliest wins ties.
fn best_attempt(attempts: &[Attempt]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, attempt) in attempts.iter().enumerate() {
        let score = attempt.quality.unwrap_or(f64::NEG_INFINITY);
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((index, score)),
        }
    }
    best.map(|(index, _)| index)
}

/// How the attempt loop for one subtask ended.
enum Settled {
    /// Pick this attempt.
    Chosen(usize),
    /// The very first dispatch failed.
    Failed(String),
    /// The very first dispatch could not be paid for within the upstream share.
    Unpaid,
}

pub struct DynamicExecutor {
    dispatchers: TierDispatchers,
    scorer: Arc<dyn QualityScorer>,
    compressor: Arc<dyn ContextCompressor>,
    config: DynamicConfig,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl DynamicExecutor {
    pub fn new(
        dispatchers: TierDispatchers,
        scorer: Arc<dyn QualityScorer>,
        config: DynamicConfig,
    ) -> Self {
        Self {
            dispatchers,
            scorer,
            compressor: Arc::new(Passthrough),
            config,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn ContextCompressor>) -> Self {
        self.compressor = compressor;
        self
    }

    /// Stop before the next subtask once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn push(&self, outcomes: &mut Vec<SubtaskOutcome>, outcome: SubtaskOutcome) {
        self.emit(RunEvent::for_outcome(&outcome));
        outcomes.push(outcome);
    }

    /// Run every subtask of `graph`, sink last, paying from `ledger`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid [`DynamicConfig`]. Dispatch
    /// failures and refused debits are recorded in the returned [`RunResult`].
    pub async fn execute(&self, graph: &TaskGraph, ledger: &BudgetLedger) -> Result<RunResult> {
        self.config.validate().map_err(Error::Config)?;

        let run_id = RunId::new();
        let started_at = Utc::now();
        let pricing = ledger.pricing();
        let limit = self.config.dispatch_timeout();

        let spent_at_start = ledger.spent();
        let remaining = ledger.remaining();
        let reserve = remaining * self.config.reserve_fraction;
        let upstream_ceiling = spent_at_start + (remaining - reserve);
        info!(
            run = %run_id.short(),
            subtasks = graph.len(),
            budget = ledger.budget(),
            reserve,
            "dynamic run starting"
        );

        let sink = graph.sink();
        let order: Vec<SubtaskId> = graph
            .topological_order()
            .iter()
            .copied()
            .filter(|&id| id != sink)
            .chain(std::iter::once(sink))
            .collect();

        let builder = PromptBuilder::new(graph.task(), self.compressor.as_ref());
        let mut outcomes: Vec<SubtaskOutcome> = Vec::with_capacity(graph.len());
        let mut outputs: HashMap<SubtaskId, String> = HashMap::new();
        let mut blocked: HashSet<SubtaskId> = HashSet::new();
        let mut halt: Option<HaltRecord> = None;

        'subtasks: for id in order {
            let Some(subtask) = graph.get(id) else {
                continue;
            };
            if self.cancel.is_cancelled() {
                warn!(run = %run_id.short(), "run cancelled");
                halt = Some(HaltRecord::Cancelled);
                break;
            }
            if let Some(&dependency) = subtask.dependencies.iter().find(|d| blocked.contains(d)) {
                info!(subtask = %id, %dependency, "skipping, dependency failed");
                blocked.insert(id);
                let reason = SkipReason::DependencyFailed { dependency };
                self.push(&mut outcomes, SubtaskOutcome::skipped(id, &subtask.description, reason, None));
                continue;
            }

            // The sink may spend the reserve plus anything left upstream.
            let ceiling = if id == sink {
                ledger.budget()
            } else {
                upstream_ceiling
            };
            let prompt = builder.build(subtask, &outputs);
            let prompt_estimate = estimate_prompt_tokens(&prompt);
            let floor_cost = pricing.worst_case_with_prompt(Tier::bottom(), prompt_estimate);
            if floor_cost > ledger.available_within(ceiling) {
                warn!(
                    subtask = %id,
                    needed = floor_cost,
                    available = ledger.available_within(ceiling),
                    "cannot afford the cheapest tier"
                );
                let outcome = SubtaskOutcome::skipped(
                    id,
                    &subtask.description,
                    SkipReason::BudgetExhausted,
                    None,
                );
                self.push(&mut outcomes, outcome);
                continue;
            }

            let mut attempts: Vec<Attempt> = Vec::new();
            let mut decisions: Vec<RoiDecision> = Vec::new();
            let mut tier = Tier::bottom();

            let settled = loop {
                let max_tokens = pricing.max_tokens(tier);
                info!(subtask = %id, %tier, max_tokens, "dispatching");
                self.emit(RunEvent::SubtaskStarted {
                    subtask: id,
                    tier,
                    max_tokens,
                });

                let dispatch = match self.dispatchers.dispatch(tier, &prompt, max_tokens, limit).await {
                    Ok(dispatch) => dispatch,
                    Err(err) => {
                        warn!(subtask = %id, %tier, error = %err, "dispatch failed");
                        match best_attempt(&attempts) {
                            Some(index) => break Settled::Chosen(index),
                            None => break Settled::Failed(err.to_string()),
                        }
                    }
                };

                let cost = ledger.cost(tier, dispatch.prompt_tokens, dispatch.completion_tokens);
                if let Err(err) = ledger.debit_within(cost, ceiling) {
                    // Only spend the whole budget cannot cover ends the run.
                    // Going over the upstream share costs this subtask alone.
                    let remaining = ledger.remaining();
                    if id == sink || cost > remaining {
                        warn!(subtask = %id, error = %err, "debit refused, halting run");
                        halt = Some(HaltRecord::Debit {
                            subtask: id,
                            requested: cost,
                            remaining,
                        });
                        match best_attempt(&attempts) {
                            Some(index) => break Settled::Chosen(index),
                            None => break Settled::Failed(err.to_string()),
                        }
                    }
                    warn!(subtask = %id, %tier, error = %err, "debit exceeds upstream share, dropping attempt");
                    match best_attempt(&attempts) {
                        Some(index) => break Settled::Chosen(index),
                        None => break Settled::Unpaid,
                    }
                }

                let verdict = self.scorer.quick_score(&dispatch.output, graph.task()).await;
                let (quality, rationale) = match verdict {
                    Ok(v) => (Some(v.score), v.rationale),
                    Err(err) => (None, err.to_string()),
                };
                info!(subtask = %id, %tier, quality = ?quality, cost, "attempt scored");
                attempts.push(Attempt {
                    tier,
                    output: dispatch.output,
                    quality,
                    rationale,
                    cost,
                    prompt_tokens: dispatch.prompt_tokens,
                    completion_tokens: dispatch.completion_tokens,
                });
                let current = attempts.len() - 1;

                let Some(score) = quality else {
                    debug!(subtask = %id, "scorer failed, accepting attempt");
                    break Settled::Chosen(current);
                };
                if score >= self.config.quality_threshold {
                    break Settled::Chosen(current);
                }

                let upgrade_cost = tier
                    .next()
                    .map(|t| pricing.worst_case_with_prompt(t, prompt_estimate))
                    .unwrap_or(0.0);
                let available = ledger.available_within(ceiling);
                let Some(decision) =
                    evaluate_escalation(&self.config, id, tier, score, upgrade_cost, available)
                else {
                    // Top rung.
                    break Settled::Chosen(best_attempt(&attempts).unwrap_or(current));
                };
                info!(subtask = %id, decision = ?decision.decision, roi = decision.roi, reason = %decision.reason, "escalation evaluated");
                let upgrade = decision.decision == Decision::Upgrade;
                let proposed = decision.proposed_tier;
                decisions.push(decision);
                if !upgrade {
                    break Settled::Chosen(best_attempt(&attempts).unwrap_or(current));
                }
                self.emit(RunEvent::Upgraded {
                    subtask: id,
                    from: tier,
                    to: proposed,
                });
                tier = proposed;
            };

            let cost: f64 = attempts.iter().map(|a| a.cost).sum();
            let prompt_tokens: u64 = attempts.iter().map(|a| a.prompt_tokens).sum();
            let completion_tokens: u64 = attempts.iter().map(|a| a.completion_tokens).sum();

            let mut outcome = match settled {
                Settled::Unpaid => SubtaskOutcome::skipped(
                    id,
                    &subtask.description,
                    SkipReason::BudgetExhausted,
                    None,
                ),
                Settled::Failed(error) => {
                    blocked.insert(id);
                    SubtaskOutcome::failed(id, &subtask.description, error, tier)
                }
                Settled::Chosen(index) => {
                    let chosen = &attempts[index];
                    outputs.insert(id, chosen.output.clone());
                    let mut outcome = SubtaskOutcome::completed(
                        id,
                        &subtask.description,
                        chosen.tier,
                        chosen.output.clone(),
                    );
                    outcome.tokens_budgeted = pricing.max_tokens(chosen.tier);
                    outcome.chosen_attempt = Some(index);
                    outcome
                }
            };
            outcome.cost = cost;
            outcome.prompt_tokens = prompt_tokens;
            outcome.completion_tokens = completion_tokens;
            outcome.attempts = attempts;
            outcome.roi_decisions = decisions;
            self.push(&mut outcomes, outcome);

            if halt.is_some() {
                break 'subtasks;
            }
        }

        if let Some(record) = &halt {
            self.emit(RunEvent::Halted(record.clone()));
            let recorded: HashSet<SubtaskId> = outcomes.iter().map(|o| o.id).collect();
            for subtask in graph.subtasks().filter(|s| !recorded.contains(&s.id)) {
                let outcome =
                    SubtaskOutcome::skipped(subtask.id, &subtask.description, SkipReason::RunHalted, None);
                self.push(&mut outcomes, outcome);
            }
        }

        let deliverable = assemble_deliverable(
            outcomes
                .iter()
                .filter(|o| o.is_completed())
                .map(|o| o.output.as_str()),
        );
        let snapshot = ledger.snapshot();
        let upgrades = outcomes
            .iter()
            .flat_map(|o| &o.roi_decisions)
            .filter(|d| d.decision == Decision::Upgrade)
            .count();
        info!(
            run = %run_id.short(),
            spent = snapshot.spent,
            remaining = snapshot.remaining,
            upgrades,
            halted = halt.is_some(),
            "dynamic run finished"
        );
        self.emit(RunEvent::RunComplete { run_id });

        Ok(RunResult {
            run_id,
            mode: RunMode::Dynamic,
            task: graph.task().to_string(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
            deliverable,
            ledger: snapshot,
            halt,
            downgrades: None,
            surplus: None,
        })
    }
}
