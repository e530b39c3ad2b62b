//! Static executor: runs an allocation plan level by level.
//!
//! Subtasks are grouped by graph depth. Within a level, up to
//! `max_concurrent` subtasks form a wave that is dispatched concurrently.
//! Unused token capacity from finished subtasks is credited to a
//! [`SurplusPool`] after each wave settles and boosts the caps of
//! subtasks in later waves.
//!
//! A refused debit halts the run. A failed dispatch only skips the
//! subtasks downstream of it.

use crate::budget::{BudgetLedger, SurplusPool};
use crate::core::graph::TaskGraph;
use crate::core::subtask::{Subtask, SubtaskId};
use crate::core::tier::Tier;
use crate::error::{Error, Result};
use crate::orchestration::allocator::AllocationPlan;
use crate::orchestration::context::{assemble_deliverable, ContextCompressor, Passthrough, PromptBuilder};
use crate::orchestration::dispatch::TierDispatchers;
use crate::run::{HaltRecord, RunEvent, RunId, RunMode, RunResult, SkipReason, SubtaskOutcome};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Static executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Largest wave dispatched at once. 1 runs strictly sequentially.
    pub max_concurrent: usize,
    /// Per-dispatch timeout in seconds.
    pub dispatch_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            dispatch_timeout_secs: 120,
        }
    }
}

impl ExecutorConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

/// A subtask ready for dispatch in the current wave.
struct Job<'g> {
    subtask: &'g Subtask,
    tier: Tier,
    boost: u32,
    cap: u32,
    prompt: String,
}

pub struct StaticExecutor {
    dispatchers: TierDispatchers,
    compressor: Arc<dyn ContextCompressor>,
    config: ExecutorConfig,
    cancel: CancellationToken,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl StaticExecutor {
    pub fn new(dispatchers: TierDispatchers, config: ExecutorConfig) -> Self {
        Self {
            dispatchers,
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

    /// Stop before the next wave once `cancel` fires.
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

    /// Execute `plan` over `graph`, paying for every dispatch from `ledger`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlanMismatch`] if the plan does not cover every
    /// subtask and [`Error::PricingMismatch`] if it was priced with another
    /// table than `ledger`; nothing is spent in either case. Dispatch
    /// failures and refused debits are recorded in the returned [`RunResult`].
    pub async fn execute(
        &self,
        graph: &TaskGraph,
        plan: &AllocationPlan,
        ledger: &BudgetLedger,
    ) -> Result<RunResult> {
        if let Some(missing) = graph
            .subtasks()
            .find(|s| plan.allocation.get(s.id).is_none())
        {
            return Err(Error::PlanMismatch(missing.id));
        }
        if plan.pricing != *ledger.pricing() {
            return Err(Error::PricingMismatch);
        }

        let run_id = RunId::new();
        let started_at = Utc::now();
        info!(
            run = %run_id.short(),
            subtasks = graph.len(),
            budget = ledger.budget(),
            planned = plan.allocation.total_estimated_cost(),
            "static run starting"
        );

        let builder = PromptBuilder::new(graph.task(), self.compressor.as_ref());
        let width = self.config.max_concurrent.max(1);
        let limit = self.config.dispatch_timeout();

        let mut outcomes: Vec<SubtaskOutcome> = Vec::with_capacity(graph.len());
        let mut outputs: HashMap<SubtaskId, String> = HashMap::new();
        // Failed subtasks and everything skipped because of them.
        let mut blocked: HashSet<SubtaskId> = HashSet::new();
        let mut pool = SurplusPool::new();
        let mut halt: Option<HaltRecord> = None;

        'levels: for level in graph.levels() {
            let mut runnable: Vec<(&Subtask, Tier, u32)> = Vec::new();
            for &id in level {
                let (Some(subtask), Some(entry)) = (graph.get(id), plan.allocation.get(id)) else {
                    continue;
                };
                let Some(tier) = entry.tier() else {
                    debug!(subtask = %id, "skipped by allocator");
                    let outcome =
                        SubtaskOutcome::skipped(id, &subtask.description, SkipReason::Allocator, None);
                    self.push(&mut outcomes, outcome);
                    continue;
                };
                if let Some(&dependency) = subtask.dependencies.iter().find(|d| blocked.contains(d)) {
                    info!(subtask = %id, %dependency, "skipping, dependency failed");
                    blocked.insert(id);
                    let reason = SkipReason::DependencyFailed { dependency };
                    let outcome = SubtaskOutcome::skipped(id, &subtask.description, reason, Some(tier));
                    self.push(&mut outcomes, outcome);
                    continue;
                }
                runnable.push((subtask, tier, entry.max_tokens()));
            }

            for wave in runnable.chunks(width) {
                if self.cancel.is_cancelled() {
                    warn!(run = %run_id.short(), "run cancelled");
                    halt = Some(HaltRecord::Cancelled);
                    break 'levels;
                }

                // Boosts come out of the pool before dispatch, so nothing in
                // this wave can see surplus produced by its siblings.
                let jobs: Vec<Job> = wave
                    .iter()
                    .map(|&(subtask, tier, budgeted)| {
                        let headroom = plan.pricing.max_tokens(tier).saturating_sub(budgeted);
                        let boost = pool.draw(headroom);
                        if boost > 0 {
                            info!(subtask = %subtask.id, boost, cap = budgeted + boost, "boosted from surplus");
                        }
                        Job {
                            subtask,
                            tier,
                            boost,
                            cap: budgeted + boost,
                            prompt: builder.build(subtask, &outputs),
                        }
                    })
                    .collect();

                let results = join_all(jobs.iter().map(|job| {
                    info!(subtask = %job.subtask.id, tier = %job.tier, max_tokens = job.cap, "dispatching");
                    self.emit(RunEvent::SubtaskStarted {
                        subtask: job.subtask.id,
                        tier: job.tier,
                        max_tokens: job.cap,
                    });
                    self.dispatchers.dispatch(job.tier, &job.prompt, job.cap, limit)
                }))
                .await;

                let mut credits: Vec<(usize, Tier, u32, u64)> = Vec::new();
                for (job, result) in jobs.iter().zip(results) {
                    let id = job.subtask.id;
                    let description = &job.subtask.description;

                    if halt.is_some() {
                        // Results from the rest of a halted wave are discarded.
                        let outcome =
                            SubtaskOutcome::skipped(id, description, SkipReason::RunHalted, Some(job.tier));
                        self.push(&mut outcomes, outcome);
                        continue;
                    }

                    let dispatch = match result {
                        Ok(dispatch) => dispatch,
                        Err(err) => {
                            warn!(subtask = %id, tier = %job.tier, error = %err, "dispatch failed");
                            blocked.insert(id);
                            let mut outcome =
                                SubtaskOutcome::failed(id, description, err.to_string(), job.tier);
                            outcome.tokens_budgeted = job.cap;
                            outcome.surplus_boost = job.boost;
                            self.push(&mut outcomes, outcome);
                            continue;
                        }
                    };

                    let cost = ledger.cost(job.tier, dispatch.prompt_tokens, dispatch.completion_tokens);
                    if let Err(err) = ledger.debit(cost) {
                        warn!(subtask = %id, error = %err, "debit refused, halting run");
                        halt = Some(HaltRecord::Debit {
                            subtask: id,
                            requested: err.requested,
                            remaining: err.remaining,
                        });
                        let mut outcome =
                            SubtaskOutcome::failed(id, description, err.to_string(), job.tier);
                        outcome.tokens_budgeted = job.cap;
                        outcome.surplus_boost = job.boost;
                        outcome.prompt_tokens = dispatch.prompt_tokens;
                        outcome.completion_tokens = dispatch.completion_tokens;
                        self.push(&mut outcomes, outcome);
                        continue;
                    }

                    info!(
                        subtask = %id,
                        prompt_tokens = dispatch.prompt_tokens,
                        completion_tokens = dispatch.completion_tokens,
                        cost,
                        "subtask completed"
                    );
                    outputs.insert(id, dispatch.output.clone());
                    let mut outcome = SubtaskOutcome::completed(id, description, job.tier, dispatch.output);
                    outcome.tokens_budgeted = job.cap;
                    outcome.surplus_boost = job.boost;
                    outcome.prompt_tokens = dispatch.prompt_tokens;
                    outcome.completion_tokens = dispatch.completion_tokens;
                    outcome.cost = cost;
                    credits.push((outcomes.len(), job.tier, job.cap, dispatch.completion_tokens));
                    self.push(&mut outcomes, outcome);
                }

                for (index, tier, cap, completion_tokens) in credits {
                    let credited = pool.credit_unused(cap, completion_tokens);
                    ledger.credit(ledger.pricing().get(tier).output_cost(credited));
                    outcomes[index].surplus_credited = credited;
                    debug!(subtask = %outcomes[index].id, credited, pool = pool.balance(), "surplus credited");
                }

                if halt.is_some() {
                    break 'levels;
                }
            }
        }

        if let Some(record) = &halt {
            self.emit(RunEvent::Halted(record.clone()));
            let recorded: HashSet<SubtaskId> = outcomes.iter().map(|o| o.id).collect();
            for subtask in graph.subtasks().filter(|s| !recorded.contains(&s.id)) {
                let tier = plan.allocation.get(subtask.id).and_then(|e| e.tier());
                let outcome =
                    SubtaskOutcome::skipped(subtask.id, &subtask.description, SkipReason::RunHalted, tier);
                self.push(&mut outcomes, outcome);
            }
        }

        let deliverable = assemble_deliverable(
            outcomes
                .iter()
                .filter(|o| o.is_completed())
                .map(|o| o.output.as_str()),
        );
        let audit = pool.audit();
        let ledger_snapshot = ledger.snapshot();
        info!(
            run = %run_id.short(),
            spent = ledger_snapshot.spent,
            remaining = ledger_snapshot.remaining,
            surplus_credited = audit.credited,
            surplus_boosted = audit.boosted,
            halted = halt.is_some(),
            "static run finished"
        );
        self.emit(RunEvent::RunComplete { run_id });

        Ok(RunResult {
            run_id,
            mode: RunMode::Static,
            task: graph.task().to_string(),
            started_at,
            finished_at: Utc::now(),
            outcomes,
            deliverable,
            ledger: ledger_snapshot,
            halt,
            downgrades: Some(plan.record.clone()),
            surplus: Some(audit),
        })
    }
}
