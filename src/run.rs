//! Run result model shared by both executors.
//!
//! A [`RunResult`] is the only artifact a run produces: one
//! [`SubtaskOutcome`] per subtask in execution order, the assembled
//! deliverable, and the final ledger state.

use crate::budget::{LedgerSnapshot, SurplusAudit};
use crate::core::subtask::SubtaskId;
use crate::core::tier::Tier;
use crate::orchestration::allocator::DowngradeRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which executor produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Static,
    Dynamic,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Static => write!(f, "static"),
            RunMode::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// Why a subtask was not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum SkipReason {
    /// The allocation plan dropped it.
    Allocator,
    /// A dependency failed or was itself skipped for that reason.
    DependencyFailed { dependency: SubtaskId },
    /// The run halted before it started.
    RunHalted,
    /// Not even the cheapest tier was affordable.
    BudgetExhausted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Allocator => write!(f, "skipped by allocator"),
            SkipReason::DependencyFailed { dependency } => {
                write!(f, "dependency {} failed", dependency)
            }
            SkipReason::RunHalted => write!(f, "run halted"),
            SkipReason::BudgetExhausted => write!(f, "budget exhausted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum OutcomeStatus {
    Completed,
    Skipped { reason: SkipReason },
    Failed { error: String },
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Completed => write!(f, "completed"),
            OutcomeStatus::Skipped { reason } => write!(f, "skipped: {}", reason),
            OutcomeStatus::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}

/// One dispatch of one subtask at one tier (dynamic path).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub tier: Tier,
    pub output: String,
    /// `None` when the scorer failed.
    pub quality: Option<f64>,
    /// Scorer rationale, or the scorer's error.
    pub rationale: String,
    pub cost: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Upgrade,
    Accept,
}

/// What stopped an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeBlocker {
    /// Expected lift per dollar below the threshold.
    Roi,
    /// Next tier's estimate exceeds what is available.
    Budget,
}

/// Logged every time the dynamic executor weighs an escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiDecision {
    pub subtask: SubtaskId,
    pub current_tier: Tier,
    pub current_quality: f64,
    pub proposed_tier: Tier,
    pub upgrade_cost: f64,
    pub expected_lift: f64,
    pub roi: f64,
    pub decision: Decision,
    pub blocker: Option<UpgradeBlocker>,
    pub reason: String,
}

/// Final state of one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskOutcome {
    pub id: SubtaskId,
    pub description: String,
    pub status: OutcomeStatus,
    /// Tier of the chosen output, or the planned tier if it never ran.
    pub tier: Option<Tier>,
    /// Effective token cap, surplus boost included.
    pub tokens_budgeted: u32,
    pub surplus_boost: u32,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
    pub surplus_credited: u64,
    pub output: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<Attempt>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roi_decisions: Vec<RoiDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_attempt: Option<usize>,
}

impl SubtaskOutcome {
    fn empty(id: SubtaskId, description: &str, status: OutcomeStatus, tier: Option<Tier>) -> Self {
        Self {
            id,
            description: description.to_string(),
            status,
            tier,
            tokens_budgeted: 0,
            surplus_boost: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost: 0.0,
            surplus_credited: 0,
            output: String::new(),
            attempts: Vec::new(),
            roi_decisions: Vec::new(),
            chosen_attempt: None,
        }
    }

    pub fn skipped(id: SubtaskId, description: &str, reason: SkipReason, tier: Option<Tier>) -> Self {
        Self::empty(id, description, OutcomeStatus::Skipped { reason }, tier)
    }

    pub fn failed(id: SubtaskId, description: &str, error: String, tier: Tier) -> Self {
        Self::empty(id, description, OutcomeStatus::Failed { error }, Some(tier))
    }

    pub fn completed(id: SubtaskId, description: &str, tier: Tier, output: String) -> Self {
        let mut outcome = Self::empty(id, description, OutcomeStatus::Completed, Some(tier));
        outcome.output = output;
        outcome
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Completed)
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.status, OutcomeStatus::Skipped { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failed { .. })
    }

    pub fn skip_reason(&self) -> Option<&SkipReason> {
        match &self.status {
            OutcomeStatus::Skipped { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HaltRecord {
    /// A debit was refused; the subtask's cost could not be paid.
    Debit {
        subtask: SubtaskId,
        requested: f64,
        remaining: f64,
    },
    /// The run's cancellation token fired.
    Cancelled,
}

impl std::fmt::Display for HaltRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltRecord::Debit {
                subtask,
                requested,
                remaining,
            } => write!(
                f,
                "subtask {} cost ${:.6} with only ${:.6} remaining",
                subtask, requested, remaining
            ),
            HaltRecord::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Progress events emitted by the executors while a run is in flight.
///
/// These let a caller follow a run without waiting for the final result.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// A dispatch is about to be issued.
    SubtaskStarted {
        subtask: SubtaskId,
        tier: Tier,
        max_tokens: u32,
    },
    SubtaskCompleted {
        subtask: SubtaskId,
        tier: Tier,
        cost: f64,
    },
    SubtaskFailed {
        subtask: SubtaskId,
        error: String,
    },
    SubtaskSkipped {
        subtask: SubtaskId,
        reason: SkipReason,
    },
    /// The dynamic executor moved a subtask one rung up.
    Upgraded {
        subtask: SubtaskId,
        from: Tier,
        to: Tier,
    },
    Halted(HaltRecord),
    RunComplete {
        run_id: RunId,
    },
}

impl RunEvent {
    /// Event announcing an outcome's final status.
    pub fn for_outcome(outcome: &SubtaskOutcome) -> Self {
        match &outcome.status {
            OutcomeStatus::Completed => RunEvent::SubtaskCompleted {
                subtask: outcome.id,
                tier: outcome.tier.unwrap_or(Tier::Fast),
                cost: outcome.cost,
            },
            OutcomeStatus::Skipped { reason } => RunEvent::SubtaskSkipped {
                subtask: outcome.id,
                reason: reason.clone(),
            },
            OutcomeStatus::Failed { error } => RunEvent::SubtaskFailed {
                subtask: outcome.id,
                error: error.clone(),
            },
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub mode: RunMode,
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Execution order.
    pub outcomes: Vec<SubtaskOutcome>,
    pub deliverable: String,
    pub ledger: LedgerSnapshot,
    pub halt: Option<HaltRecord>,
    /// Static runs only.
    pub downgrades: Option<DowngradeRecord>,
    /// Static runs only.
    pub surplus: Option<SurplusAudit>,
}

impl RunResult {
    pub fn outcome(&self, id: SubtaskId) -> Option<&SubtaskOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    pub fn completed(&self) -> impl Iterator<Item = &SubtaskOutcome> {
        self.outcomes.iter().filter(|o| o.is_completed())
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    /// Sum of per-subtask costs.
    pub fn subtask_cost(&self) -> f64 {
        self.outcomes.iter().map(|o| o.cost).sum()
    }

    pub fn upgrades(&self) -> usize {
        self.outcomes
            .iter()
            .flat_map(|o| &o.roi_decisions)
            .filter(|d| d.decision == Decision::Upgrade)
            .count()
    }
}
