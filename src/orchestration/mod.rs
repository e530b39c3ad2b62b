//! Orchestration layer: planning a tier per subtask and running the graph.
//!
//! The static path plans up front with the [`Allocator`] and runs the plan
//! with the [`StaticExecutor`]. The dynamic path skips planning and lets the
//! [`DynamicExecutor`] escalate tiers based on scored output.

pub mod allocator;
pub mod context;
pub mod dispatch;
pub mod dynamic;
pub mod executor;

pub use allocator::{
    Allocation, AllocationPlan, Allocator, AllocatorConfig, Assignment, DowngradeAction,
    DowngradeRecord, DowngradeStep, PlanEntry,
};
pub use context::{assemble_deliverable, ContextCompressor, Passthrough, PromptBuilder, EMPTY_DELIVERABLE};
pub use dispatch::{Dispatch, QualityScorer, QualityVerdict, TierDispatcher, TierDispatchers};
pub use dynamic::{evaluate_escalation, DynamicConfig, DynamicExecutor};
pub use executor::{ExecutorConfig, StaticExecutor};
