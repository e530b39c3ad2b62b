//! Core domain models.
//!
//! This module contains the fundamental data structures shared by the
//! allocator and both executors: subtasks, the validated dependency graph,
//! and the tier ladder with its pricing.

pub mod graph;
pub mod subtask;
pub mod tier;

pub use graph::{GraphStats, RawGraph, TaskGraph};
pub use subtask::{Complexity, Subtask, SubtaskId};
pub use tier::{estimate_prompt_tokens, PricingTable, Tier, TierPricing};
