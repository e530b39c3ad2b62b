//! Budget-constrained execution of tiered subtask graphs.
//!
//! A task arrives already decomposed into a DAG of subtasks. Each subtask
//! runs on one rung of a cost/capability ladder ([`Tier`]) and every
//! dispatch is paid for out of a hard dollar budget ([`BudgetLedger`]).
//!
//! Two execution paths share the same graph, ledger and [`RunResult`]:
//!
//! - static: [`Allocator`] plans a tier per subtask and degrades the plan
//!   until it fits, then [`StaticExecutor`] runs it and recycles unused
//!   tokens through a surplus pool;
//! - dynamic: [`DynamicExecutor`] starts every subtask on the cheapest tier
//!   and escalates when the output scores poorly and the upgrade pays off.

pub mod budget;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod orchestration;
pub mod run;
pub mod simulate;
pub mod summary;

pub use budget::{BudgetLedger, LedgerSnapshot, SurplusPool};
pub use config::Config;
pub use crate::core::{Complexity, PricingTable, RawGraph, Subtask, SubtaskId, TaskGraph, Tier};
pub use error::{Error, Result};
pub use orchestration::{Allocator, DynamicExecutor, StaticExecutor};
pub use run::{RunResult, SubtaskOutcome};
pub use summary::RunSummary;
