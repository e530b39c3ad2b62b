use thiserror::Error;

use crate::core::subtask::SubtaskId;

/// Structural problems with an incoming subtask graph.
///
/// These are raised by validation, before any money is spent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Graph has no subtasks")]
    Empty,

    #[error("Duplicate subtask id: {0}")]
    DuplicateId(SubtaskId),

    #[error("Subtask {subtask} depends on unknown subtask {dependency}")]
    DanglingReference {
        subtask: SubtaskId,
        dependency: SubtaskId,
    },

    #[error("Subtask {0} depends on itself")]
    SelfLoop(SubtaskId),

    #[error("Dependency cycle detected: {}", format_path(.path))]
    Cycle { path: Vec<SubtaskId> },

    #[error("Graph needs exactly one sink reachable from every subtask, found sinks: {}", format_path(.sinks))]
    MissingSink { sinks: Vec<SubtaskId> },
}

/// A debit that would take the ledger past its ceiling.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Debit of ${requested:.6} exceeds remaining ${remaining:.6}")]
pub struct DebitError {
    pub requested: f64,
    pub remaining: f64,
}

/// Failure of a single tier dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Provider error: {reason}")]
    Provider { reason: String },

    #[error("Dispatch timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Failure of the quality scoring capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Evaluator error: {reason}")]
pub struct EvaluatorError {
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Debit(#[from] DebitError),

    #[error("Invalid budget: {0}")]
    InvalidBudget(f64),

    #[error("Allocation has no entry for subtask {0}")]
    PlanMismatch(SubtaskId),

    #[error("Allocation was priced with a different table than the ledger")]
    PricingMismatch,

    #[error("Config error: {0}")]
    Config(String),

    #[error("No home directory")]
    NoHomeDir,
}

pub type Result<T> = std::result::Result<T, Error>;

fn format_path(ids: &[SubtaskId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
