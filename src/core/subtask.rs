//! Subtask data model for the execution graph.
//!
//! Subtasks are the atomic units of work dispatched to a tier. Each one
//! carries a complexity tag that picks its default tier, and the ids of
//! the subtasks whose output it consumes.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::tier::Tier;

/// Identifier for a subtask, unique within a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtaskId(pub u32);

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SubtaskId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// How demanding a subtask is, as judged by the graph source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// All complexities, lowest first.
    pub const ALL: [Complexity; 3] = [Complexity::Low, Complexity::Medium, Complexity::High];

    /// The tier a subtask of this complexity is assigned before any downgrade.
    pub fn default_tier(self) -> Tier {
        match self {
            Complexity::Low => Tier::Fast,
            Complexity::Medium => Tier::Verify,
            Complexity::High => Tier::Deep,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Complexity::Low => write!(f, "low"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::High => write!(f, "high"),
        }
    }
}

/// A single node of an accepted graph.
///
/// Immutable once the graph has been validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique identifier for this subtask.
    pub id: SubtaskId,
    /// What the subtask should produce.
    pub description: String,
    /// Complexity tag used to pick the default tier.
    pub complexity: Complexity,
    /// Subtasks whose output this one consumes, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<SubtaskId>,
}

impl Subtask {
    /// Create a subtask with no dependencies.
    pub fn new(id: u32, description: &str, complexity: Complexity) -> Self {
        Self {
            id: SubtaskId(id),
            description: description.to_string(),
            complexity,
            dependencies: Vec::new(),
        }
    }

    /// Add dependencies, keeping first-occurrence order and dropping repeats.
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = u32>) -> Self {
        self.dependencies.extend(deps.into_iter().map(SubtaskId));
        self.dedup_dependencies();
        self
    }

    /// Drop repeated dependencies, keeping first-occurrence order.
    pub(crate) fn dedup_dependencies(&mut self) {
        let mut seen = HashSet::with_capacity(self.dependencies.len());
        self.dependencies.retain(|dep| seen.insert(*dep));
    }

    /// The tier this subtask is assigned before any budget pressure.
    pub fn default_tier(&self) -> Tier {
        self.complexity.default_tier()
    }

    /// Check if the subtask has no dependencies.
    pub fn is_root(&self) -> bool {
        self.dependencies.is_empty()
    }
}
