//! Cost report derived from a finished run.

use crate::core::graph::TaskGraph;
use crate::core::subtask::Complexity;
use crate::core::tier::Tier;
use crate::run::{RunId, RunMode, RunResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub mode: RunMode,
    pub budget: f64,
    pub spent: f64,
    pub remaining: f64,
    pub utilization_pct: f64,
    /// Subtasks that ran, by the tier of their chosen output.
    pub tier_counts: BTreeMap<Tier, usize>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Subtasks whose planned tier differs from their default.
    pub downgraded: usize,
    pub upgrades: usize,
    pub tokens_budgeted: u64,
    pub tokens_consumed: u64,
    pub tokens_surplus: u64,
    pub token_efficiency_pct: f64,
    pub subtasks: usize,
    pub max_depth: usize,
    pub parallelizable: usize,
    pub complexity: BTreeMap<Complexity, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt: Option<String>,
    pub elapsed_ms: i64,
}

impl RunSummary {
    pub fn from_run(result: &RunResult, graph: &TaskGraph) -> Self {
        let mut tier_counts: BTreeMap<Tier, usize> = Tier::LADDER.iter().map(|&t| (t, 0)).collect();
        for outcome in result.outcomes.iter().filter(|o| !o.is_skipped()) {
            if let Some(tier) = outcome.tier {
                *tier_counts.entry(tier).or_default() += 1;
            }
        }

        let tokens_budgeted: u64 = result
            .outcomes
            .iter()
            .map(|o| u64::from(o.tokens_budgeted))
            .sum();
        let tokens_consumed: u64 = result.outcomes.iter().map(|o| o.completion_tokens).sum();
        let tokens_surplus: u64 = result.outcomes.iter().map(|o| o.surplus_credited).sum();
        let token_efficiency_pct = if tokens_budgeted > 0 {
            tokens_consumed as f64 / tokens_budgeted as f64 * 100.0
        } else {
            0.0
        };

        let stats = graph.stats();
        Self {
            run_id: result.run_id,
            mode: result.mode,
            budget: result.ledger.budget,
            spent: result.ledger.spent,
            remaining: result.ledger.remaining,
            utilization_pct: result.ledger.utilization_pct,
            tier_counts,
            completed: result.outcomes.iter().filter(|o| o.is_completed()).count(),
            failed: result.outcomes.iter().filter(|o| o.is_failed()).count(),
            skipped: result.outcomes.iter().filter(|o| o.is_skipped()).count(),
            downgraded: result
                .downgrades
                .as_ref()
                .map(|record| record.net_changes().len())
                .unwrap_or(0),
            upgrades: result.upgrades(),
            tokens_budgeted,
            tokens_consumed,
            tokens_surplus,
            token_efficiency_pct,
            subtasks: stats.subtasks,
            max_depth: stats.max_depth,
            parallelizable: stats.parallelizable,
            complexity: stats.complexity,
            halt: result.halt.as_ref().map(|h| h.to_string()),
            elapsed_ms: (result.finished_at - result.started_at).num_milliseconds(),
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run {} ({})", self.run_id.short(), self.mode)?;
        writeln!(f, "  Budget:      ${:.4}", self.budget)?;
        writeln!(f, "  Spent:       ${:.6}", self.spent)?;
        writeln!(f, "  Remaining:   ${:.6}", self.remaining)?;
        writeln!(f, "  Utilization: {:.1}%", self.utilization_pct)?;
        for (tier, count) in self.tier_counts.iter().filter(|(_, &c)| c > 0) {
            writeln!(f, "  {:<8} {} subtask(s)", tier.as_str(), count)?;
        }
        writeln!(
            f,
            "  Completed: {}  Failed: {}  Skipped: {}  Downgraded: {}  Upgrades: {}",
            self.completed, self.failed, self.skipped, self.downgraded, self.upgrades
        )?;
        writeln!(
            f,
            "  Tokens budgeted {}, consumed {}, surplus {} ({:.1}% efficiency)",
            self.tokens_budgeted, self.tokens_consumed, self.tokens_surplus, self.token_efficiency_pct
        )?;
        write!(
            f,
            "  Graph: {} subtasks, max depth {}, {} parallelizable",
            self.subtasks, self.max_depth, self.parallelizable
        )?;
        if let Some(halt) = &self.halt {
            write!(f, "\n  Halted: {}", halt)?;
        }
        Ok(())
    }
}
