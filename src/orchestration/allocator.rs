//! Static tier allocation under a dollar budget.
//!
//! Every subtask starts on the tier its complexity maps to. If the
//! worst-case plan does not fit, a four-pass cascade degrades it, one
//! subtask at a time and least critical first, re-checking the fit before
//! every step:
//!
//! 1. Deep → Verify.
//! 2. Subtasks that started on Deep and are still above Fast → Fast.
//! 3. Skip Verify subtasks.
//! 4. Scale every remaining token cap by one factor, down to a floor.
//!
//! If even the floor plan does not fit, the floor plan is returned flagged
//! infeasible instead of failing.

use crate::core::graph::TaskGraph;
use crate::core::subtask::SubtaskId;
use crate::core::tier::{PricingTable, Tier};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const SCALE_ITERATIONS: usize = 64;

/// Allocator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Prompt size assumed when estimating a subtask's worst-case cost.
    pub estimated_prompt_tokens: u32,
    /// Lowest token cap pass 4 may scale down to.
    pub token_floor: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            estimated_prompt_tokens: 512,
            token_floor: 128,
        }
    }
}

/// What the plan says to do with one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Assignment {
    Run {
        tier: Tier,
        max_tokens: u32,
        estimated_cost: f64,
    },
    Skipped,
}

/// Plan line for one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub subtask: SubtaskId,
    pub default_tier: Tier,
    pub assignment: Assignment,
}

impl PlanEntry {
    pub fn tier(&self) -> Option<Tier> {
        match self.assignment {
            Assignment::Run { tier, .. } => Some(tier),
            Assignment::Skipped => None,
        }
    }

    /// Budgeted token cap; zero when skipped.
    pub fn max_tokens(&self) -> u32 {
        match self.assignment {
            Assignment::Run { max_tokens, .. } => max_tokens,
            Assignment::Skipped => 0,
        }
    }

    pub fn estimated_cost(&self) -> f64 {
        match self.assignment {
            Assignment::Run { estimated_cost, .. } => estimated_cost,
            Assignment::Skipped => 0.0,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self.assignment, Assignment::Skipped)
    }
}

/// Tier and token cap for every subtask of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Sorted by subtask id.
    entries: Vec<PlanEntry>,
    total_estimated_cost: f64,
    infeasible: bool,
}

impl Allocation {
    pub(crate) fn from_entries(mut entries: Vec<PlanEntry>, infeasible: bool) -> Self {
        entries.sort_by_key(|e| e.subtask);
        let total_estimated_cost = entries.iter().map(PlanEntry::estimated_cost).sum();
        Self {
            entries,
            total_estimated_cost,
            infeasible,
        }
    }

    pub fn get(&self, id: SubtaskId) -> Option<&PlanEntry> {
        self.entries
            .binary_search_by_key(&id, |e| e.subtask)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn entries(&self) -> &[PlanEntry] {
        &self.entries
    }

    pub fn total_estimated_cost(&self) -> f64 {
        self.total_estimated_cost
    }

    pub fn total_tokens(&self) -> u64 {
        self.entries.iter().map(|e| u64::from(e.max_tokens())).sum()
    }

    /// True when even the floor plan exceeds the budget.
    pub fn is_infeasible(&self) -> bool {
        self.infeasible
    }

    pub fn skipped(&self) -> Vec<SubtaskId> {
        self.entries
            .iter()
            .filter(|e| e.is_skipped())
            .map(|e| e.subtask)
            .collect()
    }
}

/// A single change made by the cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DowngradeAction {
    Retier { from: Tier, to: Tier },
    Skip { tier: Tier },
    ScaleTokens { tier: Tier, from_tokens: u32, to_tokens: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DowngradeStep {
    /// Cascade pass, 1 through 4.
    pub pass: u8,
    pub subtask: SubtaskId,
    pub action: DowngradeAction,
}

/// Everything the cascade did, in the order it did it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DowngradeRecord {
    pub steps: Vec<DowngradeStep>,
    pub skipped: Vec<SubtaskId>,
    /// Factor applied to every remaining cap in pass 4.
    pub scale: Option<f64>,
    pub original_cost: f64,
    pub final_cost: f64,
    pub infeasible: bool,
}

impl DowngradeRecord {
    /// True when the default plan fit as-is.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Net (default tier, final tier) per subtask whose tier changed.
    ///
    /// A final tier of `None` means the subtask was skipped.
    pub fn net_changes(&self) -> BTreeMap<SubtaskId, (Tier, Option<Tier>)> {
        let mut changes: BTreeMap<SubtaskId, (Tier, Option<Tier>)> = BTreeMap::new();
        for step in &self.steps {
            let (from, to) = match step.action {
                DowngradeAction::Retier { from, to } => (from, Some(to)),
                DowngradeAction::Skip { tier } => (tier, None),
                DowngradeAction::ScaleTokens { .. } => continue,
            };
            changes
                .entry(step.subtask)
                .and_modify(|change| change.1 = to)
                .or_insert((from, to));
        }
        changes
    }
}

/// Allocation plus the record of how it was reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPlan {
    pub allocation: Allocation,
    pub record: DowngradeRecord,
    /// Prices and tier ceilings the plan was costed against.
    pub pricing: PricingTable,
}

/// Assigns tiers and token caps before a static run.
#[derive(Debug, Clone)]
pub struct Allocator {
    pricing: PricingTable,
    config: AllocatorConfig,
}

impl Allocator {
    pub fn new(pricing: PricingTable, config: AllocatorConfig) -> Self {
        Self { pricing, config }
    }

    /// Worst-case cost of running `tier` with a cap of `tokens`.
    fn worst_case(&self, tier: Tier, tokens: u32) -> f64 {
        self.pricing.output_cost(tier, tokens)
            + self
                .pricing
                .get(tier)
                .input_cost(u64::from(self.config.estimated_prompt_tokens))
    }

    fn run(&self, tier: Tier, max_tokens: u32) -> Assignment {
        Assignment::Run {
            tier,
            max_tokens,
            estimated_cost: self.worst_case(tier, max_tokens),
        }
    }

    /// Plan a static run of `graph` against `budget` dollars.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBudget`] for a negative or non-finite budget.
    /// An unaffordable budget is not an error; see [`Allocation::is_infeasible`].
    pub fn allocate(&self, graph: &TaskGraph, budget: f64) -> Result<AllocationPlan> {
        if !budget.is_finite() || budget < 0.0 {
            return Err(Error::InvalidBudget(budget));
        }

        let mut entries: BTreeMap<SubtaskId, PlanEntry> = graph
            .subtasks()
            .map(|s| {
                let tier = s.default_tier();
                let entry = PlanEntry {
                    subtask: s.id,
                    default_tier: tier,
                    assignment: self.run(tier, self.pricing.max_tokens(tier)),
                };
                (s.id, entry)
            })
            .collect();

        let original_cost = total(&entries);
        let mut record = DowngradeRecord {
            original_cost,
            ..DowngradeRecord::default()
        };

        if original_cost <= budget {
            info!(
                subtasks = entries.len(),
                cost = original_cost,
                budget,
                "default plan fits"
            );
            record.final_cost = original_cost;
            return Ok(AllocationPlan {
                allocation: Allocation::from_entries(entries.into_values().collect(), false),
                record,
                pricing: self.pricing.clone(),
            });
        }

        info!(cost = original_cost, budget, "default plan over budget, downgrading");
        let order = graph.criticality_order();

        // Pass 1
        self.retier_pass(&mut entries, &order, budget, 1, &mut record, |e| {
            (e.tier() == Some(Tier::Deep)).then_some(Tier::Verify)
        });

        // Pass 2
        self.retier_pass(&mut entries, &order, budget, 2, &mut record, |e| {
            let above_fast = e.tier().is_some_and(|t| t > Tier::Fast);
            (e.default_tier == Tier::Deep && above_fast).then_some(Tier::Fast)
        });

        // Pass 3
        for id in &order {
            if total(&entries) <= budget {
                break;
            }
            let Some(entry) = entries.get_mut(id) else {
                continue;
            };
            if entry.tier() == Some(Tier::Verify) {
                entry.assignment = Assignment::Skipped;
                record.skipped.push(*id);
                record.steps.push(DowngradeStep {
                    pass: 3,
                    subtask: *id,
                    action: DowngradeAction::Skip { tier: Tier::Verify },
                });
                debug!(subtask = %id, "pass 3: skipped");
            }
        }

        // Pass 4
        if total(&entries) > budget {
            self.scale_pass(&mut entries, budget, &mut record);
        }

        record.final_cost = total(&entries);
        info!(
            steps = record.steps.len(),
            skipped = record.skipped.len(),
            cost = record.final_cost,
            budget,
            infeasible = record.infeasible,
            "allocation complete"
        );

        let infeasible = record.infeasible;
        Ok(AllocationPlan {
            allocation: Allocation::from_entries(entries.into_values().collect(), infeasible),
            record,
            pricing: self.pricing.clone(),
        })
    }

    fn retier_pass(
        &self,
        entries: &mut BTreeMap<SubtaskId, PlanEntry>,
        order: &[SubtaskId],
        budget: f64,
        pass: u8,
        record: &mut DowngradeRecord,
        target: impl Fn(&PlanEntry) -> Option<Tier>,
    ) {
        for id in order {
            if total(entries) <= budget {
                return;
            }
            let Some(entry) = entries.get_mut(id) else {
                continue;
            };
            let (Some(from), Some(to)) = (entry.tier(), target(&*entry)) else {
                continue;
            };
            entry.assignment = self.run(to, self.pricing.max_tokens(to));
            record.steps.push(DowngradeStep {
                pass,
                subtask: *id,
                action: DowngradeAction::Retier { from, to },
            });
            debug!(subtask = %id, %from, %to, pass, "retiered");
        }
    }

    /// Cap for a tier at scale factor `s`, clamped to `[floor, tier max]`.
    fn scaled_cap(&self, tier: Tier, s: f64) -> u32 {
        let tier_max = self.pricing.max_tokens(tier);
        let scaled = (f64::from(tier_max) * s).floor() as u32;
        scaled.max(self.config.token_floor).min(tier_max)
    }

    fn scaled_cost(&self, active: &[(SubtaskId, Tier, u32)], s: f64) -> f64 {
        active
            .iter()
            .map(|&(_, tier, _)| self.worst_case(tier, self.scaled_cap(tier, s)))
            .sum()
    }

    fn scale_pass(
        &self,
        entries: &mut BTreeMap<SubtaskId, PlanEntry>,
        budget: f64,
        record: &mut DowngradeRecord,
    ) {
        let active: Vec<(SubtaskId, Tier, u32)> = entries
            .values()
            .filter_map(|e| e.tier().map(|t| (e.subtask, t, e.max_tokens())))
            .collect();

        let scale = if self.scaled_cost(&active, 0.0) > budget {
            warn!(
                budget,
                floor = self.config.token_floor,
                "floor plan exceeds budget, plan is infeasible"
            );
            record.infeasible = true;
            0.0
        } else {
            // Cost is monotone in s: find the largest s that still fits.
            let (mut lo, mut hi) = (0.0_f64, 1.0_f64);
            for _ in 0..SCALE_ITERATIONS {
                let mid = (lo + hi) / 2.0;
                if self.scaled_cost(&active, mid) <= budget {
                    lo = mid;
                } else {
                    hi = mid;
                }
            }
            lo
        };
        record.scale = Some(scale);

        for (id, tier, from_tokens) in active {
            let to_tokens = self.scaled_cap(tier, scale);
            if let Some(entry) = entries.get_mut(&id) {
                entry.assignment = self.run(tier, to_tokens);
            }
            if to_tokens != from_tokens {
                record.steps.push(DowngradeStep {
                    pass: 4,
                    subtask: id,
                    action: DowngradeAction::ScaleTokens {
                        tier,
                        from_tokens,
                        to_tokens,
                    },
                });
            }
        }
        info!(scale, "pass 4: token caps scaled");
    }
}

fn total(entries: &BTreeMap<SubtaskId, PlanEntry>) -> f64 {
    entries.values().map(PlanEntry::estimated_cost).sum()
}
