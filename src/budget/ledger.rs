//! Dollar ledger shared by the allocator and both executors.
//!
//! The ledger is the single source of truth for "can we afford this". Every
//! debit is one check-and-subtract under a mutex, so concurrent dispatches
//! cannot jointly push spend past the ceiling.

use crate::core::tier::{PricingTable, Tier};
use crate::error::{DebitError, Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Point-in-time view of a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub budget: f64,
    pub spent: f64,
    pub remaining: f64,
    /// Spent as a percentage of budget.
    pub utilization_pct: f64,
    /// Dollar value of unused token capacity handed to the surplus pool.
    pub surplus_credited: f64,
}

#[derive(Debug)]
struct LedgerState {
    spent: f64,
    surplus_credited: f64,
}

/// Tracks spend against a fixed dollar budget.
#[derive(Debug)]
pub struct BudgetLedger {
    budget: f64,
    pricing: PricingTable,
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    /// Open a ledger with nothing spent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBudget`] for a negative or non-finite budget.
    pub fn new(budget: f64, pricing: PricingTable) -> Result<Self> {
        Self::with_spent(budget, pricing, 0.0)
    }

    /// Open a ledger with money already spent, e.g. on decomposing the task.
    pub fn with_spent(budget: f64, pricing: PricingTable, spent: f64) -> Result<Self> {
        if !budget.is_finite() || budget < 0.0 {
            return Err(Error::InvalidBudget(budget));
        }
        if !spent.is_finite() || spent < 0.0 {
            return Err(Error::InvalidBudget(spent));
        }
        if spent > budget {
            warn!(budget, spent, "pre-spend already exceeds budget");
        }
        Ok(Self {
            budget,
            pricing,
            state: Mutex::new(LedgerState {
                spent,
                surplus_credited: 0.0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn spent(&self) -> f64 {
        self.lock().spent
    }

    /// Dollars left, never negative.
    pub fn remaining(&self) -> f64 {
        (self.budget - self.lock().spent).max(0.0)
    }

    /// Dollars left below a spend ceiling lower than the budget.
    pub fn available_within(&self, ceiling: f64) -> f64 {
        (ceiling.min(self.budget) - self.lock().spent).max(0.0)
    }

    /// Worst-case completion cost of a dispatch capped at `tokens`.
    pub fn estimate_cost(&self, tier: Tier, tokens: u32) -> f64 {
        self.pricing.output_cost(tier, tokens)
    }

    /// Actual cost of a finished dispatch.
    pub fn cost(&self, tier: Tier, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        self.pricing.cost(tier, prompt_tokens, completion_tokens)
    }

    /// Spend `amount`, failing closed if it would exceed the budget.
    pub fn debit(&self, amount: f64) -> std::result::Result<(), DebitError> {
        self.debit_within(amount, self.budget)
    }

    /// Spend `amount`, failing closed if total spend would pass `ceiling`.
    ///
    /// The effective ceiling is never above the budget itself.
    pub fn debit_within(&self, amount: f64, ceiling: f64) -> std::result::Result<(), DebitError> {
        let limit = ceiling.min(self.budget);
        let mut state = self.lock();
        let remaining = (limit - state.spent).max(0.0);
        if !amount.is_finite() || amount < 0.0 || state.spent + amount > limit {
            warn!(requested = amount, remaining, "debit refused");
            return Err(DebitError {
                requested: amount,
                remaining,
            });
        }
        state.spent += amount;
        debug!(amount, spent = state.spent, "debited");
        Ok(())
    }

    /// Record the dollar value of capacity returned to the surplus pool.
    ///
    /// This is bookkeeping only; it never refunds spend. Returns the running
    /// total.
    pub fn credit(&self, amount: f64) -> f64 {
        let mut state = self.lock();
        if amount.is_finite() && amount > 0.0 {
            state.surplus_credited += amount;
        }
        state.surplus_credited
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.lock();
        let utilization_pct = if self.budget > 0.0 {
            state.spent / self.budget * 100.0
        } else {
            0.0
        };
        LedgerSnapshot {
            budget: self.budget,
            spent: state.spent,
            remaining: (self.budget - state.spent).max(0.0),
            utilization_pct,
            surplus_credited: state.surplus_credited,
        }
    }
}
