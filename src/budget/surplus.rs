//! Token surplus pool for the static executor.
//!
//! When a subtask finishes under its token cap, the unused tokens are
//! credited here and later subtasks may draw on them to raise their own cap.

use serde::{Deserialize, Serialize};

/// Audit totals for one run's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurplusAudit {
    /// Tokens left in the pool at run end.
    pub balance: u64,
    /// Tokens ever credited.
    pub credited: u64,
    /// Tokens ever handed out as boosts.
    pub boosted: u64,
}

/// Non-negative token counter owned by a single run.
#[derive(Debug, Default)]
pub struct SurplusPool {
    balance: u64,
    credited: u64,
    boosted: u64,
}

impl SurplusPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self) -> u64 {
        self.balance
    }

    /// Credit `max(0, budgeted - actual)` and return the amount credited.
    pub fn credit_unused(&mut self, budgeted: u32, actual: u64) -> u64 {
        let unused = u64::from(budgeted).saturating_sub(actual);
        self.balance += unused;
        self.credited += unused;
        unused
    }

    /// Draw up to `headroom` tokens, limited by the balance.
    ///
    /// Returns the boost actually granted, which may be zero.
    pub fn draw(&mut self, headroom: u32) -> u32 {
        let granted = self.balance.min(u64::from(headroom));
        self.balance -= granted;
        self.boosted += granted;
        // granted <= headroom, which fits in u32
        u32::try_from(granted).unwrap_or(headroom)
    }

    pub fn audit(&self) -> SurplusAudit {
        SurplusAudit {
            balance: self.balance,
            credited: self.credited,
            boosted: self.boosted,
        }
    }
}
