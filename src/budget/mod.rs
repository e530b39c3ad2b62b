//! Budget accounting: the dollar ledger and the static path's token surplus pool.

pub mod ledger;
pub mod surplus;

pub use ledger::{BudgetLedger, LedgerSnapshot};
pub use surplus::{SurplusAudit, SurplusPool};
