//! Tier ladder and pricing.
//!
//! Tiers are totally ordered by cost and capability: `Fast < Verify < Deep`.
//! Every price and output-token ceiling comes from a [`PricingTable`], which
//! is configuration rather than something the engine computes.

use serde::{Deserialize, Serialize};

/// A cost/capability rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Verify,
    Deep,
}

impl Tier {
    /// The full ladder, cheapest rung first.
    pub const LADDER: [Tier; 3] = [Tier::Fast, Tier::Verify, Tier::Deep];

    /// The cheapest rung.
    pub fn bottom() -> Self {
        Tier::Fast
    }

    /// The next rung up, or `None` at the top.
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Fast => Some(Tier::Verify),
            Tier::Verify => Some(Tier::Deep),
            Tier::Deep => None,
        }
    }

    /// Check if this is the ladder's top rung.
    pub fn is_top(self) -> bool {
        self.next().is_none()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Verify => "verify",
            Tier::Deep => "deep",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Prices and output ceiling for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierPricing {
    /// Dollars per one million prompt tokens.
    pub input_per_million: f64,
    /// Dollars per one million completion tokens.
    pub output_per_million: f64,
    /// Hard ceiling on completion tokens for a single dispatch.
    pub max_output_tokens: u32,
}

impl TierPricing {
    pub fn new(input_per_million: f64, output_per_million: f64, max_output_tokens: u32) -> Self {
        Self {
            input_per_million,
            output_per_million,
            max_output_tokens,
        }
    }

    /// Dollar cost of `tokens` prompt tokens.
    pub fn input_cost(&self, tokens: u64) -> f64 {
        tokens as f64 * self.input_per_million / 1_000_000.0
    }

    /// Dollar cost of `tokens` completion tokens.
    pub fn output_cost(&self, tokens: u64) -> f64 {
        tokens as f64 * self.output_per_million / 1_000_000.0
    }
}

/// Rough prompt size in tokens, four bytes per token rounded up.
pub fn estimate_prompt_tokens(prompt: &str) -> u64 {
    (prompt.len() as u64).div_ceil(4)
}

/// Tier → pricing lookup.
///
/// One field per tier so that adding a rung is a compile error everywhere
/// the table is consulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    pub fast: TierPricing,
    pub verify: TierPricing,
    pub deep: TierPricing,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            fast: TierPricing::new(0.10, 0.40, 2048),
            verify: TierPricing::new(0.15, 0.60, 4096),
            deep: TierPricing::new(1.25, 10.00, 8192),
        }
    }
}

impl PricingTable {
    pub fn get(&self, tier: Tier) -> &TierPricing {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Verify => &self.verify,
            Tier::Deep => &self.deep,
        }
    }

    /// Output-token ceiling for a tier.
    pub fn max_tokens(&self, tier: Tier) -> u32 {
        self.get(tier).max_output_tokens
    }

    /// Worst-case completion cost of a dispatch capped at `tokens`.
    pub fn output_cost(&self, tier: Tier, tokens: u32) -> f64 {
        self.get(tier).output_cost(u64::from(tokens))
    }

    /// Actual cost of a dispatch, prompt and completion both priced.
    pub fn cost(&self, tier: Tier, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let pricing = self.get(tier);
        pricing.input_cost(prompt_tokens) + pricing.output_cost(completion_tokens)
    }

    /// Worst-case cost of running a tier at its full output ceiling.
    pub fn worst_case(&self, tier: Tier) -> f64 {
        self.output_cost(tier, self.max_tokens(tier))
    }

    /// [`worst_case`](Self::worst_case) plus the cost of sending `prompt_tokens`.
    pub fn worst_case_with_prompt(&self, tier: Tier, prompt_tokens: u64) -> f64 {
        self.get(tier).input_cost(prompt_tokens) + self.worst_case(tier)
    }

    /// Reject tables with negative prices or a zero output ceiling.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for tier in Tier::LADDER {
            let p = self.get(tier);
            if !(p.input_per_million >= 0.0 && p.output_per_million >= 0.0) {
                return Err(format!("{} tier has a negative or NaN price", tier));
            }
            if p.max_output_tokens == 0 {
                return Err(format!("{} tier has a zero output-token ceiling", tier));
            }
        }
        Ok(())
    }
}
