//! Deterministic stand-ins for the provider and the judge.
//!
//! Used by the `simulate` command and the integration tests to drive both
//! executors end to end without network access.

use crate::core::tier::{estimate_prompt_tokens, Tier};
use crate::error::{AgentError, EvaluatorError};
use crate::orchestration::dispatch::{Dispatch, QualityScorer, QualityVerdict, TierDispatcher, TierDispatchers};
use async_trait::async_trait;
use std::sync::Arc;

const SUBTASK_PREFIX: &str = "YOUR SUBTASK: ";

/// Answers every prompt with a tagged echo and a fixed share of its token cap.
#[derive(Debug, Clone)]
pub struct SimulatedDispatcher {
    tier: Tier,
    fill_ratio: f64,
}

impl SimulatedDispatcher {
    /// `fill_ratio` is clamped to `[0, 1]`.
    pub fn new(tier: Tier, fill_ratio: f64) -> Self {
        let fill_ratio = if fill_ratio.is_nan() {
            0.0
        } else {
            fill_ratio.clamp(0.0, 1.0)
        };
        Self { tier, fill_ratio }
    }

    /// One simulated dispatcher per tier, all with the same fill ratio.
    pub fn ladder(fill_ratio: f64) -> TierDispatchers {
        TierDispatchers::new(
            Arc::new(Self::new(Tier::Fast, fill_ratio)),
            Arc::new(Self::new(Tier::Verify, fill_ratio)),
            Arc::new(Self::new(Tier::Deep, fill_ratio)),
        )
    }
}

#[async_trait]
impl TierDispatcher for SimulatedDispatcher {
    async fn dispatch(&self, prompt: &str, max_tokens: u32) -> Result<Dispatch, AgentError> {
        let subtask = prompt
            .lines()
            .find_map(|line| line.strip_prefix(SUBTASK_PREFIX))
            .unwrap_or("subtask");
        let completion = (f64::from(max_tokens) * self.fill_ratio).ceil() as u64;
        let prompt_tokens = estimate_prompt_tokens(prompt);
        Ok(Dispatch::new(
            format!("[{}] {}", self.tier, subtask),
            prompt_tokens,
            completion.min(u64::from(max_tokens)),
        ))
    }
}

/// Scores an output by the `[tier]` tag at its start.
#[derive(Debug, Clone)]
pub struct TierTagScorer {
    pub fast: f64,
    pub verify: f64,
    pub deep: f64,
}

impl Default for TierTagScorer {
    fn default() -> Self {
        Self {
            fast: 5.0,
            verify: 7.0,
            deep: 8.5,
        }
    }
}

#[async_trait]
impl QualityScorer for TierTagScorer {
    async fn quick_score(&self, text: &str, _task_context: &str) -> Result<QualityVerdict, EvaluatorError> {
        let tier = Tier::LADDER
            .into_iter()
            .find(|tier| text.starts_with(&format!("[{}]", tier)))
            .ok_or_else(|| EvaluatorError {
                reason: "output carries no tier tag".to_string(),
            })?;
        let score = match tier {
            Tier::Fast => self.fast,
            Tier::Verify => self.verify,
            Tier::Deep => self.deep,
        };
        Ok(QualityVerdict::new(score, format!("simulated {} output", tier)))
    }
}
