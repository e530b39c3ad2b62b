//! Capabilities the executors call out to.
//!
//! Producing text and judging it are not this crate's job. The executors
//! only see these traits, one [`TierDispatcher`] per rung and a single
//! [`QualityScorer`], so providers can be swapped or simulated freely.

use crate::core::tier::Tier;
use crate::error::{AgentError, EvaluatorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Text and token counts returned by one dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub output: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Dispatch {
    pub fn new(output: impl Into<String>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            output: output.into(),
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// Sends a prompt to one tier's model.
#[async_trait]
pub trait TierDispatcher: Send + Sync {
    /// Generate at most `max_tokens` completion tokens for `prompt`.
    async fn dispatch(&self, prompt: &str, max_tokens: u32) -> Result<Dispatch, AgentError>;
}

/// A 0–10 quality judgement and its rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub score: f64,
    pub rationale: String,
}

impl QualityVerdict {
    /// Build a verdict, clamping the score into `[0, 10]`.
    pub fn new(score: f64, rationale: impl Into<String>) -> Self {
        let score = if score.is_nan() {
            0.0
        } else {
            score.clamp(0.0, 10.0)
        };
        Self {
            score,
            rationale: rationale.into(),
        }
    }
}

/// Cheap quality check used by the dynamic executor to decide on escalation.
#[async_trait]
pub trait QualityScorer: Send + Sync {
    async fn quick_score(
        &self,
        text: &str,
        task_context: &str,
    ) -> Result<QualityVerdict, EvaluatorError>;
}

/// One dispatcher per tier.
#[derive(Clone)]
pub struct TierDispatchers {
    fast: Arc<dyn TierDispatcher>,
    verify: Arc<dyn TierDispatcher>,
    deep: Arc<dyn TierDispatcher>,
}

impl TierDispatchers {
    pub fn new(
        fast: Arc<dyn TierDispatcher>,
        verify: Arc<dyn TierDispatcher>,
        deep: Arc<dyn TierDispatcher>,
    ) -> Self {
        Self { fast, verify, deep }
    }

    /// Route every tier to the same dispatcher.
    pub fn uniform(dispatcher: Arc<dyn TierDispatcher>) -> Self {
        Self {
            fast: Arc::clone(&dispatcher),
            verify: Arc::clone(&dispatcher),
            deep: dispatcher,
        }
    }

    pub fn get(&self, tier: Tier) -> &Arc<dyn TierDispatcher> {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Verify => &self.verify,
            Tier::Deep => &self.deep,
        }
    }

    /// Dispatch at `tier`, turning an elapsed `limit` into [`AgentError::Timeout`].
    pub async fn dispatch(
        &self,
        tier: Tier,
        prompt: &str,
        max_tokens: u32,
        limit: Duration,
    ) -> Result<Dispatch, AgentError> {
        match tokio::time::timeout(limit, self.get(tier).dispatch(prompt, max_tokens)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%tier, ?limit, "dispatch timed out");
                Err(AgentError::Timeout(limit))
            }
        }
    }
}

impl std::fmt::Debug for TierDispatchers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierDispatchers").finish_non_exhaustive()
    }
}
