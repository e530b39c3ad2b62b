//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Canonical subtask graphs
//! - Pricing tables with round worst-case costs
//! - Scripted dispatchers and scorers that record what they were asked

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use tierflow::core::{Complexity, PricingTable, RawGraph, Subtask, TaskGraph, Tier, TierPricing};
use tierflow::error::{AgentError, EvaluatorError};
use tierflow::orchestration::{Dispatch, QualityScorer, QualityVerdict, TierDispatcher, TierDispatchers};
use tierflow::run::RunEvent;

/// Five subtasks over three levels: 1, 2 → 3, 5 → 4 (sink).
pub const SCENARIO_JSON: &str = r#"{
  "task": "Write a market report",
  "subtasks": [
    {"id": 1, "description": "gather", "complexity": "low"},
    {"id": 2, "description": "collect", "complexity": "low"},
    {"id": 3, "description": "analyse", "complexity": "high", "dependencies": [1]},
    {"id": 4, "description": "synthesize", "complexity": "high", "dependencies": [3, 5]},
    {"id": 5, "description": "chart", "complexity": "medium", "dependencies": [2]}
  ]
}"#;

pub fn scenario_graph() -> TaskGraph {
    TaskGraph::from_json(SCENARIO_JSON).expect("scenario graph is valid")
}

/// `1 → 2 → … → n`, all low complexity.
pub fn chain_graph(n: u32) -> TaskGraph {
    let subtasks = (1..=n)
        .map(|id| {
            let subtask = Subtask::new(id, &format!("step{}", id), Complexity::Low);
            if id == 1 {
                subtask
            } else {
                subtask.with_dependencies([id - 1])
            }
        })
        .collect();
    TaskGraph::from_raw(RawGraph::new("chain", subtasks)).expect("chain graph is valid")
}

/// Output-only prices giving worst cases F = 0.004096, V = 0.01024, D = 0.028672.
pub fn round_pricing() -> PricingTable {
    PricingTable {
        fast: TierPricing::new(0.0, 2.0, 2048),
        verify: TierPricing::new(0.0, 2.5, 4096),
        deep: TierPricing::new(0.0, 3.5, 8192),
    }
}

/// Pull the subtask line back out of a prompt.
pub fn subtask_line(prompt: &str) -> String {
    prompt
        .lines()
        .find_map(|line| line.strip_prefix("YOUR SUBTASK: "))
        .unwrap_or_default()
        .to_string()
}

/// A recorded dispatch: tier, subtask description, token cap.
pub type Call = (Tier, String, u32);

/// Tagged echo dispatcher with scripted token use and failures.
pub struct ScriptedDispatcher {
    tier: Tier,
    fill: f64,
    failing: Vec<String>,
    calls: Arc<Mutex<Vec<Call>>>,
}

#[async_trait]
impl TierDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, prompt: &str, max_tokens: u32) -> Result<Dispatch, AgentError> {
        let subtask = subtask_line(prompt);
        self.calls
            .lock()
            .unwrap()
            .push((self.tier, subtask.clone(), max_tokens));
        if self.failing.contains(&subtask) {
            return Err(AgentError::Provider {
                reason: format!("{} refused {}", self.tier, subtask),
            });
        }
        let completion = (f64::from(max_tokens) * self.fill).ceil() as u64;
        Ok(Dispatch::new(format!("[{}] {}", self.tier, subtask), 50, completion))
    }
}

/// One scripted dispatcher per tier sharing a call log.
pub struct ScriptedLadder {
    pub calls: Arc<Mutex<Vec<Call>>>,
    fill: f64,
    failing: HashMap<Tier, Vec<String>>,
}

impl ScriptedLadder {
    pub fn new(fill: f64) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fill,
            failing: HashMap::new(),
        }
    }

    /// Make `tier` fail whenever it is asked for `subtask`.
    pub fn failing(mut self, tier: Tier, subtask: &str) -> Self {
        self.failing.entry(tier).or_default().push(subtask.to_string());
        self
    }

    pub fn dispatchers(&self) -> TierDispatchers {
        let make = |tier: Tier| -> Arc<dyn TierDispatcher> {
            Arc::new(ScriptedDispatcher {
                tier,
                fill: self.fill,
                failing: self.failing.get(&tier).cloned().unwrap_or_default(),
                calls: Arc::clone(&self.calls),
            })
        };
        TierDispatchers::new(make(Tier::Fast), make(Tier::Verify), make(Tier::Deep))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

/// Scores by tier tag, optionally overridden per subtask.
#[derive(Default)]
pub struct ScriptedScorer {
    by_tier: HashMap<Tier, f64>,
    by_output: HashMap<String, f64>,
    fail: bool,
}

impl ScriptedScorer {
    pub fn tiers(fast: f64, verify: f64, deep: f64) -> Self {
        Self {
            by_tier: HashMap::from([(Tier::Fast, fast), (Tier::Verify, verify), (Tier::Deep, deep)]),
            ..Self::default()
        }
    }

    /// Pin the score of one exact output, e.g. `"[fast] gather"`.
    pub fn with_output(mut self, output: &str, score: f64) -> Self {
        self.by_output.insert(output.to_string(), score);
        self
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl QualityScorer for ScriptedScorer {
    async fn quick_score(&self, text: &str, _task_context: &str) -> Result<QualityVerdict, EvaluatorError> {
        if self.fail {
            return Err(EvaluatorError {
                reason: "scorer unavailable".to_string(),
            });
        }
        if let Some(score) = self.by_output.get(text) {
            return Ok(QualityVerdict::new(*score, "pinned"));
        }
        let tier = Tier::LADDER
            .into_iter()
            .find(|tier| text.starts_with(&format!("[{}]", tier)))
            .unwrap_or(Tier::Fast);
        Ok(QualityVerdict::new(
            self.by_tier.get(&tier).copied().unwrap_or(0.0),
            "by tier",
        ))
    }
}

/// Drain every event already sent on `rx`.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
