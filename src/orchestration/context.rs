//! Prompt and deliverable assembly.

use crate::core::subtask::{Subtask, SubtaskId};
use std::collections::HashMap;

/// Deliverable text when no subtask produced output.
pub const EMPTY_DELIVERABLE: &str =
    "(No output produced; the budget may have been insufficient.)";

const INSTRUCTION: &str = "Produce a thorough, high-quality response for YOUR SUBTASK. \
Use the context above where relevant but DO NOT repeat or restate content from \
prior subtasks; produce only NEW content.";

/// Shrinks a dependency's output before it is placed in a prompt.
pub trait ContextCompressor: Send + Sync {
    fn compress(&self, dependency: SubtaskId, text: &str) -> String;
}

/// Leaves dependency output untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ContextCompressor for Passthrough {
    fn compress(&self, _dependency: SubtaskId, text: &str) -> String {
        text.to_string()
    }
}

/// Builds the prompt sent to a tier for one subtask.
pub struct PromptBuilder<'a> {
    task: &'a str,
    compressor: &'a dyn ContextCompressor,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(task: &'a str, compressor: &'a dyn ContextCompressor) -> Self {
        Self { task, compressor }
    }

    /// Overall task, the subtask itself, then each dependency's output in
    /// declaration order.
    ///
    /// Dependencies with no recorded output (skipped by the allocator) are
    /// left out rather than treated as errors.
    pub fn build(&self, subtask: &Subtask, outputs: &HashMap<SubtaskId, String>) -> String {
        let mut parts = vec![
            format!("OVERALL TASK: {}\n", self.task),
            format!("YOUR SUBTASK: {}\n", subtask.description),
        ];

        if !subtask.dependencies.is_empty() {
            parts.push("CONTEXT FROM PRIOR SUBTASKS:\n".to_string());
            for dep in &subtask.dependencies {
                let Some(text) = outputs.get(dep).filter(|t| !t.is_empty()) else {
                    continue;
                };
                let text = self.compressor.compress(*dep, text);
                parts.push(format!("--- Subtask {} output ---\n{}\n", dep, text));
            }
        }

        parts.push(INSTRUCTION.to_string());
        parts.join("\n")
    }
}

/// Join non-empty outputs with blank lines, falling back to a placeholder.
pub fn assemble_deliverable<'a>(outputs: impl IntoIterator<Item = &'a str>) -> String {
    let parts: Vec<&str> = outputs
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        EMPTY_DELIVERABLE.to_string()
    } else {
        parts.join("\n\n")
    }
}
