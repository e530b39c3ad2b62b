//! Integration test suite for tierflow.
//!
//! These tests drive the allocator and both executors end to end through
//! the public API, with scripted or simulated tiers standing in for real
//! providers.
//!
//! # Test Categories
//!
//! - `static_pipeline`: allocate then execute, surplus recycling, halts
//! - `dynamic_pipeline`: ROI escalation, sink reserve, scorer failures
//! - `budget_invariants`: spend and tier properties swept across budgets
//!
//! # CI Compatibility
//!
//! No test makes a network call.

mod fixtures;

mod budget_invariants;
mod dynamic_pipeline;
mod static_pipeline;
