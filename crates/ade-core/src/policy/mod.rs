//! Versioned policies: a condition DSL over service features, evaluated
//! priority-ordered with first-match semantics.
//!
//! [`types`] holds the policy document model and its validation; [`engine`]
//! holds rule evaluation, fact resolution and confidence scoring. Policies
//! are immutable once loaded; invalid policies are rejected at validation and
//! must never be used for a live decision.

pub mod engine;
pub mod types;

pub use engine::{Engine, EvaluationResult, RuleEvaluation};
pub use types::{
    ActionType, CompareOp, Condition, Policy, PolicyError, PolicyType, Rule, RuleAction, Scalar,
};
