//! Policy rules and their evaluator.
//!
//! The evaluator is closed by default: with no matching enabled rule the
//! decision is deny. Matching is deterministic regardless of rule insertion
//! order - candidates sort by priority descending, then `updated_at`
//! descending, then id ascending, and the first candidate's action wins.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod engine;
mod rule;

pub use engine::{Decision, EvaluationContext, evaluate};
pub use rule::{
    ConditionOp, PolicyAction, PolicyRule, ResourceType, RuleCondition, RuleScope,
};
