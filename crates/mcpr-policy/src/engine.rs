//! Rule evaluation.

use globset::Glob;
use mcpr_core::{ClientId, PolicyRuleId, ServerId};
use serde_json::Value;
use tracing::{debug, trace};

use crate::rule::{ConditionOp, PolicyAction, PolicyRule, ResourceType, RuleCondition, RuleScope};

/// The request attributes a rule set is evaluated against.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    /// Calling client.
    pub client_id: ClientId,
    /// Target server.
    pub server_id: ServerId,
    /// Workspace the request resolved to, if any.
    pub workspace_id: Option<String>,
    /// Kind of resource being touched.
    pub resource_type: ResourceType,
    /// Name the glob pattern is matched against (original tool name,
    /// resource URI, or server name).
    pub resource_name: String,
    /// Request metadata available to conditions (tool arguments and the
    /// like).
    pub metadata: Value,
}

/// Outcome of evaluating a rule set against a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// The decided action.
    pub action: PolicyAction,
    /// Rule that decided, absent for the closed-by-default deny.
    pub rule_id: Option<PolicyRuleId>,
    /// Human-readable reason, when one exists.
    pub reason: Option<String>,
}

impl Decision {
    fn default_deny() -> Self {
        Self {
            action: PolicyAction::Deny,
            rule_id: None,
            reason: Some("no matching policy rule".to_string()),
        }
    }

    /// Whether the decision lets the call proceed without approval.
    #[must_use]
    pub fn is_allow(&self) -> bool {
        self.action == PolicyAction::Allow
    }
}

/// Evaluate `rules` against `ctx`.
///
/// 1. Keep enabled rules whose scope and resource type match.
/// 2. Keep rules whose glob pattern matches the resource name.
/// 3. Keep rules whose conditions all hold against the metadata.
/// 4. Sort by (priority desc, `updated_at` desc, id asc) and take the first.
///
/// No surviving rule means deny: the gateway is closed by default.
#[must_use]
pub fn evaluate(rules: &[PolicyRule], ctx: &EvaluationContext) -> Decision {
    let mut candidates: Vec<&PolicyRule> = rules
        .iter()
        .filter(|rule| rule.enabled)
        .filter(|rule| scope_matches(rule, ctx))
        .filter(|rule| rule.resource_type == ctx.resource_type)
        .filter(|rule| pattern_matches(&rule.pattern, &ctx.resource_name))
        .filter(|rule| rule.conditions.iter().all(|c| condition_holds(c, &ctx.metadata)))
        .collect();

    if candidates.is_empty() {
        trace!(resource = %ctx.resource_name, "no candidate rules, default deny");
        return Decision::default_deny();
    }

    candidates.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.id.cmp(&b.id))
    });

    let winner = candidates[0];
    debug!(
        rule = %winner.id,
        action = %winner.action,
        resource = %ctx.resource_name,
        "policy decision"
    );
    Decision {
        action: winner.action,
        rule_id: Some(winner.id.clone()),
        reason: Some(winner.name.clone()),
    }
}

fn scope_matches(rule: &PolicyRule, ctx: &EvaluationContext) -> bool {
    let scope_id = rule.scope_id.as_deref();
    match rule.scope {
        RuleScope::Global => true,
        RuleScope::Workspace => {
            scope_id.is_some() && scope_id == ctx.workspace_id.as_deref()
        }
        RuleScope::Server => scope_id == Some(ctx.server_id.to_string().as_str())
            || scope_id == Some(ctx.server_id.0.to_string().as_str()),
        RuleScope::Client => scope_id == Some(ctx.client_id.as_str()),
    }
}

fn pattern_matches(pattern: &str, name: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(name),
        Err(error) => {
            debug!(pattern, %error, "unparseable rule pattern never matches");
            false
        }
    }
}

/// Evaluate one condition against the metadata object.
///
/// Numeric comparisons coerce: numbers compare as f64, strings parse as
/// f64 first; anything non-coercible makes the comparison false.
fn condition_holds(condition: &RuleCondition, metadata: &Value) -> bool {
    let Some(actual) = metadata.get(&condition.field) else {
        return false;
    };

    match condition.op {
        ConditionOp::Equals => values_equal(actual, &condition.value),
        ConditionOp::Contains => match (actual, &condition.value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            _ => false,
        },
        ConditionOp::Matches => match (actual.as_str(), condition.value.as_str()) {
            (Some(s), Some(pattern)) => regex::Regex::new(pattern)
                .map(|re| re.is_match(s))
                .unwrap_or(false),
            _ => false,
        },
        ConditionOp::GreaterThan => match (as_number(actual), as_number(&condition.value)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        ConditionOp::LessThan => match (as_number(actual), as_number(&condition.value)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // Scalars also compare by string form, so "5" equals 5.
    match (scalar_string(a), scalar_string(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
