//! The policy rule model.

use mcpr_core::{PolicyRuleId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// What a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Applies to every request.
    Global,
    /// Applies when the request's workspace matches `scope_id`.
    Workspace,
    /// Applies when the target server matches `scope_id`.
    Server,
    /// Applies when the calling client matches `scope_id`.
    Client,
}

/// The kind of resource a rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// Tool invocations.
    Tool,
    /// Resource reads.
    Resource,
    /// Server-level operations.
    Server,
}

/// What a matching rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Let the call through.
    Allow,
    /// Reject the call.
    Deny,
    /// Defer the call to a human.
    RequireApproval,
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        };
        f.write_str(s)
    }
}

/// Comparison operator of a rule condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    /// Values are equal (string forms compared for scalars).
    Equals,
    /// String contains substring, or array contains the value.
    Contains,
    /// String matches the regex in `value`.
    Matches,
    /// Numeric greater-than.
    GreaterThan,
    /// Numeric less-than.
    LessThan,
}

/// One field/op/value predicate on the request metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCondition {
    /// Metadata key to inspect.
    pub field: String,
    /// Comparison operator.
    pub op: ConditionOp,
    /// Right-hand operand.
    pub value: Value,
}

/// A configurable policy rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Unique id; also the final tie-break key.
    pub id: PolicyRuleId,
    /// Operator-facing name.
    pub name: String,
    /// Where the rule applies.
    pub scope: RuleScope,
    /// Scope qualifier for non-global scopes.
    #[serde(default)]
    pub scope_id: Option<String>,
    /// Resource kind this rule matches.
    pub resource_type: ResourceType,
    /// Glob pattern matched against the resource name.
    pub pattern: String,
    /// Decision when the rule matches.
    pub action: PolicyAction,
    /// Higher priority wins.
    pub priority: i32,
    /// All conditions must hold for the rule to match.
    #[serde(default)]
    pub conditions: Vec<RuleCondition>,
    /// Disabled rules never match.
    pub enabled: bool,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last modification time; the second tie-break key.
    pub updated_at: Timestamp,
}

impl PolicyRule {
    /// Create an enabled global rule.
    #[must_use]
    pub fn global(
        name: impl Into<String>,
        resource_type: ResourceType,
        pattern: impl Into<String>,
        action: PolicyAction,
        priority: i32,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id: PolicyRuleId::new(),
            name: name.into(),
            scope: RuleScope::Global,
            scope_id: None,
            resource_type,
            pattern: pattern.into(),
            action,
            priority,
            conditions: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Narrow the rule to a non-global scope.
    #[must_use]
    pub fn scoped(mut self, scope: RuleScope, scope_id: impl Into<String>) -> Self {
        self.scope = scope;
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Add a condition.
    #[must_use]
    pub fn with_condition(mut self, field: impl Into<String>, op: ConditionOp, value: Value) -> Self {
        self.conditions.push(RuleCondition {
            field: field.into(),
            op,
            value,
        });
        self
    }

    /// Disable the rule.
    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
