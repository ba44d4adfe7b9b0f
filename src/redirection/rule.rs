use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::RedirectionError;
use crate::types::CapabilityName;

/// What a redirected capability is replaced with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedirectionTarget {
    /// Route calls to another capability altogether.
    OtherCapability(CapabilityName),
    /// Keep the capability but select the implementation registered under
    /// this class prefix.
    ClassPrefix(String),
}

impl fmt::Display for RedirectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OtherCapability(name) => write!(f, "capability:{}", name),
            Self::ClassPrefix(prefix) => write!(f, "class:{}", prefix),
        }
    }
}

/// Restricts a rule to some of the calls made to its source capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCondition {
    /// The addressed actor key starts with this prefix.
    KeyPrefix(String),
    /// The caller asked for exactly this class prefix.
    ClassPrefixEquals(String),
}

impl RouteCondition {
    pub fn matches(&self, ctx: &RouteContext) -> bool {
        match self {
            Self::KeyPrefix(prefix) => ctx.key.as_deref().is_some_and(|k| k.starts_with(prefix.as_str())),
            Self::ClassPrefixEquals(prefix) => ctx.class_prefix.as_deref() == Some(prefix.as_str()),
        }
    }

    fn value(&self) -> &str {
        match self {
            Self::KeyPrefix(v) | Self::ClassPrefixEquals(v) => v,
        }
    }
}

/// Call-site information a condition is evaluated against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteContext {
    pub key: Option<String>,
    pub class_prefix: Option<String>,
}

/// Cluster-level override mapping a requested capability to an alternate
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectionRule {
    pub id: Uuid,
    #[serde(default)]
    pub display_name: String,
    pub source: CapabilityName,
    pub target: RedirectionTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<RouteCondition>,
}

impl RedirectionRule {
    pub fn new(source: impl Into<CapabilityName>, target: RedirectionTarget) -> Self {
        let source = source.into();
        Self {
            id: Uuid::new_v4(),
            display_name: format!("{} -> {}", source, target),
            source,
            target,
            condition: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_condition(mut self, condition: RouteCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn validate(&self) -> Result<(), RedirectionError> {
        let invalid = |reason: &str| RedirectionError::Validation {
            rule: self.id,
            reason: reason.to_string(),
        };

        if self.source.as_str().trim().is_empty() {
            return Err(invalid("source capability is empty"));
        }

        match &self.target {
            RedirectionTarget::OtherCapability(name) if name.as_str().trim().is_empty() => {
                return Err(invalid("target capability is empty"));
            }
            RedirectionTarget::OtherCapability(name) if *name == self.source => {
                return Err(invalid("rule redirects a capability to itself"));
            }
            RedirectionTarget::ClassPrefix(prefix) if prefix.trim().is_empty() => {
                return Err(invalid("target class prefix is empty"));
            }
            _ => {}
        }

        if self.condition.as_ref().is_some_and(|c| c.value().is_empty()) {
            return Err(invalid("condition value is empty"));
        }

        Ok(())
    }

    /// Same source, condition and target. Ids and display names are ignored.
    pub fn is_equivalent(&self, other: &RedirectionRule) -> bool {
        self.source == other.source && self.condition == other.condition && self.target == other.target
    }

    /// Two rules conflict when they would both apply to the same calls but
    /// disagree on where to send them.
    pub fn conflicts_with(&self, other: &RedirectionRule) -> bool {
        !self.is_equivalent(other) && self.source == other.source && self.condition == other.condition
    }

    /// Whether this rule applies to a call described by `ctx`.
    pub fn applies_to(&self, ctx: &RouteContext) -> bool {
        self.condition.as_ref().is_none_or(|c| c.matches(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_capability(source: &str, target: &str) -> RedirectionRule {
        RedirectionRule::new(source, RedirectionTarget::OtherCapability(target.into()))
    }

    #[test]
    fn test_validation() {
        assert!(to_capability("billing", "billing-v2").validate().is_ok());
        assert!(to_capability("", "billing-v2").validate().is_err());
        assert!(to_capability("billing", " ").validate().is_err());
        assert!(to_capability("billing", "billing").validate().is_err());

        let empty_prefix = RedirectionRule::new("billing", RedirectionTarget::ClassPrefix(String::new()));
        assert!(empty_prefix.validate().is_err());

        let empty_condition =
            to_capability("billing", "billing-v2").with_condition(RouteCondition::KeyPrefix(String::new()));
        assert!(matches!(
            empty_condition.validate(),
            Err(RedirectionError::Validation { .. })
        ));
    }

    #[test]
    fn test_conflict_predicate() {
        let a = to_capability("billing", "billing-v2");
        let same_target = to_capability("billing", "billing-v2");
        let other_target = to_capability("billing", "billing-v3");
        let other_source = to_capability("shipping", "billing-v3");
        let conditioned = to_capability("billing", "billing-v3")
            .with_condition(RouteCondition::KeyPrefix("eu-".to_string()));

        assert!(a.is_equivalent(&same_target));
        assert!(!a.conflicts_with(&same_target));
        assert!(a.conflicts_with(&other_target));
        assert!(!a.conflicts_with(&other_source));
        assert!(!a.conflicts_with(&conditioned));
    }

    #[test]
    fn test_condition_matching() {
        let ctx = RouteContext {
            key: Some("eu-42".to_string()),
            class_prefix: Some("fast".to_string()),
        };

        assert!(RouteCondition::KeyPrefix("eu-".to_string()).matches(&ctx));
        assert!(!RouteCondition::KeyPrefix("us-".to_string()).matches(&ctx));
        assert!(RouteCondition::ClassPrefixEquals("fast".to_string()).matches(&ctx));
        assert!(!RouteCondition::KeyPrefix("eu-".to_string()).matches(&RouteContext::default()));

        assert!(to_capability("a", "b").applies_to(&RouteContext::default()));
    }

    #[test]
    fn test_serde_shape() {
        let rule = RedirectionRule::new("billing", RedirectionTarget::ClassPrefix("fast".to_string()))
            .with_condition(RouteCondition::ClassPrefixEquals("slow".to_string()));
        let json = serde_json::to_value(&rule).unwrap();

        assert_eq!(json["target"], serde_json::json!({"class_prefix": "fast"}));
        assert_eq!(json["condition"], serde_json::json!({"class_prefix_equals": "slow"}));

        let parsed: RedirectionRule = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, rule);
    }
}
