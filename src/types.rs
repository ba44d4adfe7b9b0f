//! NewType wrappers for strong typing throughout the registry.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing an entity ETag where a registry version is expected).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Opaque version token of a single stored definition.
    ///
    /// Changes if and only if the definition payload changes. Only equality
    /// is meaningful; ETags carry no ordering.
    ETag
);

newtype_string!(
    /// Opaque version token of a whole redirection registry.
    ///
    /// Regenerated on every successful push or pop. Callers keep the last
    /// value they saw and hand it back to poll for changes.
    RegistryVersion
);

impl RegistryVersion {
    /// A fresh, never-seen-before version token.
    pub fn fresh() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

newtype_string!(
    /// Name of a capability that can be redirected (e.g. "billing.invoice").
    CapabilityName
);

newtype_string!(
    /// Cluster-wide name of a singleton service that can receive admin events.
    ServiceName
);

newtype_string!(
    /// Kind of an addressable actor (the interface it is reached through).
    ActorKind
);

/// Identity presented by the caller of an administrative operation.
///
/// Accepted on every mutating call and recorded in logs. Nothing enforces it
/// yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCard {
    pub principal: String,
}

impl IdentityCard {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

impl fmt::Display for IdentityCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_creation() {
        let etag = ETag::new("abc123");
        assert_eq!(etag.as_str(), "abc123");
        assert_eq!(etag.to_string(), "abc123");
    }

    #[test]
    fn test_capability_from_string() {
        let name: CapabilityName = "billing.invoice".into();
        assert_eq!(name.as_str(), "billing.invoice");

        let name: CapabilityName = String::from("billing.refund").into();
        assert_eq!(name.into_inner(), "billing.refund");
    }

    #[test]
    fn test_fresh_versions_differ() {
        let a = RegistryVersion::fresh();
        let b = RegistryVersion::fresh();
        assert_ne!(a, b);
    }

    #[test]
    fn test_version_serde_is_transparent() {
        let version = RegistryVersion::new("v-1");
        let json = serde_json::to_string(&version).unwrap();
        assert_eq!(json, "\"v-1\"");

        let parsed: RegistryVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, version);
    }

    #[test]
    fn test_type_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(CapabilityName::new("a"));
        set.insert(CapabilityName::new("b"));

        assert!(set.contains(&CapabilityName::new("a")));
        assert!(!set.contains(&CapabilityName::new("c")));
    }

    #[test]
    fn test_borrow() {
        use std::borrow::Borrow;
        let name = ServiceName::new("route-cache");
        let s: &str = name.borrow();
        assert_eq!(s, "route-cache");
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(IdentityCard::anonymous().to_string(), "anonymous");
        assert_eq!(IdentityCard::new("ops").principal, "ops");
    }
}
