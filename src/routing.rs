//! Node-local mirror of the cluster redirection table.
//!
//! [`RouteTable`] keeps the last snapshot it pulled from the administration
//! registry and answers "where does a call to this capability go" without
//! leaving the process. It refreshes when told the registry moved on, either
//! by polling or by subscribing to route change events.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::admin::{AdminError, AdministrationHandle};
use crate::cache::ValueCache;
use crate::redirection::{RedirectionRule, RedirectionSnapshot, RedirectionTarget, RouteContext};
use crate::subscription::{AdminEvent, AdminEventReceiver};
use crate::types::{CapabilityName, RegistryVersion};

/// Where a call ends up after redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub capability: CapabilityName,
    pub class_prefix: Option<String>,
    /// The rule that was applied, if any.
    pub rule: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    capability: CapabilityName,
    class_prefix: Option<String>,
}

#[derive(Default)]
struct IndexedRules {
    version: Option<RegistryVersion>,
    /// Conditioned rules first, so the more specific rule wins.
    by_source: HashMap<CapabilityName, Vec<RedirectionRule>>,
}

pub struct RouteTable {
    handle: AdministrationHandle,
    rules: RwLock<IndexedRules>,
    resolved: ValueCache<RouteKey, Route>,
}

impl RouteTable {
    pub fn new(handle: AdministrationHandle) -> Self {
        Self {
            handle,
            rules: RwLock::new(IndexedRules::default()),
            resolved: ValueCache::new(),
        }
    }

    /// Version of the snapshot currently mirrored.
    pub fn version(&self) -> Option<RegistryVersion> {
        self.rules.read().version.clone()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().by_source.values().map(Vec::len).sum()
    }

    /// Pull a new snapshot if the registry moved on. Returns whether the
    /// table changed.
    pub fn refresh(&self, cancel: &CancellationToken) -> Result<bool, AdminError> {
        let current = self.version();
        match self.handle.get_snapshot(current.as_ref(), cancel)? {
            Some(snapshot) => {
                self.apply(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the mirrored rules with `snapshot`.
    pub fn apply(&self, snapshot: RedirectionSnapshot) {
        let mut by_source: HashMap<CapabilityName, Vec<RedirectionRule>> = HashMap::new();
        for rule in snapshot.rules {
            by_source.entry(rule.source.clone()).or_default().push(rule);
        }
        for rules in by_source.values_mut() {
            rules.sort_by_key(|r| r.condition.is_none());
        }

        let mut guard = self.rules.write();
        guard.by_source = by_source;
        info!("Route table now mirrors version {}", snapshot.version);
        guard.version = Some(snapshot.version);
        self.resolved.clear();
    }

    /// Apply the first matching rule for `capability`. Calls no rule
    /// applies to keep their original destination.
    pub fn resolve(&self, capability: &CapabilityName, ctx: &RouteContext) -> Route {
        let key = RouteKey {
            capability: capability.clone(),
            class_prefix: ctx.class_prefix.clone(),
        };
        if let Some(route) = self.resolved.try_get(&key) {
            return route;
        }

        let guard = self.rules.read();
        let candidates = guard.by_source.get(capability).map(Vec::as_slice).unwrap_or_default();

        let route = match candidates.iter().find(|rule| rule.applies_to(ctx)) {
            Some(rule) => {
                debug!("Redirecting {} through rule {}", capability, rule.id);
                match &rule.target {
                    RedirectionTarget::OtherCapability(target) => Route {
                        capability: target.clone(),
                        class_prefix: None,
                        rule: Some(rule.id),
                    },
                    RedirectionTarget::ClassPrefix(prefix) => Route {
                        capability: capability.clone(),
                        class_prefix: Some(prefix.clone()),
                        rule: Some(rule.id),
                    },
                }
            }
            None => Route {
                capability: capability.clone(),
                class_prefix: ctx.class_prefix.clone(),
                rule: None,
            },
        };

        // Key-prefix conditions depend on more than the cache key. The fill
        // happens under the read guard so it cannot land after `apply`
        // clears the cache.
        let cacheable = candidates.iter().all(|rule| rule.condition.is_none());
        if cacheable {
            self.resolved.add_or_replace([(key, route.clone())]);
        }
        drop(guard);
        route
    }
}

#[async_trait]
impl AdminEventReceiver for RouteTable {
    async fn receive(&self, event: AdminEvent, cancel: CancellationToken) -> anyhow::Result<()> {
        if self.version().as_ref() == Some(&event.version) {
            return Ok(());
        }
        self.refresh(&cancel)?;
        Ok(())
    }
}
