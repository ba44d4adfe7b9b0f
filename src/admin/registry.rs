use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{AdminError, AdminStateStore, AdministrationStateRecord};
use crate::redirection::{RedirectionRegistry, RedirectionRule, RedirectionSnapshot};
use crate::subscription::{
    AdminEvent, AdminEventCategory, DeliveryTarget, SubscriptionFanoutService, TargetResolver,
};
use crate::types::{IdentityCard, RegistryVersion};

/// One redirection table and one subscriber list behind a single persisted
/// state record.
///
/// Methods take `&mut self`: the registry expects exactly one owner at a
/// time. [`AdministrationRegistry::spawn`] provides that owner as a worker
/// task. Every mutation is persisted before subscribers hear about it, and
/// a mutation that cannot be persisted is rolled back.
pub struct AdministrationRegistry {
    instance: String,
    routes: RedirectionRegistry,
    subscriptions: SubscriptionFanoutService,
    store: Arc<dyn AdminStateStore>,
    resolver: Arc<dyn TargetResolver>,
    published: watch::Sender<RedirectionSnapshot>,
}

impl AdministrationRegistry {
    /// Restore the registry for `instance` from `store`, or start empty.
    pub async fn load(
        instance: impl Into<String>,
        store: Arc<dyn AdminStateStore>,
        resolver: Arc<dyn TargetResolver>,
        delivery_timeout: Duration,
    ) -> Result<Self, AdminError> {
        let instance = instance.into();
        let record = store
            .load(&instance)
            .await
            .map_err(AdminError::Persistence)?;

        let (routes, subscriptions) = match record {
            Some(record) => {
                info!(
                    "Restored administration registry {} at version {} ({} rules, {} subscriptions)",
                    instance,
                    record.version,
                    record.redirection_rules.len(),
                    record.subscriptions.len()
                );
                (
                    RedirectionRegistry::from_parts(record.redirection_rules, record.version)?,
                    SubscriptionFanoutService::from_subscriptions(record.subscriptions, delivery_timeout),
                )
            }
            None => {
                info!("Starting empty administration registry {}", instance);
                (
                    RedirectionRegistry::new(),
                    SubscriptionFanoutService::new(delivery_timeout),
                )
            }
        };

        let (published, _) = watch::channel(routes.snapshot());
        Ok(Self {
            instance,
            routes,
            subscriptions,
            store,
            resolver,
            published,
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn version(&self) -> &RegistryVersion {
        self.routes.version()
    }

    pub fn get_snapshot(&self, caller_version: Option<&RegistryVersion>) -> Option<RedirectionSnapshot> {
        self.routes.get_snapshot(caller_version)
    }

    /// Committed snapshots, updated after each persisted route change.
    pub fn watch_snapshots(&self) -> watch::Receiver<RedirectionSnapshot> {
        self.published.subscribe()
    }

    pub fn subscriptions(&self) -> &SubscriptionFanoutService {
        &self.subscriptions
    }

    pub fn record(&self) -> AdministrationStateRecord {
        AdministrationStateRecord {
            subscriptions: self.subscriptions.subscriptions(),
            redirection_rules: self.routes.get_all(),
            version: self.routes.version().clone(),
        }
    }

    pub async fn request_append_one(
        &mut self,
        rule: RedirectionRule,
        identity: &IdentityCard,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        self.request_append(vec![rule], identity, cancel).await
    }

    pub async fn request_append(
        &mut self,
        rules: Vec<RedirectionRule>,
        identity: &IdentityCard,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        info!(
            "{} requested {} redirection rule(s) on {}",
            identity,
            rules.len(),
            self.instance
        );

        let before = self.routes.clone();
        let changed = match rules.as_slice() {
            [] => false,
            [rule] => self.routes.push_one(rule.clone())?,
            _ => self.routes.push_batch(&rules)?,
        };

        self.commit_route_change(changed, before, cancel).await
    }

    pub async fn request_pop_one(
        &mut self,
        id: Uuid,
        identity: &IdentityCard,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        self.request_pop(vec![id], identity, cancel).await
    }

    pub async fn request_pop(
        &mut self,
        ids: Vec<Uuid>,
        identity: &IdentityCard,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        info!(
            "{} requested removal of {} redirection rule(s) on {}",
            identity,
            ids.len(),
            self.instance
        );

        let before = self.routes.clone();
        let changed = self.routes.pop_batch(&ids);
        self.commit_route_change(changed, before, cancel).await
    }

    pub async fn subscribe_route_change(&mut self, target: DeliveryTarget) -> Result<Uuid, AdminError> {
        let id = self
            .subscriptions
            .subscribe(AdminEventCategory::RouteChange, target);

        if let Err(e) = self.persist().await {
            self.subscriptions.unsubscribe(&id);
            return Err(e);
        }
        Ok(id)
    }

    pub async fn unsubscribe(&mut self, id: Uuid) -> Result<bool, AdminError> {
        let Some(subscription) = self.subscriptions.get(&id).cloned() else {
            return Ok(false);
        };

        self.subscriptions.unsubscribe(&id);
        if let Err(e) = self.persist().await {
            let restored = self.subscriptions.subscriptions().into_iter().chain([subscription]);
            self.subscriptions =
                SubscriptionFanoutService::from_subscriptions(restored, self.subscriptions.delivery_timeout());
            return Err(e);
        }
        Ok(true)
    }

    /// Persist, publish, then notify. Restores `before` when persisting
    /// fails.
    async fn commit_route_change(
        &mut self,
        changed: bool,
        before: RedirectionRegistry,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        if !changed {
            return Ok(false);
        }

        if let Err(e) = self.persist().await {
            warn!(
                "Rolling back redirection change on {} to version {}",
                self.instance,
                before.version()
            );
            self.routes = before;
            return Err(e);
        }

        self.published.send_replace(self.routes.snapshot());

        let event = AdminEvent {
            category: AdminEventCategory::RouteChange,
            version: self.routes.version().clone(),
        };
        self.subscriptions
            .notify(&event, self.resolver.as_ref(), cancel)
            .await;

        Ok(true)
    }

    async fn persist(&self) -> Result<(), AdminError> {
        self.store
            .save(&self.instance, &self.record())
            .await
            .map_err(AdminError::Persistence)
    }
}
