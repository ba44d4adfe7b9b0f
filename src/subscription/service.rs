use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use super::{AdminEvent, AdminEventCategory, DeliveryError, DeliveryTarget, TargetResolver};

/// Default time a single subscriber gets to accept an event.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub category: AdminEventCategory,
    pub target: DeliveryTarget,
}

/// Outcome of one `notify` call.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<Uuid>,
    pub failed: Vec<(Uuid, DeliveryError)>,
}

/// Category-indexed subscriber registry with best-effort delivery.
///
/// Delivery is at most once and sequential. Every subscriber gets its own
/// timeout and cancellation scope and a failing subscriber never affects
/// the others. Failed deliveries are not retried and subscribers are never
/// dropped automatically.
#[derive(Debug, Clone)]
pub struct SubscriptionFanoutService {
    subscriptions: HashMap<Uuid, Subscription>,
    by_category: HashMap<AdminEventCategory, Vec<Uuid>>,
    delivery_timeout: Duration,
}

impl Default for SubscriptionFanoutService {
    fn default() -> Self {
        Self::new(DEFAULT_DELIVERY_TIMEOUT)
    }
}

impl SubscriptionFanoutService {
    pub fn new(delivery_timeout: Duration) -> Self {
        Self {
            subscriptions: HashMap::new(),
            by_category: HashMap::new(),
            delivery_timeout,
        }
    }

    /// Rebuild from persisted subscriptions.
    pub fn from_subscriptions(
        subscriptions: impl IntoIterator<Item = Subscription>,
        delivery_timeout: Duration,
    ) -> Self {
        let mut service = Self::new(delivery_timeout);
        for subscription in subscriptions {
            service.insert(subscription);
        }
        service
    }

    pub fn delivery_timeout(&self) -> Duration {
        self.delivery_timeout
    }

    pub fn subscribe(&mut self, category: AdminEventCategory, target: DeliveryTarget) -> Uuid {
        let id = Uuid::new_v4();
        debug!("Subscribing {} to {:?} as {}", target, category, id);
        self.insert(Subscription { id, category, target });
        id
    }

    pub fn unsubscribe(&mut self, id: &Uuid) -> bool {
        let Some(subscription) = self.subscriptions.remove(id) else {
            return false;
        };

        if let Some(ids) = self.by_category.get_mut(&subscription.category) {
            ids.retain(|other| other != id);
        }
        debug!("Unsubscribed {} from {:?}", subscription.target, subscription.category);
        true
    }

    pub fn get(&self, id: &Uuid) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    /// Every subscription. Within a category, in subscription order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.by_category
            .values()
            .flatten()
            .filter_map(|id| self.subscriptions.get(id))
            .cloned()
            .collect()
    }

    /// Subscriptions for `category`, in subscription order.
    pub fn subscribers(&self, category: AdminEventCategory) -> Vec<&Subscription> {
        self.by_category
            .get(&category)
            .into_iter()
            .flatten()
            .filter_map(|id| self.subscriptions.get(id))
            .collect()
    }

    /// Deliver `event` to every subscriber of its category, one at a time.
    pub async fn notify(
        &self,
        event: &AdminEvent,
        resolver: &dyn TargetResolver,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for subscription in self.subscribers(event.category) {
            match self.deliver(subscription, event, resolver, cancel).await {
                Ok(()) => report.delivered.push(subscription.id),
                Err(e) => {
                    error!(
                        "Failed to deliver {:?} ({}) to {}: {}",
                        event.category, event.version, subscription.target, e
                    );
                    report.failed.push((subscription.id, e));
                }
            }
        }

        debug!(
            "Notified {:?}: {} delivered, {} failed",
            event.category,
            report.delivered.len(),
            report.failed.len()
        );
        report
    }

    async fn deliver(
        &self,
        subscription: &Subscription,
        event: &AdminEvent,
        resolver: &dyn TargetResolver,
        cancel: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        let receiver = resolver
            .resolve(&subscription.target)
            .ok_or_else(|| DeliveryError::Unresolved(subscription.target.clone()))?;

        let scope = cancel.child_token();
        let delivery = tokio::time::timeout(
            self.delivery_timeout,
            receiver.receive(event.clone(), scope.clone()),
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DeliveryError::Cancelled),
            outcome = delivery => match outcome {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DeliveryError::Receiver(format!("{:#}", e))),
                Err(_) => Err(DeliveryError::TimedOut(self.delivery_timeout)),
            },
        };

        // Anything the receiver spawned under this scope stops here.
        scope.cancel();
        result
    }

    fn insert(&mut self, subscription: Subscription) {
        self.by_category
            .entry(subscription.category)
            .or_default()
            .push(subscription.id);
        self.subscriptions.insert(subscription.id, subscription);
    }
}
