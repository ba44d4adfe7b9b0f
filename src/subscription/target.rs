use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::types::{ActorKind, RegistryVersion, ServiceName};

/// Kind of administrative change a subscriber can listen for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminEventCategory {
    /// The redirection table changed.
    RouteChange,
}

/// Payload delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminEvent {
    pub category: AdminEventCategory,
    /// Version of the registry after the change.
    pub version: RegistryVersion,
}

/// A cluster-wide singleton service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceCoordinate {
    pub service: ServiceName,
}

/// One addressable actor instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorRef {
    pub kind: ActorKind,
    pub key: String,
}

/// Where a subscription's events go. Resolved to a receiver only when an
/// event is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryTarget {
    Service(ServiceCoordinate),
    Actor(ActorRef),
}

impl DeliveryTarget {
    pub fn service(name: impl Into<ServiceName>) -> Self {
        Self::Service(ServiceCoordinate {
            service: name.into(),
        })
    }

    pub fn actor(kind: impl Into<ActorKind>, key: impl Into<String>) -> Self {
        Self::Actor(ActorRef {
            kind: kind.into(),
            key: key.into(),
        })
    }
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(coord) => write!(f, "service:{}", coord.service),
            Self::Actor(actor) => write!(f, "actor:{}/{}", actor.kind, actor.key),
        }
    }
}

#[async_trait]
pub trait AdminEventReceiver: Send + Sync {
    /// Handle one event. `cancel` fires when the delivery budget runs out.
    async fn receive(&self, event: AdminEvent, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// Maps a delivery target to something that can receive events.
pub trait TargetResolver: Send + Sync {
    fn resolve(&self, target: &DeliveryTarget) -> Option<Arc<dyn AdminEventReceiver>>;
}

/// In-process directory of receivers.
///
/// Services and actors hosted by this node register themselves here, so
/// delivering to them never leaves the process.
#[derive(Default)]
pub struct ReceiverDirectory {
    receivers: RwLock<HashMap<DeliveryTarget, Arc<dyn AdminEventReceiver>>>,
}

impl ReceiverDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, target: DeliveryTarget, receiver: Arc<dyn AdminEventReceiver>) {
        self.receivers.write().insert(target, receiver);
    }

    pub fn unregister(&self, target: &DeliveryTarget) -> bool {
        self.receivers.write().remove(target).is_some()
    }

    pub fn len(&self) -> usize {
        self.receivers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.read().is_empty()
    }
}

impl TargetResolver for ReceiverDirectory {
    fn resolve(&self, target: &DeliveryTarget) -> Option<Arc<dyn AdminEventReceiver>> {
        self.receivers.read().get(target).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl AdminEventReceiver for Nop {
        async fn receive(&self, _event: AdminEvent, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_directory_resolution() {
        let directory = ReceiverDirectory::new();
        let service = DeliveryTarget::service("route-cache");
        let actor = DeliveryTarget::actor("route-listener", "node-1");

        directory.register(service.clone(), Arc::new(Nop));
        assert!(directory.resolve(&service).is_some());
        assert!(directory.resolve(&actor).is_none());

        assert!(directory.unregister(&service));
        assert!(!directory.unregister(&service));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_target_serde_and_display() {
        let target = DeliveryTarget::actor("route-listener", "node-1");
        let json = serde_json::to_value(&target).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"actor": {"kind": "route-listener", "key": "node-1"}})
        );
        assert_eq!(target.to_string(), "actor:route-listener/node-1");
        assert_eq!(DeliveryTarget::service("x").to_string(), "service:x");
    }
}
