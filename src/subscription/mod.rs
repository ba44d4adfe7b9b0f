//! Subscriptions to administrative events and their delivery.

mod service;
mod target;

pub use service::{DEFAULT_DELIVERY_TIMEOUT, DeliveryReport, Subscription, SubscriptionFanoutService};
pub use target::{
    ActorRef, AdminEvent, AdminEventCategory, AdminEventReceiver, DeliveryTarget, ReceiverDirectory,
    ServiceCoordinate, TargetResolver,
};

use std::time::Duration;
use thiserror::Error;

/// Why an event did not reach one subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("no receiver reachable for {0}")]
    Unresolved(DeliveryTarget),

    #[error("delivery timed out after {0:?}")]
    TimedOut(Duration),

    #[error("delivery cancelled")]
    Cancelled,

    #[error("receiver failed: {0}")]
    Receiver(String),
}
