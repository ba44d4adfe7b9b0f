// Core modules
mod cache;
mod config;
mod db;
mod filter;
mod types;
pub mod api;

// Definition resolution
pub mod catalog;
pub mod definitions;
pub mod source;
pub mod store;

// Cluster administration
pub mod admin;
pub mod redirection;
pub mod routing;
pub mod subscription;

// Re-export key types and functions
pub use cache::ValueCache;
pub use config::{AdminConfig, ApiConfig, NodeConfig, ResolverConfig, resolve_config_path};
pub use db::{DatabaseConfig, Db, create_connection, ensure_schema};
pub use filter::{Filter, FilterExpr};
pub use types::{ActorKind, CapabilityName, ETag, IdentityCard, RegistryVersion, ServiceName};

pub use admin::{
    AdminError, AdminStateStore, AdministrationHandle, AdministrationRegistry,
    AdministrationStateRecord, MemoryAdminStateStore, SurrealAdminStateStore,
};
pub use catalog::{DefinitionBundle, DefinitionCatalog, DefinitionKind};
pub use redirection::{
    RedirectionError, RedirectionRegistry, RedirectionRule, RedirectionSnapshot, RedirectionTarget,
    RouteCondition, RouteContext,
};
pub use routing::{Route, RouteTable};
pub use source::{
    DataChanged, InMemorySource, PersistentBackedSource, Resolution, ResolverOptions, Source,
    SourceStrategyResolver,
};
pub use store::{DefinitionStore, SurrealDefinitionStore};
pub use subscription::{
    AdminEvent, AdminEventCategory, AdminEventReceiver, DeliveryError, DeliveryTarget,
    ReceiverDirectory, Subscription, SubscriptionFanoutService, TargetResolver,
};
