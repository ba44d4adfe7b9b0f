use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::db::{Db, StoredAdminState};
use crate::redirection::RedirectionRule;
use crate::subscription::Subscription;
use crate::types::RegistryVersion;

/// Everything an administration registry needs to come back after a
/// restart. One record per registry instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdministrationStateRecord {
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub redirection_rules: Vec<RedirectionRule>,
    pub version: RegistryVersion,
}

#[async_trait]
pub trait AdminStateStore: Send + Sync {
    async fn load(&self, instance: &str) -> Result<Option<AdministrationStateRecord>>;

    /// Replace the stored record. Must be durable when it returns `Ok`.
    async fn save(&self, instance: &str, record: &AdministrationStateRecord) -> Result<()>;
}

/// Stores the state record as a JSON document in the `admin_state` table.
#[derive(Clone)]
pub struct SurrealAdminStateStore {
    db: Db,
}

impl SurrealAdminStateStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AdminStateStore for SurrealAdminStateStore {
    async fn load(&self, instance: &str) -> Result<Option<AdministrationStateRecord>> {
        let mut res = self
            .db
            .query("SELECT instance, state FROM admin_state WHERE instance = $instance")
            .bind(("instance", instance.to_string()))
            .await?;

        let rows: Vec<StoredAdminState> = res.take(0)?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };

        let record = serde_json::from_value(row.state)
            .with_context(|| format!("malformed administration state for {}", instance))?;
        Ok(Some(record))
    }

    async fn save(&self, instance: &str, record: &AdministrationStateRecord) -> Result<()> {
        let state = serde_json::to_value(record)?;

        self.db
            .query(
                r#"
                UPSERT type::thing('admin_state', $instance) CONTENT {
                    instance: $instance,
                    state: $state
                } RETURN NONE
                "#,
            )
            .bind(("instance", instance.to_string()))
            .bind(("state", state))
            .await?
            .check()?;

        debug!(
            "Saved administration state {} at version {}",
            instance, record.version
        );
        Ok(())
    }
}

/// Keeps state records in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryAdminStateStore {
    records: Mutex<HashMap<String, AdministrationStateRecord>>,
}

impl MemoryAdminStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdminStateStore for MemoryAdminStateStore {
    async fn load(&self, instance: &str) -> Result<Option<AdministrationStateRecord>> {
        Ok(self.records.lock().get(instance).cloned())
    }

    async fn save(&self, instance: &str, record: &AdministrationStateRecord) -> Result<()> {
        self.records
            .lock()
            .insert(instance.to_string(), record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseConfig, create_connection, ensure_schema};
    use crate::redirection::RedirectionTarget;
    use crate::subscription::{AdminEventCategory, DeliveryTarget};
    use uuid::Uuid;

    async fn setup_test_db() -> Db {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();
        db
    }

    fn sample_record() -> AdministrationStateRecord {
        AdministrationStateRecord {
            subscriptions: vec![Subscription {
                id: Uuid::new_v4(),
                category: AdminEventCategory::RouteChange,
                target: DeliveryTarget::service("route-cache"),
            }],
            redirection_rules: vec![RedirectionRule::new(
                "billing",
                RedirectionTarget::ClassPrefix("fast".to_string()),
            )],
            version: RegistryVersion::fresh(),
        }
    }

    #[tokio::test]
    async fn test_surreal_store_roundtrip() {
        let db = setup_test_db().await;
        let store = SurrealAdminStateStore::new(db);

        assert!(store.load("main").await.unwrap().is_none());

        let record = sample_record();
        store.save("main", &record).await.unwrap();
        assert_eq!(store.load("main").await.unwrap(), Some(record.clone()));

        let mut updated = record;
        updated.subscriptions.clear();
        updated.version = RegistryVersion::fresh();
        store.save("main", &updated).await.unwrap();
        assert_eq!(store.load("main").await.unwrap(), Some(updated));

        assert!(store.load("other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryAdminStateStore::new();
        let record = sample_record();

        store.save("main", &record).await.unwrap();
        assert_eq!(store.load("main").await.unwrap(), Some(record));
        assert!(store.load("other").await.unwrap().is_none());
    }
}
