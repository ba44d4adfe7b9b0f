use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{CHANGE_CHANNEL_CAPACITY, DataChanged, Source};
use crate::cache::ValueCache;
use crate::definitions::Definition;
use crate::filter::Filter;

/// Source backed only by process memory.
///
/// Used for bootstrap definitions that ship with a node and never live in
/// the durable store. It is its own authority, so `force_update` has
/// nothing to reconcile.
pub struct InMemorySource<T: Definition> {
    name: String,
    cache: ValueCache<Uuid, T>,
    changes: broadcast::Sender<DataChanged>,
}

impl<T: Definition> InMemorySource<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            cache: ValueCache::new(),
            changes,
        }
    }

    pub fn with_definitions(name: impl Into<String>, definitions: impl IntoIterator<Item = T>) -> Self {
        let source = Self::new(name);
        source
            .cache
            .add_or_replace(definitions.into_iter().map(|d| (d.id(), d)));
        source
    }

    /// Add or replace definitions and announce the change.
    pub fn insert(&self, definitions: impl IntoIterator<Item = T>) {
        let items: Vec<(Uuid, T)> = definitions.into_iter().map(|d| (d.id(), d)).collect();
        let ids: Vec<Uuid> = items.iter().map(|(id, _)| *id).collect();

        self.cache.add_or_replace(items);
        self.announce(ids);
    }

    /// Remove definitions and announce the ids that were present.
    pub fn remove(&self, ids: &[Uuid]) -> Vec<Uuid> {
        let removed = self.cache.remove(ids);
        self.announce(removed.clone());
        removed
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    fn announce(&self, ids: Vec<Uuid>) {
        if ids.is_empty() {
            return;
        }

        debug!("{} changed {} {} definitions", self.name, ids.len(), T::KIND);
        // No receivers is fine.
        let _ = self.changes.send(DataChanged {
            source: self.name.clone(),
            ids,
        });
    }
}

#[async_trait]
impl<T: Definition> Source<T> for InMemorySource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_get_by_id(&self, id: Uuid) -> Result<Option<T>> {
        Ok(self.cache.try_get(&id))
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<T>> {
        Ok(self.cache.get_many(ids))
    }

    async fn get_by_filter(&self, filter: &Filter<T>) -> Result<Vec<T>> {
        Ok(self.cache.get_by_predicate(|d| filter.matches(d)))
    }

    async fn get_first_by_filter(&self, filter: &Filter<T>) -> Result<Option<T>> {
        Ok(self.cache.find(|d| filter.matches(d)))
    }

    async fn get_all(&self) -> Result<Vec<T>> {
        Ok(self.cache.values())
    }

    async fn force_update(&self) -> Result<()> {
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<DataChanged> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::SignalDefinition;
    use crate::filter::FilterExpr;

    fn signal(name: &str) -> SignalDefinition {
        SignalDefinition {
            uid: Uuid::new_v4(),
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn test_lookups() {
        let a = signal("order-created");
        let b = signal("order-shipped");
        let source = InMemorySource::with_definitions("bootstrap", [a.clone(), b.clone()]);

        assert_eq!(source.try_get_by_id(a.uid).await.unwrap(), Some(a.clone()));
        assert_eq!(source.try_get_by_id(Uuid::new_v4()).await.unwrap(), None);

        let many = source.get_by_ids(&[b.uid, Uuid::new_v4()]).await.unwrap();
        assert_eq!(many, vec![b.clone()]);

        let filter = Filter::from_expr(FilterExpr::eq("name", "order-shipped"));
        assert_eq!(source.get_by_filter(&filter).await.unwrap(), vec![b.clone()]);
        assert_eq!(source.get_first_by_filter(&filter).await.unwrap(), Some(b));
        assert_eq!(source.get_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_and_remove_announce_changes() {
        let source = InMemorySource::<SignalDefinition>::new("bootstrap");
        let mut changes = source.subscribe_changes();

        let a = signal("a");
        source.insert([a.clone()]);
        let event = changes.recv().await.unwrap();
        assert_eq!(event.source, "bootstrap");
        assert_eq!(event.ids, vec![a.uid]);

        assert!(source.remove(&[Uuid::new_v4()]).is_empty());
        assert_eq!(source.remove(&[a.uid]), vec![a.uid]);
        let event = changes.recv().await.unwrap();
        assert_eq!(event.ids, vec![a.uid]);
        assert!(source.is_empty());
    }
}
