use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use super::{CHANGE_CHANNEL_CAPACITY, DataChanged, Source};
use crate::cache::ValueCache;
use crate::definitions::{Definition, DefinitionRecord};
use crate::filter::Filter;
use crate::store::DefinitionStore;
use crate::types::ETag;

/// A cached payload together with the ETag it was fetched at.
#[derive(Debug, Clone)]
pub struct CachedDefinition<T> {
    pub etag: ETag,
    pub payload: T,
}

/// Source that caches definitions in front of a durable store.
///
/// Misses fall through to the store and populate the cache. Staleness is
/// pull-based: [`Source::force_update`] compares cached ETags against the
/// store's header listing and evicts whatever moved or vanished, so the
/// next access refetches it.
pub struct PersistentBackedSource<T: Definition> {
    name: String,
    store: Arc<dyn DefinitionStore<T>>,
    cache: ValueCache<Uuid, CachedDefinition<T>>,
    changes: broadcast::Sender<DataChanged>,
}

impl<T: Definition> PersistentBackedSource<T> {
    pub fn new(name: impl Into<String>, store: Arc<dyn DefinitionStore<T>>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            store,
            cache: ValueCache::new(),
            changes,
        }
    }

    /// Ids currently held in the cache.
    pub fn cached_ids(&self) -> Vec<Uuid> {
        self.cache.keys()
    }

    pub fn cached_etag(&self, id: Uuid) -> Option<ETag> {
        self.cache.try_get(&id).map(|entry| entry.etag)
    }

    /// Drop every cached entry. The next access reloads from the store.
    pub fn clear(&self) {
        let ids = self.cache.evict_where(|_, _| true);
        self.announce(ids);
    }

    fn remember(&self, records: Vec<DefinitionRecord<T>>) -> Vec<T> {
        let payloads = records.iter().map(|r| r.payload.clone()).collect();
        self.cache.add_or_replace(records.into_iter().map(|r| {
            (
                r.id,
                CachedDefinition {
                    etag: r.etag,
                    payload: r.payload,
                },
            )
        }));
        payloads
    }

    fn announce(&self, ids: Vec<Uuid>) {
        if ids.is_empty() {
            return;
        }
        let _ = self.changes.send(DataChanged {
            source: self.name.clone(),
            ids,
        });
    }
}

#[async_trait]
impl<T: Definition> Source<T> for PersistentBackedSource<T> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_get_by_id(&self, id: Uuid) -> Result<Option<T>> {
        if let Some(entry) = self.cache.try_get(&id) {
            return Ok(Some(entry.payload));
        }

        debug!("{}: cache miss for {} {}", self.name, T::KIND, id);
        let Some(record) = self.store.get_by_id(id).await? else {
            return Ok(None);
        };

        Ok(self.remember(vec![record]).into_iter().next())
    }

    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<T>> {
        let mut found = Vec::with_capacity(ids.len());
        let mut missing = Vec::new();

        for id in ids {
            match self.cache.try_get(id) {
                Some(entry) => found.push(entry.payload),
                None if !missing.contains(id) => missing.push(*id),
                None => {}
            }
        }

        if !missing.is_empty() {
            debug!(
                "{}: {} of {} {} definitions not cached",
                self.name,
                missing.len(),
                ids.len(),
                T::KIND
            );
            let records = self.store.get_by_ids(&missing).await?;
            found.extend(self.remember(records));
        }

        Ok(found)
    }

    async fn get_by_filter(&self, filter: &Filter<T>) -> Result<Vec<T>> {
        let records = self.store.query(filter).await?;
        Ok(self.remember(records))
    }

    async fn get_first_by_filter(&self, filter: &Filter<T>) -> Result<Option<T>> {
        if let Some(entry) = self.cache.find(|entry| filter.matches(&entry.payload)) {
            return Ok(Some(entry.payload));
        }

        let records = self.store.query(filter).await?;
        Ok(self.remember(records).into_iter().next())
    }

    async fn get_all(&self) -> Result<Vec<T>> {
        let records = self.store.query(&Filter::all()).await?;
        Ok(self.remember(records))
    }

    async fn force_update(&self) -> Result<()> {
        // Store I/O happens before the cache lock is taken.
        let headers = self.store.list_headers().await?;
        let authoritative: HashMap<Uuid, ETag> =
            headers.into_iter().map(|h| (h.id, h.etag)).collect();

        let evicted = self.cache.evict_where(|id, entry| {
            authoritative.get(id).is_none_or(|etag| *etag != entry.etag)
        });

        if !evicted.is_empty() {
            info!(
                "{}: evicted {} stale {} definitions",
                self.name,
                evicted.len(),
                T::KIND
            );
        }
        self.announce(evicted);
        Ok(())
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<DataChanged> {
        self.changes.subscribe()
    }
}
