//! Definition sources and the resolver that walks them.
//!
//! A [`Source`] is one backing provider of definitions of a single kind:
//! an in-memory bootstrap set, or a cache in front of a durable store. The
//! [`SourceStrategyResolver`] consults an ordered list of them.

mod memory;
mod persistent;
mod resolver;

pub use memory::InMemorySource;
pub use persistent::{CachedDefinition, PersistentBackedSource};
pub use resolver::{Resolution, ResolverOptions, SourceStrategyResolver};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::select_all;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use uuid::Uuid;

use crate::definitions::Definition;
use crate::filter::Filter;

/// Capacity of each source's DataChanged channel.
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Raised by a source when cached or stored definitions changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChanged {
    pub source: String,
    pub ids: Vec<Uuid>,
}

#[async_trait]
pub trait Source<T: Definition>: Send + Sync {
    /// Name used in logs and in [`Resolution::Unavailable`].
    fn name(&self) -> &str;

    async fn try_get_by_id(&self, id: Uuid) -> Result<Option<T>>;

    /// Definitions for the ids this source knows. Unknown ids are skipped.
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<T>>;

    async fn get_by_filter(&self, filter: &Filter<T>) -> Result<Vec<T>>;

    async fn get_first_by_filter(&self, filter: &Filter<T>) -> Result<Option<T>>;

    async fn get_all(&self) -> Result<Vec<T>>;

    /// Reconcile with the authoritative backing data.
    async fn force_update(&self) -> Result<()>;

    fn subscribe_changes(&self) -> broadcast::Receiver<DataChanged>;
}

/// Why a single source call contributed nothing.
#[derive(Debug, Error)]
pub enum SourceCallError {
    #[error("call cancelled by caller")]
    Cancelled,

    #[error("call timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// DataChanged events of several sources merged into one stream.
pub struct ChangeFeed {
    receivers: Vec<broadcast::Receiver<DataChanged>>,
}

impl ChangeFeed {
    pub fn new(receivers: Vec<broadcast::Receiver<DataChanged>>) -> Self {
        Self { receivers }
    }

    /// Next change from any source. Returns `None` once every source has
    /// been dropped. Lagging receivers skip what they missed.
    pub async fn recv(&mut self) -> Option<DataChanged> {
        loop {
            if self.receivers.is_empty() {
                return None;
            }

            let (result, index, _) = {
                let pending = self.receivers.iter_mut().map(|rx| Box::pin(rx.recv()));
                select_all(pending).await
            };

            match result {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Change feed lagged, {} notifications skipped", skipped);
                }
                Err(RecvError::Closed) => {
                    self.receivers.swap_remove(index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_change_feed_merges_sources() {
        let (a_tx, a_rx) = broadcast::channel(8);
        let (b_tx, b_rx) = broadcast::channel(8);
        let mut feed = ChangeFeed::new(vec![a_rx, b_rx]);

        let id = Uuid::new_v4();
        b_tx.send(DataChanged {
            source: "b".to_string(),
            ids: vec![id],
        })
        .unwrap();

        let event = feed.recv().await.unwrap();
        assert_eq!(event.source, "b");
        assert_eq!(event.ids, vec![id]);

        drop(a_tx);
        drop(b_tx);
        assert!(feed.recv().await.is_none());
    }
}
