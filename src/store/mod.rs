//! Durable definition storage.
//!
//! [`DefinitionStore`] is the contract a persistent source falls back to on
//! cache misses. `SurrealDefinitionStore` is the bundled implementation.

mod surreal;

pub use surreal::SurrealDefinitionStore;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::definitions::{Definition, DefinitionHeader, DefinitionRecord};
use crate::filter::Filter;

#[async_trait]
pub trait DefinitionStore<T: Definition>: Send + Sync {
    /// Point lookup by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<DefinitionRecord<T>>>;

    /// Batch lookup. Unknown ids are absent from the result.
    async fn get_by_ids(&self, ids: &[Uuid]) -> Result<Vec<DefinitionRecord<T>>>;

    /// Records whose payload matches `filter`.
    async fn query(&self, filter: &Filter<T>) -> Result<Vec<DefinitionRecord<T>>>;

    /// The authoritative `{id, etag}` set, without payloads.
    async fn list_headers(&self) -> Result<Vec<DefinitionHeader>>;
}
