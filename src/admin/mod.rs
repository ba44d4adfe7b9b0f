//! Administration registry: the cluster's redirection table and the
//! subscribers interested in its changes, behind one persisted record.

mod persistence;
mod registry;
mod worker;

pub use persistence::{
    AdminStateStore, AdministrationStateRecord, MemoryAdminStateStore, SurrealAdminStateStore,
};
pub use registry::AdministrationRegistry;
pub use worker::AdministrationHandle;

use thiserror::Error;

use crate::redirection::RedirectionError;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Redirection(#[from] RedirectionError),

    #[error("administration state store failed: {0:#}")]
    Persistence(anyhow::Error),

    #[error("administration worker has stopped")]
    WorkerStopped,

    #[error("operation cancelled")]
    Cancelled,
}
