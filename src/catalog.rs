//! Per-kind resolvers for every definition kind a node serves.
//!
//! Each kind is resolved from two layers: definitions shipped in a bootstrap
//! bundle (held in memory) and, when a database is configured, the durable
//! store behind a caching [`PersistentBackedSource`]. Bootstrap definitions
//! win lookups for ids present in both.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::Db;
use crate::definitions::{
    BoardTemplateDefinition, Definition, SignalDefinition, TriggerDefinition, WorkflowDefinition,
};
use crate::source::{
    InMemorySource, PersistentBackedSource, Resolution, ResolverOptions, Source,
    SourceStrategyResolver,
};
use crate::store::{DefinitionStore, SurrealDefinitionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Workflow,
    Signal,
    Trigger,
    BoardTemplate,
}

impl DefinitionKind {
    pub const ALL: [Self; 4] = [Self::Workflow, Self::Signal, Self::Trigger, Self::BoardTemplate];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workflow => WorkflowDefinition::KIND,
            Self::Signal => SignalDefinition::KIND,
            Self::Trigger => TriggerDefinition::KIND,
            Self::BoardTemplate => BoardTemplateDefinition::KIND,
        }
    }
}

impl FromStr for DefinitionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow!("unknown definition kind '{}'", s))
    }
}

/// Definitions grouped by kind, as read from a bootstrap or import file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionBundle {
    pub workflows: Vec<WorkflowDefinition>,
    pub signals: Vec<SignalDefinition>,
    pub triggers: Vec<TriggerDefinition>,
    pub board_templates: Vec<BoardTemplateDefinition>,
}

impl DefinitionBundle {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading definitions {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing definitions {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.workflows.len() + self.signals.len() + self.triggers.len() + self.board_templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every definition into the durable store. Returns how many were
    /// written.
    pub async fn import_into(self, db: &Db) -> anyhow::Result<usize> {
        let mut written = 0;
        written += put_all(db, self.workflows).await?;
        written += put_all(db, self.signals).await?;
        written += put_all(db, self.triggers).await?;
        written += put_all(db, self.board_templates).await?;
        Ok(written)
    }
}

async fn put_all<T: Definition>(db: &Db, definitions: Vec<T>) -> anyhow::Result<usize> {
    let store = SurrealDefinitionStore::<T>::new(db.clone());
    let count = definitions.len();
    for definition in definitions {
        let id = definition.id();
        store
            .put(definition)
            .await
            .with_context(|| format!("storing {} {}", T::KIND, id))?;
    }
    Ok(count)
}

pub struct DefinitionCatalog {
    pub workflows: SourceStrategyResolver<WorkflowDefinition>,
    pub signals: SourceStrategyResolver<SignalDefinition>,
    pub triggers: SourceStrategyResolver<TriggerDefinition>,
    pub board_templates: SourceStrategyResolver<BoardTemplateDefinition>,
}

impl DefinitionCatalog {
    /// Layer `bootstrap` over the durable store in `db`, if any.
    pub fn new(bootstrap: DefinitionBundle, db: Option<&Db>, options: ResolverOptions) -> Self {
        Self {
            workflows: layered(bootstrap.workflows, db, &options),
            signals: layered(bootstrap.signals, db, &options),
            triggers: layered(bootstrap.triggers, db, &options),
            board_templates: layered(bootstrap.board_templates, db, &options),
        }
    }

    /// Look up one definition of `kind`, serialized for the wire.
    pub async fn resolve_json(
        &self,
        kind: DefinitionKind,
        id: Uuid,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Resolution<Value>> {
        match kind {
            DefinitionKind::Workflow => resolve_as_json(&self.workflows, id, cancel).await,
            DefinitionKind::Signal => resolve_as_json(&self.signals, id, cancel).await,
            DefinitionKind::Trigger => resolve_as_json(&self.triggers, id, cancel).await,
            DefinitionKind::BoardTemplate => resolve_as_json(&self.board_templates, id, cancel).await,
        }
    }

    /// Every definition of `kind` any layer can see.
    pub async fn list_json(
        &self,
        kind: DefinitionKind,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<Value>> {
        match kind {
            DefinitionKind::Workflow => list_as_json(&self.workflows, cancel).await,
            DefinitionKind::Signal => list_as_json(&self.signals, cancel).await,
            DefinitionKind::Trigger => list_as_json(&self.triggers, cancel).await,
            DefinitionKind::BoardTemplate => list_as_json(&self.board_templates, cancel).await,
        }
    }

    /// Reconcile the caches of every kind with their stores. Every kind is
    /// attempted; the first failure is returned.
    pub async fn force_update_all(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let results = [
            self.workflows.force_update(cancel).await,
            self.signals.force_update(cancel).await,
            self.triggers.force_update(cancel).await,
            self.board_templates.force_update(cancel).await,
        ];
        results.into_iter().collect()
    }

    /// Run `force_update_all` every `period` until `shutdown` fires.
    pub fn spawn_refresh(
        self: Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;

            info!("Refreshing cached definitions every {:?}", period);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                match self.force_update_all(&shutdown).await {
                    Ok(()) => debug!("Definition caches reconciled"),
                    Err(e) => warn!("Definition refresh failed: {:#}", e),
                }
            }
            debug!("Definition refresh loop stopped");
        })
    }
}

fn layered<T: Definition>(
    bootstrap: Vec<T>,
    db: Option<&Db>,
    options: &ResolverOptions,
) -> SourceStrategyResolver<T> {
    let mut sources: Vec<Arc<dyn Source<T>>> = vec![Arc::new(InMemorySource::with_definitions(
        format!("bootstrap:{}", T::KIND),
        bootstrap,
    ))];

    if let Some(db) = db {
        let store: Arc<dyn DefinitionStore<T>> = Arc::new(SurrealDefinitionStore::<T>::new(db.clone()));
        sources.push(Arc::new(PersistentBackedSource::new(format!("store:{}", T::KIND), store)));
    }

    SourceStrategyResolver::with_options(sources, options.clone())
}

async fn resolve_as_json<T: Definition>(
    resolver: &SourceStrategyResolver<T>,
    id: Uuid,
    cancel: &CancellationToken,
) -> anyhow::Result<Resolution<Value>> {
    Ok(match resolver.resolve_by_id(id, cancel).await {
        Resolution::Found(value) => Resolution::Found(serde_json::to_value(value)?),
        other => other.map(|_| Value::Null),
    })
}

async fn list_as_json<T: Definition>(
    resolver: &SourceStrategyResolver<T>,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<Value>> {
    resolver
        .get_all(cancel)
        .await
        .into_iter()
        .map(|value| serde_json::to_value(value).map_err(Into::into))
        .collect()
}
