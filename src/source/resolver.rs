use futures::future::{BoxFuture, join_all};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ChangeFeed, Source, SourceCallError};
use crate::definitions::Definition;
use crate::filter::Filter;

#[derive(Debug, Clone, Default)]
pub struct ResolverOptions {
    /// Upper bound on any single source call. `None` waits indefinitely.
    pub source_timeout: Option<Duration>,
}

/// Outcome of a point lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    Found(T),
    /// Every source answered and none had the id.
    NotFound,
    /// No source had the id and these sources could not answer.
    Unavailable { failed_sources: Vec<String> },
}

impl<T> Resolution<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolution<U> {
        match self {
            Self::Found(value) => Resolution::Found(f(value)),
            Self::NotFound => Resolution::NotFound,
            Self::Unavailable { failed_sources } => Resolution::Unavailable { failed_sources },
        }
    }
}

/// Consults an ordered list of sources.
///
/// Point lookups treat sources as fallbacks: the first one that has the id
/// wins and later ones are not asked. Bulk lookups ask every source at once
/// and return the union, tolerating sources that fail.
pub struct SourceStrategyResolver<T: Definition> {
    sources: Vec<Arc<dyn Source<T>>>,
    options: ResolverOptions,
}

impl<T: Definition> SourceStrategyResolver<T> {
    pub fn new(sources: Vec<Arc<dyn Source<T>>>) -> Self {
        Self::with_options(sources, ResolverOptions::default())
    }

    pub fn with_options(sources: Vec<Arc<dyn Source<T>>>, options: ResolverOptions) -> Self {
        Self { sources, options }
    }

    pub fn sources(&self) -> &[Arc<dyn Source<T>>] {
        &self.sources
    }

    pub async fn get_first_by_id(&self, id: Uuid, cancel: &CancellationToken) -> Option<T> {
        self.resolve_by_id(id, cancel).await.found()
    }

    pub async fn resolve_by_id(&self, id: Uuid, cancel: &CancellationToken) -> Resolution<T> {
        let mut failed_sources = Vec::new();

        for source in &self.sources {
            match self.guard(cancel, source.try_get_by_id(id)).await {
                Ok(Some(value)) => return Resolution::Found(value),
                Ok(None) => {}
                Err(SourceCallError::Cancelled) => {
                    failed_sources.push(source.name().to_string());
                    break;
                }
                Err(e) => {
                    warn!("Source {} failed to look up {} {}: {}", source.name(), T::KIND, id, e);
                    failed_sources.push(source.name().to_string());
                }
            }
        }

        if failed_sources.is_empty() {
            Resolution::NotFound
        } else {
            Resolution::Unavailable { failed_sources }
        }
    }

    pub async fn get_first_by_filter(
        &self,
        filter: &Filter<T>,
        cancel: &CancellationToken,
    ) -> Option<T> {
        for source in &self.sources {
            match self.guard(cancel, source.get_first_by_filter(filter)).await {
                Ok(Some(value)) => return Some(value),
                Ok(None) => {}
                Err(SourceCallError::Cancelled) => return None,
                Err(e) => {
                    warn!("Source {} failed a {} filter lookup: {}", source.name(), T::KIND, e);
                }
            }
        }
        None
    }

    /// Union of every source's answer for `ids`.
    pub async fn get_many(&self, ids: &[Uuid], cancel: &CancellationToken) -> Vec<T> {
        if ids.is_empty() {
            return Vec::new();
        }
        self.fan_out("get_many", cancel, |source| source.get_by_ids(ids))
            .await
    }

    pub async fn get_by_filter(&self, filter: &Filter<T>, cancel: &CancellationToken) -> Vec<T> {
        self.fan_out("get_by_filter", cancel, |source| source.get_by_filter(filter))
            .await
    }

    pub async fn get_all(&self, cancel: &CancellationToken) -> Vec<T> {
        self.fan_out("get_all", cancel, |source| source.get_all())
            .await
    }

    /// Ask every source to reconcile. All sources are attempted; the first
    /// failure is returned.
    pub async fn force_update(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut first_error = None;

        for source in &self.sources {
            if let Err(e) = self.guard(cancel, source.force_update()).await {
                warn!("Source {} failed to refresh {} definitions: {}", source.name(), T::KIND, e);
                first_error.get_or_insert_with(|| {
                    anyhow::Error::new(e).context(format!("refreshing source {}", source.name()))
                });
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// DataChanged events from every source.
    pub fn subscribe_changes(&self) -> ChangeFeed {
        ChangeFeed::new(self.sources.iter().map(|s| s.subscribe_changes()).collect())
    }

    async fn fan_out<'a, F>(&'a self, op: &str, cancel: &CancellationToken, call: F) -> Vec<T>
    where
        F: Fn(&'a dyn Source<T>) -> BoxFuture<'a, anyhow::Result<Vec<T>>>,
    {
        let calls = self.sources.iter().map(|source| {
            let pending = call(source.as_ref());
            async move { (source.name(), self.guard(cancel, pending).await) }
        });

        let mut seen = HashSet::new();
        let mut merged = Vec::new();

        // join_all keeps source order, so earlier sources win duplicates.
        for (name, result) in join_all(calls).await {
            match result {
                Ok(values) => {
                    debug!("{} {}: {} returned {}", T::KIND, op, name, values.len());
                    merged.extend(values.into_iter().filter(|v| seen.insert(v.id())));
                }
                Err(e) => warn!("{} {}: source {} contributed nothing: {}", T::KIND, op, name, e),
            }
        }

        merged
    }

    /// Run one source call under the caller's cancellation and the
    /// configured timeout.
    async fn guard<R>(
        &self,
        cancel: &CancellationToken,
        call: impl Future<Output = anyhow::Result<R>>,
    ) -> Result<R, SourceCallError> {
        let bounded = async {
            match self.options.source_timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result.map_err(SourceCallError::Failed),
                    Err(_) => Err(SourceCallError::TimedOut(limit)),
                },
                None => call.await.map_err(SourceCallError::Failed),
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SourceCallError::Cancelled),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::SignalDefinition;
    use crate::source::{DataChanged, InMemorySource};
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use tokio::sync::broadcast;

    /// Source that fails or hangs on every call.
    struct BrokenSource {
        hang: bool,
        changes: broadcast::Sender<DataChanged>,
    }

    impl BrokenSource {
        fn failing() -> Self {
            Self {
                hang: false,
                changes: broadcast::channel(4).0,
            }
        }

        fn hanging() -> Self {
            Self {
                hang: true,
                changes: broadcast::channel(4).0,
            }
        }

        async fn fail<R>(&self) -> Result<R> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Err(anyhow!("backend down"))
        }
    }

    #[async_trait]
    impl Source<SignalDefinition> for BrokenSource {
        fn name(&self) -> &str {
            if self.hang { "hanging" } else { "failing" }
        }

        async fn try_get_by_id(&self, _id: Uuid) -> Result<Option<SignalDefinition>> {
            self.fail().await
        }

        async fn get_by_ids(&self, _ids: &[Uuid]) -> Result<Vec<SignalDefinition>> {
            self.fail().await
        }

        async fn get_by_filter(&self, _filter: &Filter<SignalDefinition>) -> Result<Vec<SignalDefinition>> {
            self.fail().await
        }

        async fn get_first_by_filter(
            &self,
            _filter: &Filter<SignalDefinition>,
        ) -> Result<Option<SignalDefinition>> {
            self.fail().await
        }

        async fn get_all(&self) -> Result<Vec<SignalDefinition>> {
            self.fail().await
        }

        async fn force_update(&self) -> Result<()> {
            self.fail().await
        }

        fn subscribe_changes(&self) -> broadcast::Receiver<DataChanged> {
            self.changes.subscribe()
        }
    }

    fn signal(name: &str) -> SignalDefinition {
        SignalDefinition {
            uid: Uuid::new_v4(),
            name: name.to_string(),
        }
    }

    fn memory(name: &str, signals: &[SignalDefinition]) -> Arc<dyn Source<SignalDefinition>> {
        Arc::new(InMemorySource::with_definitions(name, signals.to_vec()))
    }

    fn broken(source: BrokenSource) -> Arc<dyn Source<SignalDefinition>> {
        Arc::new(source)
    }

    fn sorted_ids(values: &[SignalDefinition]) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = values.iter().map(|v| v.uid).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_get_many_unions_disjoint_sources_in_any_order() {
        let k1 = vec![signal("a1"), signal("a2")];
        let k2 = vec![signal("b1")];
        let ids: Vec<Uuid> = k1.iter().chain(&k2).map(|s| s.uid).collect();
        let cancel = CancellationToken::new();

        let ab = SourceStrategyResolver::new(vec![memory("a", &k1), memory("b", &k2)]);
        let ba = SourceStrategyResolver::new(vec![memory("b", &k2), memory("a", &k1)]);

        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(sorted_ids(&ab.get_many(&ids, &cancel).await), expected);
        assert_eq!(sorted_ids(&ba.get_many(&ids, &cancel).await), expected);
    }

    #[tokio::test]
    async fn test_first_by_id_prefers_higher_priority() {
        let a = signal("from-a");
        let mut b = a.clone();
        b.name = "from-b".to_string();
        let cancel = CancellationToken::new();

        let resolver = SourceStrategyResolver::new(vec![memory("a", &[a.clone()]), memory("b", &[b])]);
        assert_eq!(resolver.get_first_by_id(a.uid, &cancel).await, Some(a.clone()));

        // Bulk merge keeps the higher-priority copy of a shared id.
        let all = resolver.get_all(&cancel).await;
        assert_eq!(all, vec![a]);
    }

    #[tokio::test]
    async fn test_failing_source_is_skipped() {
        let a = signal("a");
        let cancel = CancellationToken::new();
        let resolver = SourceStrategyResolver::new(vec![
            broken(BrokenSource::failing()),
            memory("a", &[a.clone()]),
        ]);

        assert_eq!(resolver.get_first_by_id(a.uid, &cancel).await, Some(a.clone()));
        assert_eq!(resolver.get_many(&[a.uid], &cancel).await, vec![a.clone()]);

        let filter = Filter::predicate(|s: &SignalDefinition| s.name == "a");
        assert_eq!(resolver.get_by_filter(&filter, &cancel).await, vec![a.clone()]);
        assert_eq!(resolver.get_first_by_filter(&filter, &cancel).await, Some(a));
    }

    #[tokio::test]
    async fn test_resolution_distinguishes_unavailable() {
        let cancel = CancellationToken::new();
        let healthy = SourceStrategyResolver::new(vec![memory("a", &[])]);
        let degraded = SourceStrategyResolver::new(vec![
            memory("a", &[]),
            broken(BrokenSource::failing()),
        ]);

        let id = Uuid::new_v4();
        assert_eq!(healthy.resolve_by_id(id, &cancel).await, Resolution::NotFound);
        assert_eq!(
            degraded.resolve_by_id(id, &cancel).await,
            Resolution::Unavailable {
                failed_sources: vec!["failing".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_hanging_source_times_out() {
        let a = signal("a");
        let cancel = CancellationToken::new();
        let resolver = SourceStrategyResolver::with_options(
            vec![broken(BrokenSource::hanging()), memory("a", &[a.clone()])],
            ResolverOptions {
                source_timeout: Some(Duration::from_millis(20)),
            },
        );

        assert_eq!(resolver.get_many(&[a.uid], &cancel).await, vec![a.clone()]);
        assert_eq!(resolver.get_first_by_id(a.uid, &cancel).await, Some(a));
    }

    #[tokio::test]
    async fn test_cancellation_reaches_in_flight_calls() {
        let cancel = CancellationToken::new();
        let resolver = SourceStrategyResolver::new(vec![broken(BrokenSource::hanging())]);

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        assert!(resolver.get_many(&[Uuid::new_v4()], &cancel).await.is_empty());
        assert!(matches!(
            resolver.resolve_by_id(Uuid::new_v4(), &cancel).await,
            Resolution::Unavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_empty_id_list_short_circuits() {
        let cancel = CancellationToken::new();
        let resolver = SourceStrategyResolver::new(vec![broken(BrokenSource::hanging())]);
        assert!(resolver.get_many(&[], &cancel).await.is_empty());
    }

    #[tokio::test]
    async fn test_force_update_attempts_every_source() {
        let cancel = CancellationToken::new();
        let resolver = SourceStrategyResolver::new(vec![
            broken(BrokenSource::failing()),
            memory("a", &[]),
        ]);

        let err = resolver.force_update(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("failing"));
    }
}
