use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::{AdminError, AdministrationRegistry};
use crate::redirection::{RedirectionRule, RedirectionSnapshot};
use crate::subscription::DeliveryTarget;
use crate::types::{IdentityCard, RegistryVersion};

type Reply<T> = oneshot::Sender<Result<T, AdminError>>;

#[derive(Debug)]
enum AdminCommand {
    Append {
        rules: Vec<RedirectionRule>,
        identity: IdentityCard,
        reply: Reply<bool>,
    },
    Pop {
        ids: Vec<Uuid>,
        identity: IdentityCard,
        reply: Reply<bool>,
    },
    Subscribe {
        target: DeliveryTarget,
        reply: Reply<Uuid>,
    },
    Unsubscribe {
        id: Uuid,
        reply: Reply<bool>,
    },
}

impl AdministrationRegistry {
    /// Move the registry into a worker task that applies commands one at a
    /// time, in arrival order.
    ///
    /// The worker stops when `shutdown` fires or every handle is dropped.
    pub fn spawn(
        self,
        command_buffer: usize,
        shutdown: CancellationToken,
    ) -> (AdministrationHandle, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(command_buffer.max(1));
        let handle = AdministrationHandle {
            commands,
            snapshots: self.watch_snapshots(),
        };

        let worker = tokio::spawn(self.run(receiver, shutdown));
        (handle, worker)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<AdminCommand>, shutdown: CancellationToken) {
        info!("Administration worker for {} started", self.instance());

        loop {
            let command = tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            // A command runs to completion once dequeued. A caller that gave
            // up waiting simply never reads the reply.
            match command {
                AdminCommand::Append { rules, identity, reply } => {
                    let result = self.request_append(rules, &identity, &shutdown).await;
                    let _ = reply.send(result);
                }
                AdminCommand::Pop { ids, identity, reply } => {
                    let result = self.request_pop(ids, &identity, &shutdown).await;
                    let _ = reply.send(result);
                }
                AdminCommand::Subscribe { target, reply } => {
                    let _ = reply.send(self.subscribe_route_change(target).await);
                }
                AdminCommand::Unsubscribe { id, reply } => {
                    let _ = reply.send(self.unsubscribe(id).await);
                }
            }
        }

        info!("Administration worker for {} stopped", self.instance());
    }
}

/// Cloneable front door to a spawned [`AdministrationRegistry`].
///
/// Mutations queue behind each other. Snapshot reads never queue: they are
/// answered from the last committed snapshot, so a subscriber may read the
/// registry while it is being notified.
#[derive(Clone)]
pub struct AdministrationHandle {
    commands: mpsc::Sender<AdminCommand>,
    snapshots: watch::Receiver<RedirectionSnapshot>,
}

impl AdministrationHandle {
    /// The current rules, or `None` when `caller_version` is current.
    pub fn get_snapshot(
        &self,
        caller_version: Option<&RegistryVersion>,
        cancel: &CancellationToken,
    ) -> Result<Option<RedirectionSnapshot>, AdminError> {
        if cancel.is_cancelled() {
            return Err(AdminError::Cancelled);
        }

        let current = self.snapshots.borrow();
        if caller_version == Some(&current.version) {
            return Ok(None);
        }
        Ok(Some(current.clone()))
    }

    /// Wait until the committed version differs from `caller_version`.
    pub async fn wait_for_change(
        &self,
        caller_version: &RegistryVersion,
        cancel: &CancellationToken,
    ) -> Result<RedirectionSnapshot, AdminError> {
        let mut snapshots = self.snapshots.clone();

        tokio::select! {
            _ = cancel.cancelled() => Err(AdminError::Cancelled),
            changed = snapshots.wait_for(|s| &s.version != caller_version) => {
                changed
                    .map(|s| s.clone())
                    .map_err(|_| AdminError::WorkerStopped)
            }
        }
    }

    pub async fn request_append_one(
        &self,
        rule: RedirectionRule,
        identity: IdentityCard,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        self.request_append(vec![rule], identity, cancel).await
    }

    pub async fn request_append(
        &self,
        rules: Vec<RedirectionRule>,
        identity: IdentityCard,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        self.request(cancel, |reply| AdminCommand::Append {
            rules,
            identity,
            reply,
        })
        .await
    }

    pub async fn request_pop_one(
        &self,
        id: Uuid,
        identity: IdentityCard,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        self.request_pop(vec![id], identity, cancel).await
    }

    pub async fn request_pop(
        &self,
        ids: Vec<Uuid>,
        identity: IdentityCard,
        cancel: &CancellationToken,
    ) -> Result<bool, AdminError> {
        self.request(cancel, |reply| AdminCommand::Pop {
            ids,
            identity,
            reply,
        })
        .await
    }

    pub async fn subscribe_route_change(
        &self,
        target: DeliveryTarget,
        cancel: &CancellationToken,
    ) -> Result<Uuid, AdminError> {
        self.request(cancel, |reply| AdminCommand::Subscribe { target, reply })
            .await
    }

    pub async fn unsubscribe(&self, id: Uuid, cancel: &CancellationToken) -> Result<bool, AdminError> {
        self.request(cancel, |reply| AdminCommand::Unsubscribe { id, reply })
            .await
    }

    async fn request<T>(
        &self,
        cancel: &CancellationToken,
        command: impl FnOnce(Reply<T>) -> AdminCommand,
    ) -> Result<T, AdminError> {
        let (reply, response) = oneshot::channel();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdminError::Cancelled),
            sent = self.commands.send(command(reply)) => {
                sent.map_err(|_| AdminError::WorkerStopped)?;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Caller stopped waiting for an administration reply");
                Err(AdminError::Cancelled)
            }
            outcome = response => outcome.map_err(|_| AdminError::WorkerStopped)?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::MemoryAdminStateStore;
    use crate::redirection::RedirectionTarget;
    use crate::subscription::{AdminEvent, AdminEventReceiver, ReceiverDirectory};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    /// Reads the registry back through the handle while being notified.
    struct SnapshotReader {
        handle: Mutex<Option<AdministrationHandle>>,
        seen: Mutex<Vec<(RegistryVersion, usize)>>,
    }

    #[async_trait]
    impl AdminEventReceiver for SnapshotReader {
        async fn receive(&self, event: AdminEvent, cancel: CancellationToken) -> anyhow::Result<()> {
            let handle = self.handle.lock().clone();
            if let Some(handle) = handle {
                let snapshot = handle.get_snapshot(None, &cancel)?.unwrap();
                assert_eq!(snapshot.version, event.version);
                self.seen.lock().push((event.version, snapshot.rules.len()));
            }
            Ok(())
        }
    }

    fn rule(source: &str, target: &str) -> RedirectionRule {
        RedirectionRule::new(source, RedirectionTarget::OtherCapability(target.into()))
    }

    async fn spawn_registry(
        directory: Arc<ReceiverDirectory>,
    ) -> (AdministrationHandle, CancellationToken, JoinHandle<()>) {
        let registry = AdministrationRegistry::load(
            "main",
            Arc::new(MemoryAdminStateStore::new()),
            directory,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        let shutdown = CancellationToken::new();
        let (handle, worker) = registry.spawn(16, shutdown.clone());
        (handle, shutdown, worker)
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let (handle, shutdown, worker) = spawn_registry(Arc::new(ReceiverDirectory::new())).await;
        let cancel = CancellationToken::new();

        let initial = handle.get_snapshot(None, &cancel).unwrap().unwrap();
        assert!(initial.rules.is_empty());
        assert!(handle.get_snapshot(Some(&initial.version), &cancel).unwrap().is_none());

        let r = rule("a", "b");
        assert!(handle
            .request_append_one(r.clone(), IdentityCard::anonymous(), &cancel)
            .await
            .unwrap());
        assert!(!handle
            .request_append_one(r.clone(), IdentityCard::anonymous(), &cancel)
            .await
            .unwrap());

        let after = handle.get_snapshot(Some(&initial.version), &cancel).unwrap().unwrap();
        assert_ne!(after.version, initial.version);
        assert_eq!(after.rules, vec![r.clone()]);

        assert!(handle
            .request_pop(vec![r.id], IdentityCard::anonymous(), &cancel)
            .await
            .unwrap());

        shutdown.cancel();
        worker.await.unwrap();
        assert!(matches!(
            handle.request_pop_one(r.id, IdentityCard::anonymous(), &cancel).await,
            Err(AdminError::WorkerStopped)
        ));
    }

    #[tokio::test]
    async fn test_receiver_can_read_registry_during_notify() {
        let directory = Arc::new(ReceiverDirectory::new());
        let reader = Arc::new(SnapshotReader {
            handle: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        });
        directory.register(DeliveryTarget::service("reader"), reader.clone());

        let (handle, _shutdown, _worker) = spawn_registry(directory).await;
        *reader.handle.lock() = Some(handle.clone());
        let cancel = CancellationToken::new();

        handle
            .subscribe_route_change(DeliveryTarget::service("reader"), &cancel)
            .await
            .unwrap();
        handle
            .request_append(vec![rule("a", "b"), rule("c", "d")], IdentityCard::anonymous(), &cancel)
            .await
            .unwrap();

        let seen = reader.seen.lock().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, 2);
    }

    #[tokio::test]
    async fn test_wait_for_change() {
        let (handle, _shutdown, _worker) = spawn_registry(Arc::new(ReceiverDirectory::new())).await;
        let cancel = CancellationToken::new();
        let initial = handle.get_snapshot(None, &cancel).unwrap().unwrap();

        let waiter = {
            let handle = handle.clone();
            let version = initial.version.clone();
            tokio::spawn(async move {
                handle
                    .wait_for_change(&version, &CancellationToken::new())
                    .await
            })
        };

        handle
            .request_append_one(rule("a", "b"), IdentityCard::anonymous(), &cancel)
            .await
            .unwrap();

        let changed = waiter.await.unwrap().unwrap();
        assert_ne!(changed.version, initial.version);
        assert_eq!(changed.rules.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_caller_gets_cancelled() {
        let (handle, _shutdown, _worker) = spawn_registry(Arc::new(ReceiverDirectory::new())).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(matches!(
            handle.get_snapshot(None, &cancel),
            Err(AdminError::Cancelled)
        ));
        assert!(matches!(
            handle
                .subscribe_route_change(DeliveryTarget::service("x"), &cancel)
                .await,
            Err(AdminError::Cancelled)
        ));
    }
}
