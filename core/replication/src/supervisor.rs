//! Supervisor owning the replication tasks of every collection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use wcpos_common::{CollectionName, Error, ReplicationIdentifier, Result};
use wcpos_remote::RemoteResourceClient;
use wcpos_store::LocalCollection;

use crate::audit::IdAuditReplicator;
use crate::checkpoint::RunOutcome;
use crate::config::ReplicationConfig;
use crate::connectivity::ConnectivityGate;
use crate::sync::SyncReplicator;
use crate::task::{ReplicationTask, Replicator, TaskSchedule, TaskTrigger};

/// Result of [`ReplicationSupervisor::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// At least one task was started.
    Started,
    /// Both tasks were already running.
    AlreadyRunning,
}

/// Live tasks, plus cancelled ones whose last run may still be in flight.
#[derive(Default)]
struct Registry {
    live: HashMap<ReplicationIdentifier, ReplicationTask>,
    retired: HashMap<ReplicationIdentifier, ReplicationTask>,
}

impl Registry {
    fn prune(&mut self) {
        self.live.retain(|_, task| !task.is_finished());
        self.retired.retain(|_, task| !task.is_finished());
    }

    fn retire(&mut self, id: ReplicationIdentifier, task: ReplicationTask) {
        task.cancel();
        // Any earlier retired task for `id` is owned by `task` as its predecessor.
        self.retired.insert(id, task);
    }
}

/// Runs one audit task and one sync task per collection.
///
/// Tasks are keyed by [`ReplicationIdentifier`], so a collection never has
/// two tasks of the same mode. Cancelled tasks are deregistered and must be
/// started again with [`ensure`](Self::ensure); a task started that way
/// waits until the cancelled one has exited.
pub struct ReplicationSupervisor {
    remote: Arc<dyn RemoteResourceClient>,
    config: ReplicationConfig,
    tasks: Mutex<Registry>,
    root: CancellationToken,
}

impl ReplicationSupervisor {
    /// Create a supervisor replicating from `remote`. No task runs until
    /// [`ensure`](Self::ensure).
    pub fn new(remote: Arc<dyn RemoteResourceClient>, config: ReplicationConfig) -> Self {
        Self {
            remote,
            config,
            tasks: Mutex::new(Registry::default()),
            root: CancellationToken::new(),
        }
    }

    /// Settings every task is started with.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Start replication of `collection` unless it is already running.
    ///
    /// The sync task starts first so the audit can hand it newly discovered
    /// ids right away.
    pub async fn ensure(&self, collection: Arc<dyn LocalCollection>) -> EnsureOutcome {
        let name = collection.name().clone();
        let sync_id = ReplicationIdentifier::sync(&name);
        let audit_id = ReplicationIdentifier::audit(&name);

        let mut registry = self.tasks.lock().await;
        registry.prune();

        if registry.live.contains_key(&sync_id) && registry.live.contains_key(&audit_id) {
            debug!("Replication of {} already running", name);
            return EnsureOutcome::AlreadyRunning;
        }

        let sync_trigger = match registry.live.get(&sync_id) {
            Some(task) => task.trigger(),
            None => {
                let replicator =
                    SyncReplicator::new(collection.clone(), self.remote.clone(), &self.config);
                let previous = registry.retired.remove(&sync_id);
                let task = self.spawn(Arc::new(replicator), self.config.live_interval, previous);
                let trigger = task.trigger();
                registry.live.insert(sync_id, task);
                trigger
            }
        };

        if !registry.live.contains_key(&audit_id) {
            let replicator = IdAuditReplicator::new(collection, self.remote.clone(), &self.config)
                .with_follow_up(sync_trigger);
            let previous = registry.retired.remove(&audit_id);
            let task = self.spawn(Arc::new(replicator), self.config.audit_interval, previous);
            registry.live.insert(audit_id, task);
        }

        info!("Replication of {} started", name);
        EnsureOutcome::Started
    }

    fn spawn(
        &self,
        replicator: Arc<dyn Replicator>,
        interval: Duration,
        previous: Option<ReplicationTask>,
    ) -> ReplicationTask {
        let schedule = TaskSchedule {
            interval,
            backoff: self.config.run_backoff(interval),
            trigger_queue: self.config.trigger_queue,
        };
        ReplicationTask::spawn_after(replicator, schedule, self.root.child_token(), previous)
    }

    /// Cancel and deregister every task.
    ///
    /// # Returns
    /// Number of tasks cancelled.
    pub async fn cancel_all(&self) -> usize {
        let mut registry = self.tasks.lock().await;
        let drained: Vec<_> = registry.live.drain().collect();
        let cancelled = drained.len();
        for (id, task) in drained {
            registry.retire(id, task);
        }
        if cancelled > 0 {
            info!("Cancelled {} replication tasks", cancelled);
        }
        cancelled
    }

    /// Cancel and deregister the tasks of one collection.
    ///
    /// # Returns
    /// Number of tasks cancelled.
    pub async fn dispose(&self, collection: &CollectionName) -> usize {
        let mut registry = self.tasks.lock().await;
        let mut cancelled = 0;
        for id in [
            ReplicationIdentifier::sync(collection),
            ReplicationIdentifier::audit(collection),
        ] {
            if let Some(task) = registry.live.remove(&id) {
                registry.retire(id, task);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Replication of {} disposed", collection);
        }
        cancelled
    }

    async fn trigger_for(&self, id: &ReplicationIdentifier) -> Option<TaskTrigger> {
        self.tasks.lock().await.live.get(id).map(ReplicationTask::trigger)
    }

    /// Ask the sync task of `collection` for an immediate pull.
    ///
    /// # Returns
    /// `false` if the collection is not replicating.
    pub async fn trigger_sync(&self, collection: &CollectionName) -> bool {
        match self.trigger_for(&ReplicationIdentifier::sync(collection)).await {
            Some(trigger) => trigger.run(),
            None => false,
        }
    }

    /// Ask the audit task of `collection` for an immediate pass.
    ///
    /// # Returns
    /// `false` if the collection is not replicating.
    pub async fn trigger_audit(&self, collection: &CollectionName) -> bool {
        match self.trigger_for(&ReplicationIdentifier::audit(collection)).await {
            Some(trigger) => trigger.run(),
            None => false,
        }
    }

    /// Run a pull now and wait for its outcome.
    ///
    /// # Errors
    /// - `Error::NotFound` if the collection is not replicating
    /// - Any failure of the run itself
    pub async fn run_sync_now(&self, collection: &CollectionName) -> Result<RunOutcome> {
        self.run_now(ReplicationIdentifier::sync(collection)).await
    }

    /// Run an audit pass now and wait for its outcome.
    pub async fn run_audit_now(&self, collection: &CollectionName) -> Result<RunOutcome> {
        self.run_now(ReplicationIdentifier::audit(collection)).await
    }

    async fn run_now(&self, id: ReplicationIdentifier) -> Result<RunOutcome> {
        let trigger = self
            .trigger_for(&id)
            .await
            .ok_or_else(|| Error::NotFound(format!("{} is not registered", id)))?;
        trigger.run_and_wait().await
    }

    /// Identifiers of registered tasks, sorted.
    pub async fn registered(&self) -> Vec<ReplicationIdentifier> {
        let mut ids: Vec<_> = self.tasks.lock().await.live.keys().cloned().collect();
        ids.sort_by_key(ToString::to_string);
        ids
    }

    /// Whether either task of `collection` is registered.
    pub async fn is_registered(&self, collection: &CollectionName) -> bool {
        let registry = self.tasks.lock().await;
        registry.live.contains_key(&ReplicationIdentifier::sync(collection))
            || registry.live.contains_key(&ReplicationIdentifier::audit(collection))
    }

    /// Cancel every task whenever connectivity drops.
    ///
    /// Tasks are not restarted on reconnect; callers re-run
    /// [`ensure`](Self::ensure).
    pub fn watch_connectivity(self: Arc<Self>, mut gate: ConnectivityGate) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = self.root.cancelled() => break,
                    change = gate.changed() => match change {
                        Some(false) => {
                            let cancelled = self.cancel_all().await;
                            info!("Connectivity lost; cancelled {} replication tasks", cancelled);
                        }
                        Some(true) => debug!("Connectivity restored"),
                        None => break,
                    },
                }
            }
        })
    }

    /// Cancel every task and wait for all of them to exit, including
    /// tasks cancelled earlier.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let drained: Vec<_> = {
            let mut registry = self.tasks.lock().await;
            let mut drained: Vec<_> = registry.live.drain().collect();
            drained.extend(registry.retired.drain());
            drained
        };
        for (_, task) in drained {
            task.shutdown().await;
        }
        info!("Replication supervisor shut down");
    }
}
