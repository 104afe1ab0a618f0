//! Replication task loop: periodic and manual runs of one replicator.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wcpos_common::{Error, ReplicationIdentifier, ReplicationMode, Result};
use wcpos_store::LocalCollection;

use crate::checkpoint::{ReplicationCheckpoint, RunOutcome};
use crate::retry::RetryConfig;

/// One kind of replication pass over a collection.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Identifier of the task running this replicator.
    fn identifier(&self) -> &ReplicationIdentifier;

    /// Collection the replicator writes to.
    fn collection(&self) -> &Arc<dyn LocalCollection>;

    /// Perform a single pass.
    ///
    /// Must not issue requests or mutate the collection once `cancel` has
    /// fired, and returns [`RunOutcome::Discarded`] when it stopped for that
    /// reason.
    async fn run_once(&self, cancel: &CancellationToken) -> Result<RunOutcome>;
}

type RunReply = std::result::Result<RunOutcome, String>;
type Waiter = oneshot::Sender<RunReply>;

/// Cloneable handle that asks a task for a manual run.
#[derive(Clone)]
pub struct TaskTrigger {
    identifier: ReplicationIdentifier,
    tx: mpsc::Sender<Option<Waiter>>,
}

impl TaskTrigger {
    /// Identifier of the task this trigger belongs to.
    pub fn identifier(&self) -> &ReplicationIdentifier {
        &self.identifier
    }

    /// Request a run without waiting for it.
    ///
    /// A full queue means runs are already pending; the request coalesces
    /// into them.
    ///
    /// # Returns
    /// `false` if the task has stopped.
    pub fn run(&self) -> bool {
        match self.tx.try_send(None) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Request a run and wait for its outcome.
    ///
    /// # Errors
    /// - `Error::Cancelled` if the task stopped before the run finished
    /// - `Error::Replication` if the run failed
    pub async fn run_and_wait(&self) -> Result<RunOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Some(reply_tx))
            .await
            .map_err(|_| Error::Cancelled(format!("{} is not running", self.identifier)))?;

        match reply_rx.await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(message)) => Err(Error::Replication(message)),
            Err(_) => Err(Error::Cancelled(format!(
                "{} stopped before the run finished",
                self.identifier
            ))),
        }
    }
}

/// Timing of a task's scheduled runs.
#[derive(Debug, Clone)]
pub struct TaskSchedule {
    /// Interval between scheduled runs while they succeed.
    pub interval: Duration,
    /// Delays after consecutive failed runs, capped at `interval`.
    pub backoff: RetryConfig,
    /// Manual triggers buffered while a run is in flight.
    pub trigger_queue: usize,
}

impl TaskSchedule {
    fn delay_after(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            self.interval
        } else {
            self.backoff
                .delay_for_attempt(consecutive_failures - 1)
                .min(self.interval)
        }
    }
}

enum Wake {
    Scheduled,
    Manual(Vec<Waiter>),
}

/// A running replication task.
///
/// The first run starts immediately. After that, runs happen when the
/// deadline expires or when a trigger arrives; both kinds are strictly
/// sequential. Manual runs never move the deadline.
pub struct ReplicationTask {
    identifier: ReplicationIdentifier,
    interval: Duration,
    trigger: TaskTrigger,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ReplicationTask {
    /// Spawn the task loop for `replicator`.
    pub fn spawn(
        replicator: Arc<dyn Replicator>,
        schedule: TaskSchedule,
        cancel: CancellationToken,
    ) -> Self {
        Self::spawn_after(replicator, schedule, cancel, None)
    }

    /// Spawn the task loop for `replicator` once `predecessor` has exited.
    ///
    /// `predecessor` is a cancelled task for the same identifier whose last
    /// run may still be in flight. Triggers sent in the meantime are queued.
    pub fn spawn_after(
        replicator: Arc<dyn Replicator>,
        schedule: TaskSchedule,
        cancel: CancellationToken,
        predecessor: Option<ReplicationTask>,
    ) -> Self {
        let identifier = replicator.identifier().clone();
        let (tx, rx) = mpsc::channel(schedule.trigger_queue.max(1));
        let trigger = TaskTrigger {
            identifier: identifier.clone(),
            tx,
        };
        let interval = schedule.interval;
        let loop_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            if let Some(predecessor) = predecessor {
                debug!(replication = %predecessor.identifier, "Waiting for previous task to exit");
                predecessor.shutdown().await;
            }
            drive(replicator, schedule, rx, loop_cancel).await;
        });

        Self {
            identifier,
            interval,
            trigger,
            cancel,
            join,
        }
    }

    /// Identifier of the task.
    pub fn identifier(&self) -> &ReplicationIdentifier {
        &self.identifier
    }

    /// Audit or sync.
    pub fn mode(&self) -> ReplicationMode {
        self.identifier.mode()
    }

    /// Interval between scheduled runs.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Handle for manual runs.
    pub fn trigger(&self) -> TaskTrigger {
        self.trigger.clone()
    }

    /// Request a manual run. See [`TaskTrigger::run`].
    pub fn run(&self) -> bool {
        self.trigger.run()
    }

    /// Request a manual run and wait for it. See [`TaskTrigger::run_and_wait`].
    pub async fn run_and_wait(&self) -> Result<RunOutcome> {
        self.trigger.run_and_wait().await
    }

    /// Stop the task. A run in flight finishes, but its result is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Whether the task loop has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel the task and wait for its loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!(replication = %self.identifier, "Replication task panicked: {}", e);
        }
    }
}

async fn drive(
    replicator: Arc<dyn Replicator>,
    schedule: TaskSchedule,
    mut rx: mpsc::Receiver<Option<Waiter>>,
    cancel: CancellationToken,
) {
    let identifier = replicator.identifier().clone();
    let collection = replicator.collection().clone();

    let mut checkpoint = match ReplicationCheckpoint::load(collection.as_ref(), &identifier).await {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            warn!(replication = %identifier, "Failed to load checkpoint: {}", e);
            ReplicationCheckpoint::default()
        }
    };
    let mut next_tick = Instant::now();

    info!(replication = %identifier, "Replication task started");

    loop {
        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = sleep_until(next_tick) => Wake::Scheduled,
            request = rx.recv() => match request {
                None => break,
                Some(first) => {
                    let mut waiters: Vec<Waiter> = first.into_iter().collect();
                    while let Ok(more) = rx.try_recv() {
                        waiters.extend(more);
                    }
                    Wake::Manual(waiters)
                }
            },
        };

        let scheduled = matches!(wake, Wake::Scheduled);
        let run_id = checkpoint.mark_started();
        debug!(replication = %identifier, %run_id, scheduled, "Replication run starting");

        let result = replicator.run_once(&cancel).await;

        let reply: RunReply = match &result {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(e.to_string()),
        };

        if cancel.is_cancelled() || matches!(result, Ok(RunOutcome::Discarded)) {
            debug!(replication = %identifier, "Discarding result of cancelled run");
        } else {
            match result {
                Ok(outcome) => {
                    debug!(replication = %identifier, %run_id, ?outcome, "Replication run finished");
                    checkpoint.mark_succeeded(outcome);
                }
                Err(e) => {
                    warn!(replication = %identifier, %run_id, "Replication run failed: {}", e);
                    checkpoint.mark_failed(e.to_string());
                }
            }

            if let Err(e) = checkpoint.store(collection.as_ref(), &identifier).await {
                warn!(replication = %identifier, "Failed to store checkpoint: {}", e);
            }

            if scheduled {
                let delay = schedule.delay_after(checkpoint.consecutive_failures);
                if checkpoint.consecutive_failures > 0 {
                    debug!(replication = %identifier, ?delay, "Retrying after failure");
                }
                next_tick = Instant::now() + delay;
            }
        }

        if let Wake::Manual(waiters) = wake {
            for waiter in waiters {
                let _ = waiter.send(reply.clone());
            }
        }
    }

    info!(replication = %identifier, "Replication task stopped");
}
