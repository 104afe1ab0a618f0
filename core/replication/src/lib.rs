//! WCPOS replication engine
//!
//! Keeps local collections consistent with a paginated REST backend:
//! - An id audit that finds documents created or deleted remotely
//! - A sync pass that pulls outstanding documents in bounded batches
//! - A supervisor running one task of each kind per collection
//! - Cancellation on connectivity loss
//! - Per-task checkpoints in the collection's local metadata area

pub mod audit;
pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod connectivity;
pub mod normalize;
pub mod retry;
pub mod supervisor;
pub mod sync;
pub mod task;

// Re-export main types
pub use audit::IdAuditReplicator;
pub use batch::{PullBatch, MAX_BATCH_SIZE};
pub use checkpoint::{ReplicationCheckpoint, RunOutcome};
pub use config::{ReplicationConfig, MIN_RETRY_DELAY};
pub use connectivity::{ConnectivityGate, ConnectivitySignal, ReachabilityProbe};
pub use normalize::{normalize_document, pull_timestamp};
pub use retry::{RetryConfig, RetryExecutor};
pub use supervisor::{EnsureOutcome, ReplicationSupervisor};
pub use sync::SyncReplicator;
pub use task::{ReplicationTask, Replicator, TaskSchedule, TaskTrigger};
