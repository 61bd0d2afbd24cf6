//! Durable work queue with leases, priorities and delayed visibility.
//!
//! Items live in a [`LeaseStore`]. A claim marks the best visible item as
//! running and stamps a lease; a worker that stops renewing loses the item
//! to the next claimer once the lease runs out.

mod heartbeat;
mod item;
mod record;
mod store;
mod work_queue;
mod worker;

pub use heartbeat::HeartbeatGuard;
pub use item::{claim_order, ClaimCriteria, CountFilter, EnqueueOptions, QueueItem, RenewOutcome, RequeueUpdate, SettleOutcome};
pub use record::{TerminalKind, TerminalRecord};
pub use store::{InMemoryLeaseStore, LeaseStore};
pub use work_queue::WorkQueue;
pub use worker::{ItemOutcome, JobContext, QueueHandler, QueueWorker, QueueWorkerPool, WorkerState};
