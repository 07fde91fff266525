//! Controller runtime primitives shared by all per-kind controllers:
//! work queues with per-key serialization, worker pools with rate-limited
//! requeue, and lease-based leader election.

pub mod leader;
pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use enclave_common::Error;

use crate::types::ObjKey;
use queue::WorkQueue;

/// Result of one successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Both sides agree; nothing more to do until the next event
    Synced,
    /// Converging; look at the key again after the given delay
    RequeueAfter(Duration),
}

/// One reconcile attempt for a single key. Implementations must be
/// idempotent: repeating a reconcile with no external change must produce
/// no observable mutation.
#[async_trait]
pub trait KeyHandler: Send + Sync {
    /// Kind name for logging
    fn kind(&self) -> &str;

    /// Bring the key to its desired state
    async fn handle(&self, key: &ObjKey) -> Result<Outcome, Error>;
}

/// Spawn `workers` tasks draining the queue through the handler.
///
/// Error policy, per reconcile:
/// - retryable errors requeue the key with exponential backoff;
/// - terminal errors (collisions) drop the key; an event has already been
///   recorded and only an operator can resolve the state;
/// - fatal errors (invariant violations) halt this kind's controller by
///   cancelling its token; other kinds keep running.
pub fn spawn_workers(
    workers: usize,
    queue: Arc<WorkQueue>,
    handler: Arc<dyn KeyHandler>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|worker| {
            let queue = queue.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker_loop(worker, queue, handler, cancel).await;
            })
        })
        .collect()
}

async fn worker_loop(
    worker: usize,
    queue: Arc<WorkQueue>,
    handler: Arc<dyn KeyHandler>,
    cancel: CancellationToken,
) {
    let kind = handler.kind().to_string();
    debug!(kind = %kind, worker, "worker started");

    while let Some(key) = queue.next(&cancel).await {
        match handler.handle(&key).await {
            Ok(Outcome::Synced) => {
                queue.done(&key);
            }
            Ok(Outcome::RequeueAfter(delay)) => {
                queue.done(&key);
                queue.clone().requeue_after(key, delay);
            }
            Err(e) if e.is_fatal() => {
                error!(
                    kind = %kind,
                    key = %key,
                    error = %e,
                    "invariant violation, halting controller for this kind"
                );
                queue.done(&key);
                cancel.cancel();
                break;
            }
            Err(e) if e.is_retryable() => {
                warn!(kind = %kind, key = %key, error = %e, "reconcile failed, requeueing");
                queue.clone().fail(key);
            }
            Err(e) => {
                // terminal for the key: surfaced as an event, operator must act
                warn!(kind = %kind, key = %key, error = %e, "reconcile failed terminally");
                queue.done(&key);
            }
        }
    }

    debug!(kind = %kind, worker, "worker stopped");
}
