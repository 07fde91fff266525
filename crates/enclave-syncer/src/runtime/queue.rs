//! Per-kind work queue.
//!
//! Guarantees per-key serialization: a key handed to one worker is never
//! handed to another until the first marks it done. Events arriving for an
//! in-flight key mark it dirty, and it re-enqueues on completion, so no
//! observation is lost while still collapsing bursts to one reconcile.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use enclave_common::retry::RequeueBackoff;

use crate::types::ObjKey;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ObjKey>,
    queued: HashSet<ObjKey>,
    active: HashSet<ObjKey>,
    dirty: HashSet<ObjKey>,
}

/// Deduplicating, per-key-serialized work queue.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: RequeueBackoff,
    failures: DashMap<ObjKey, u32>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff: RequeueBackoff::default(),
            failures: DashMap::new(),
        }
    }

    /// A queue with a custom backoff base delay (used by tests to keep
    /// retries fast)
    pub fn with_base_delay(base: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff: RequeueBackoff::new(base, Duration::from_secs(300)),
            failures: DashMap::new(),
        }
    }

    /// Add a key. Re-enqueuing an already-queued key is a no-op; enqueuing
    /// an in-flight key marks it dirty so it runs once more afterwards.
    pub fn enqueue(&self, key: ObjKey) {
        let mut state = self.state.lock();
        if state.active.contains(&key) {
            trace!(key = %key, "key in flight, marking dirty");
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wait for the next key; `None` once cancelled.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<ObjKey> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.active.insert(key.clone());
                    return Some(key);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }

    /// Mark a key's reconcile complete. Clears its failure count and
    /// re-enqueues it if events arrived while it was in flight.
    pub fn done(&self, key: &ObjKey) {
        self.failures.remove(key);
        let requeue = {
            let mut state = self.state.lock();
            state.active.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.enqueue(key.clone());
        }
    }

    /// Mark a key's reconcile failed: releases it and schedules a retry
    /// after the backoff for its consecutive failure count.
    pub fn fail(self: Arc<Self>, key: ObjKey) {
        let failures = {
            let mut entry = self.failures.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        {
            let mut state = self.state.lock();
            state.active.remove(&key);
            state.dirty.remove(&key);
        }
        let delay = self.backoff.delay(failures);
        trace!(key = %key, failures, delay_ms = delay.as_millis(), "scheduling retry");
        self.requeue_after(key, delay);
    }

    /// Enqueue a key after a delay
    pub fn requeue_after(self: Arc<Self>, key: ObjKey, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.enqueue(key);
        });
    }

    /// Number of keys waiting (excludes in-flight keys)
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
