//! Per-model admission queue.
//!
//! When a ModelServer configures admission control, requests beyond the
//! concurrency bound wait here, ordered by `(priority, arrival)`. A slot
//! freed by a finishing request is handed to the best waiter. Cancelled
//! waiters remove their entry by key, so abandonment costs O(log n).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::errors::GatewayError;

#[derive(Debug)]
pub struct AdmissionQueue {
    model: String,
    max_concurrent: usize,
    queue_depth: usize,
    inner: Mutex<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    running: usize,
    next_arrival: u64,
    waiting: BTreeMap<(i32, u64), oneshot::Sender<AdmissionPermit>>,
}

/// A held concurrency slot; dropping it admits the best waiting request.
#[derive(Debug)]
pub struct AdmissionPermit {
    queue: Arc<AdmissionQueue>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.queue.clone().release_slot();
    }
}

impl AdmissionQueue {
    pub fn new(model: &str, max_concurrent: usize, queue_depth: usize) -> Arc<Self> {
        Arc::new(Self {
            model: model.to_string(),
            max_concurrent: max_concurrent.max(1),
            queue_depth,
            inner: Mutex::new(QueueInner {
                running: 0,
                next_arrival: 0,
                waiting: BTreeMap::new(),
            }),
        })
    }

    /// Acquire a slot, waiting in priority order when the model is at its
    /// concurrency bound. Lower priority values are served first.
    ///
    /// With `queue_depth == 0`, over-limit requests fail fast.
    pub async fn acquire(self: &Arc<Self>, priority: i32) -> Result<AdmissionPermit, GatewayError> {
        let (key, rx) = {
            let mut inner = self.inner.lock();
            if inner.running < self.max_concurrent {
                inner.running += 1;
                return Ok(AdmissionPermit {
                    queue: self.clone(),
                });
            }
            if inner.waiting.len() >= self.queue_depth {
                return Err(GatewayError::QueueFull(self.model.clone()));
            }
            let key = (priority, inner.next_arrival);
            inner.next_arrival += 1;
            let (tx, rx) = oneshot::channel();
            inner.waiting.insert(key, tx);
            (key, rx)
        };

        let guard = DequeueOnCancel {
            queue: self,
            key,
            armed: true,
        };
        let result = rx.await;
        let _ = guard.disarm();
        result.map_err(|_| GatewayError::Scheduling(format!("admission queue for {} closed", self.model)))
    }

    pub fn waiting(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    fn release_slot(self: Arc<Self>) {
        let tx = {
            let mut inner = self.inner.lock();
            inner.running -= 1;
            match inner.waiting.pop_first() {
                Some((_key, tx)) => {
                    // The slot transfers to the waiter.
                    inner.running += 1;
                    Some(tx)
                }
                None => None,
            }
        };
        if let Some(tx) = tx {
            let permit = AdmissionPermit {
                queue: self.clone(),
            };
            // A cancelled waiter bounces the permit back; dropping it frees
            // the slot again and promotes the next waiter.
            let _ = tx.send(permit);
        }
    }
}

/// Removes an abandoned waiter's queue entry on cancellation.
struct DequeueOnCancel<'a> {
    queue: &'a Arc<AdmissionQueue>,
    key: (i32, u64),
    armed: bool,
}

impl DequeueOnCancel<'_> {
    fn disarm(mut self) -> bool {
        self.armed = false;
        true
    }
}

impl Drop for DequeueOnCancel<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.inner.lock().waiting.remove(&self.key);
        }
    }
}

/* ============================= TESTS ============================= */
