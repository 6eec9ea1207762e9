//! Concurrency-bounded FIFO admission queue.
//!
//! Jobs run in the caller's task. The queue only hands out slots: a job waits
//! on a oneshot until the drain pass grants it a [`SlotGuard`], and the slot is
//! returned when that guard drops, whether the job succeeded, failed,
//! panicked or was cancelled.

use log::debug;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::error::GatewayError;

struct QueuedJob {
    seq: u64,
    id: String,
    start: oneshot::Sender<SlotGuard>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct QueueState {
    backlog: VecDeque<QueuedJob>,
    in_flight: HashMap<u64, String>,
    next_seq: u64,
    closed: bool,
}

struct QueueInner {
    max_concurrency: usize,
    state: Mutex<QueueState>,
}

/// Admission slot held by a running job
pub struct SlotGuard {
    inner: Arc<QueueInner>,
    seq: u64,
    armed: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(self.seq);
        }
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(self: &Arc<Self>, seq: u64) {
        let mut state = self.lock();
        if let Some(id) = state.in_flight.remove(&seq) {
            debug!("Job '{}' settled, {} still in flight", id, state.in_flight.len());
        }
        self.drain(&mut state);
    }

    /// Admit waiting jobs, oldest first, while capacity remains
    fn drain(self: &Arc<Self>, state: &mut QueueState) {
        while state.in_flight.len() < self.max_concurrency {
            let Some(job) = state.backlog.pop_front() else {
                break;
            };
            state.in_flight.insert(job.seq, job.id.clone());
            let guard = SlotGuard {
                inner: Arc::clone(self),
                seq: job.seq,
                armed: true,
            };
            match job.start.send(guard) {
                Ok(()) => debug!(
                    "Dispatched job '{}' after {:?} in queue ({} in flight)",
                    job.id,
                    job.enqueued_at.elapsed(),
                    state.in_flight.len()
                ),
                Err(mut guard) => {
                    // Waiter is gone; reclaim the slot without re-entering the lock
                    guard.armed = false;
                    state.in_flight.remove(&job.seq);
                }
            }
        }
    }

    fn withdraw(&self, seq: u64) {
        let mut state = self.lock();
        state.backlog.retain(|job| job.seq != seq);
    }
}

/// Admits at most `max_concurrency` jobs at once; the rest wait in arrival order
pub struct ConcurrencyQueue {
    inner: Arc<QueueInner>,
}

impl ConcurrencyQueue {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_concurrency: max_concurrency.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Jobs waiting for a slot
    pub fn backlog_len(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    /// Jobs currently holding a slot
    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// `(backlog_len, in_flight_len)` read under one lock
    pub fn occupancy(&self) -> (usize, usize) {
        let state = self.inner.lock();
        (state.backlog.len(), state.in_flight.len())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Refuse new jobs and fail every job still waiting with `Shutdown`.
    /// Running jobs keep their slots until they settle.
    pub fn close(&self) {
        let abandoned: Vec<QueuedJob> = {
            let mut state = self.inner.lock();
            state.closed = true;
            state.backlog.drain(..).collect()
        };
        if !abandoned.is_empty() {
            debug!("Queue closed with {} job(s) still waiting", abandoned.len());
        }
    }

    /// Run `job` once a slot is free.
    ///
    /// Never rejects for lack of capacity. Cancelling `cancel` withdraws a
    /// waiting job or abandons a running one, freeing its slot either way.
    pub async fn enqueue<R, Fut>(
        &self,
        id: Option<String>,
        cancel: &CancellationToken,
        job: Fut,
    ) -> Result<R, GatewayError>
    where
        Fut: Future<Output = Result<R, GatewayError>>,
    {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let (tx, rx) = oneshot::channel();

        let seq = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(GatewayError::Shutdown);
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.backlog.push_back(QueuedJob {
                seq,
                id: id.clone(),
                start: tx,
                enqueued_at: Instant::now(),
            });
            self.inner.drain(&mut state);
            seq
        };

        let slot = tokio::select! {
            biased;
            slot = rx => slot,
            _ = cancel.cancelled() => {
                self.inner.withdraw(seq);
                return Err(GatewayError::Cancelled { operation: id });
            }
        };
        let _slot = match slot {
            Ok(guard) => guard,
            Err(_) => return Err(GatewayError::Shutdown),
        };
        if cancel.is_cancelled() {
            return Err(GatewayError::Cancelled { operation: id });
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GatewayError::Cancelled { operation: id }),
            result = job => result,
        }
    }
}
