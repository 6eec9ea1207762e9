//! Short-window deduplication of identical calls.
//!
//! Calls are keyed by model and the first [`PROMPT_PREFIX_CHARS`] characters
//! of the prompt, not by the full payload: two long prompts sharing a prefix
//! coalesce even if they differ further on.

use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, warn};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::core::error::GatewayError;

/// Characters of the prompt that take part in the coalescing key
pub const PROMPT_PREFIX_CHARS: usize = 100;

/// Outcome shared by every caller attached to one execution
pub type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, GatewayError>>>;

type Entries<T> = Mutex<HashMap<String, CoalesceEntry<T>>>;

struct CoalesceEntry<T> {
    id: u64,
    outcome: SharedOutcome<T>,
    created_at: Instant,
}

/// Coalescing cache of in-progress and recently settled executions
pub struct Coalescer<T> {
    window: Duration,
    entries: Arc<Entries<T>>,
    next_id: AtomicU64,
}

impl<T> Coalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Cache key for a call
    pub fn key(model: &str, prompt: &str) -> String {
        let prefix: String = prompt.chars().take(PROMPT_PREFIX_CHARS).collect();
        format!("{}|{}", model, prefix)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CoalesceEntry<T>>> {
        lock_entries(&self.entries)
    }

    /// Return the live outcome for this key, or start `start()` and register it.
    ///
    /// Registration happens before the new execution is first polled, so a
    /// concurrent caller with the same key always finds it. An entry is live
    /// while its age is strictly below the window.
    ///
    /// If the execution panics, its entry is evicted and later callers start
    /// afresh; callers already attached to it panic as well.
    pub fn join_or_start<F>(&self, model: &str, prompt: &str, label: &str, start: F) -> SharedOutcome<T>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, GatewayError>>,
    {
        let key = Self::key(model, prompt);
        let now = Instant::now();
        let mut entries = self.lock();

        let stale_after = self.window * 2;
        entries.retain(|_, e| now.duration_since(e.created_at) <= stale_after);

        if let Some(entry) = entries.get(&key) {
            if now.duration_since(entry.created_at) < self.window {
                debug!(
                    "Coalescing '{}' with an execution started {:?} ago",
                    label,
                    now.duration_since(entry.created_at)
                );
                return entry.outcome.clone();
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let execution = start();
        let owner: Weak<Entries<T>> = Arc::downgrade(&self.entries);
        let evict_key = key.clone();
        let outcome = async move {
            match AssertUnwindSafe(execution).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    warn!("Coalesced execution for '{}' panicked, evicting it", evict_key);
                    if let Some(owner) = owner.upgrade() {
                        let mut entries = lock_entries(&owner);
                        if entries.get(&evict_key).is_some_and(|e| e.id == id) {
                            entries.remove(&evict_key);
                        }
                    }
                    std::panic::resume_unwind(payload)
                }
            }
        }
        .boxed()
        .shared();

        entries.insert(
            key,
            CoalesceEntry {
                id,
                outcome: outcome.clone(),
                created_at: now,
            },
        );
        outcome
    }

    /// Run `start()` unless an identical call is live, and await the outcome
    pub async fn execute<F>(&self, model: &str, prompt: &str, label: &str, start: F) -> Result<T, GatewayError>
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, GatewayError>>,
    {
        self.join_or_start(model, prompt, label, start).await
    }

    /// Number of cached entries, live or not yet purged
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock_entries<T>(entries: &Entries<T>) -> MutexGuard<'_, HashMap<String, CoalesceEntry<T>>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}
