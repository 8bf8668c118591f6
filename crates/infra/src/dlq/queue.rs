//! Bounded dead letter queue with timer-driven retries.
//!
//! Every pending entry with attempts left owns one armed timer. When a timer
//! fires it spawns the retry attempt as a separate task, so cancelling timers
//! (resolve, fail, purge, clear) never interrupts a handler call already in
//! flight. A direct `attempt_retry` runs the handler call and the state
//! update in a task of its own as well and only awaits it, so a caller that
//! gives up early never leaves an entry stuck in `retrying`. Each arming
//! gets a fresh generation number; an attempt started by a timer that has
//! since been replaced is dropped.
//!
//! The state mutex is never held across an `.await`, and observers run after
//! it is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tradeflow_core::{CoordinationError, DataMap, EntryId};

use crate::config::{ConfigError, DlqConfig};

use super::backoff::BackoffPolicy;
use super::handler::RetryHandler;
use super::observer::DlqObserver;
use super::store::EntryStore;
use super::types::{DeadLetterEntry, DlqStats, DlqStatus, NewDeadLetter};

const HANDLER_DECLINED: &str = "retry handler reported failure";
const EVICTED: &str = "evicted: dead letter queue at capacity";

struct ArmedTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    store: EntryStore,
    timers: HashMap<EntryId, ArmedTimer>,
    next_generation: u64,
}

impl QueueState {
    fn cancel_timer(&mut self, id: EntryId) {
        if let Some(timer) = self.timers.remove(&id) {
            timer.handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }
}

struct Inner {
    config: DlqConfig,
    policy: BackoffPolicy,
    runtime: Option<Handle>,
    state: Mutex<QueueState>,
    handler: RwLock<Option<Arc<dyn RetryHandler>>>,
    observers: RwLock<Vec<Arc<dyn DlqObserver>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel_all();
    }
}

/// Dead letter queue handle. Clones share the same queue.
#[derive(Clone)]
pub struct DeadLetterQueue {
    inner: Arc<Inner>,
}

impl fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("config", &self.inner.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for DeadLetterQueue {
    fn default() -> Self {
        Self::new(DlqConfig::default())
    }
}

impl DeadLetterQueue {
    /// Create a queue. Timers run on the ambient Tokio runtime of whoever
    /// arms them, falling back to the runtime current at construction.
    ///
    /// An invalid config is used as given, with a warning: a zero capacity
    /// behaves as one and a zero attempt budget fails entries on arrival.
    /// Use [`DeadLetterQueue::try_new`] to reject it instead.
    pub fn new(config: DlqConfig) -> Self {
        if let Err(err) = config.validate() {
            warn!(error = %err, "dead letter queue created with invalid config");
        }
        let policy = config.backoff_policy();
        Self {
            inner: Arc::new(Inner {
                config,
                policy,
                runtime: Handle::try_current().ok(),
                state: Mutex::new(QueueState::default()),
                handler: RwLock::new(None),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn try_new(config: DlqConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &DlqConfig {
        &self.inner.config
    }

    /// Replace the retry handler.
    ///
    /// Timers that fire while no handler is registered park their entry
    /// without spending an attempt. Setting a handler re-arms every parked
    /// entry for its recorded `next_retry_at` (immediately if already due).
    pub fn set_retry_handler(&self, handler: Arc<dyn RetryHandler>) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);

        let now = Utc::now();
        let mut state = self.state();
        let parked: Vec<(EntryId, Duration)> = state
            .store
            .collect(|e| e.status == DlqStatus::Pending && e.next_retry_at.is_some())
            .into_iter()
            .filter(|e| !state.timers.contains_key(&e.id))
            .map(|e| {
                let due = e.next_retry_at.unwrap_or(now);
                (e.id, (due - now).to_std().unwrap_or(Duration::ZERO))
            })
            .collect();
        for (id, delay) in parked {
            self.arm_timer(&mut state, id, delay);
        }
    }

    fn handler(&self) -> Option<Arc<dyn RetryHandler>> {
        self.inner
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn add_observer(&self, observer: Arc<dyn DlqObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Dead-letter one event.
    pub fn add(
        &self,
        subject: impl Into<String>,
        payload: serde_json::Value,
        error: impl Into<String>,
        metadata: DataMap,
    ) -> DeadLetterEntry {
        self.add_entry(NewDeadLetter::new(subject, payload, error).with_metadata(metadata))
    }

    /// Dead-letter one event with its full description (stack included).
    ///
    /// At capacity, the oldest pending entry is marked failed and removed
    /// first; the queue never grows past `max_queue_size`.
    pub fn add_entry(&self, dead_letter: NewDeadLetter) -> DeadLetterEntry {
        let now = Utc::now();
        let entry = DeadLetterEntry::new(
            dead_letter,
            self.inner.config.max_attempts,
            &self.inner.policy,
            now,
        );
        let snapshot = entry.clone();
        let capacity = self.inner.config.max_queue_size.max(1);

        let evicted = {
            let mut state = self.state();
            let mut evicted = Vec::new();
            while state.store.len() >= capacity {
                let Some(victim) = state.store.eviction_candidate() else {
                    break;
                };
                state.cancel_timer(victim);
                if let Some(mut gone) = state.store.remove(victim) {
                    if !gone.status.is_terminal() {
                        gone.fail(Some(EVICTED));
                    }
                    evicted.push(gone);
                }
            }
            if entry.next_retry_at.is_some() {
                let delay = self.inner.policy.delay_for_attempt(entry.attempts);
                self.arm_timer(&mut state, entry.id, delay);
            }
            state.store.insert(entry);
            evicted
        };

        for gone in &evicted {
            warn!(
                error = %CoordinationError::CapacityExceeded { max: capacity },
                entry_id = %gone.id,
                subject = %gone.original_subject,
                "evicted oldest dead letter"
            );
            self.notify(|o| o.on_evicted(gone));
        }
        self.notify(|o| o.on_dead_letter(&snapshot));
        if snapshot.status == DlqStatus::Failed {
            self.notify(|o| o.on_max_retries_exceeded(&snapshot));
        }
        snapshot
    }

    /// Run one retry attempt now.
    ///
    /// No-op (returns `None`) if the entry is missing, not pending, or no
    /// handler is registered. Any armed timer for the entry is cancelled
    /// first. Returns the entry as the attempt left it.
    pub async fn attempt_retry(&self, id: EntryId) -> Option<DeadLetterEntry> {
        self.run_attempt(id, None).await
    }

    async fn run_attempt(&self, id: EntryId, generation: Option<u64>) -> Option<DeadLetterEntry> {
        let (started, handler) = {
            let mut state = self.state();
            if let Some(generation) = generation {
                let current = state.timers.get(&id).map(|t| t.generation);
                if current != Some(generation) {
                    debug!(entry_id = %id, "stale retry timer ignored");
                    return None;
                }
            }
            let status = state.store.get(id)?.status;
            if status != DlqStatus::Pending {
                debug!(entry_id = %id, %status, "retry skipped: entry not pending");
                return None;
            }
            state.cancel_timer(id);
            let Some(handler) = self.handler() else {
                debug!(entry_id = %id, "no retry handler registered, entry parked");
                return None;
            };
            let started = state.store.update(id, |entry| {
                entry.begin_attempt(Utc::now());
                entry.clone()
            })?;
            (started, handler)
        };

        self.notify(|o| o.on_retry(&started));

        // The attempt owns its own task from here on: a caller that stops
        // waiting only loses the snapshot, never the state update.
        let queue = self.clone();
        tokio::spawn(async move { queue.finish_attempt(started, handler).await })
            .await
            .unwrap_or_else(|join| {
                warn!(entry_id = %id, error = %join, "retry attempt task aborted");
                None
            })
    }

    async fn finish_attempt(
        &self,
        started: DeadLetterEntry,
        handler: Arc<dyn RetryHandler>,
    ) -> Option<DeadLetterEntry> {
        let id = started.id;
        // A panicking handler surfaces as a JoinError instead of stranding the
        // entry in `Retrying`.
        let outcome = match tokio::spawn(async move { handler.retry(&started).await }).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(HANDLER_DECLINED.to_string()),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(join) => Err(format!("retry handler panicked: {join}")),
        };

        let (finished, exhausted) = {
            let mut state = self.state();
            let policy = &self.inner.policy;
            let applied = state.store.update(id, |entry| {
                if entry.status != DlqStatus::Retrying {
                    // An operator resolved or failed it mid-attempt; their call stands.
                    return None;
                }
                let exhausted = match &outcome {
                    Ok(()) => {
                        entry.resolve();
                        false
                    }
                    Err(error) => entry.record_failure(error.clone(), policy, Utc::now()),
                };
                Some((entry.clone(), exhausted))
            });
            let (finished, exhausted) = match applied {
                None => {
                    debug!(entry_id = %id, "entry removed while retry was in flight");
                    return None;
                }
                Some(None) => return state.store.get(id).cloned(),
                Some(Some(applied)) => applied,
            };
            if finished.status == DlqStatus::Pending {
                let delay = policy.delay_for_attempt(finished.attempts);
                self.arm_timer(&mut state, id, delay);
            }
            (finished, exhausted)
        };

        match &outcome {
            Ok(()) => info!(
                entry_id = %id,
                subject = %finished.original_subject,
                attempts = finished.attempts,
                "dead letter resolved by retry"
            ),
            Err(error) => debug!(
                entry_id = %id,
                error = %CoordinationError::handler_failure(error.as_str()),
                attempts = finished.attempts,
                next_retry_at = ?finished.next_retry_at,
                "retry attempt failed"
            ),
        }
        if exhausted {
            self.notify(|o| o.on_max_retries_exceeded(&finished));
        }
        Some(finished)
    }

    /// Resolve manually. Returns `false` if the entry is missing or already
    /// resolved.
    pub fn mark_as_resolved(&self, id: EntryId) -> bool {
        let mut state = self.state();
        state.cancel_timer(id);
        state
            .store
            .update(id, |entry| {
                let changed = entry.status != DlqStatus::Resolved;
                if changed {
                    entry.resolve();
                }
                changed
            })
            .unwrap_or(false)
    }

    /// Fail manually. Returns `false` if the entry is missing or already
    /// terminal.
    pub fn mark_as_failed(&self, id: EntryId, reason: &str) -> bool {
        let mut state = self.state();
        state.cancel_timer(id);
        state
            .store
            .update(id, |entry| {
                let changed = !entry.status.is_terminal();
                if changed {
                    entry.fail(Some(reason));
                }
                changed
            })
            .unwrap_or(false)
    }

    /// Put a failed entry back on the schedule with a fresh attempt budget.
    pub fn requeue(&self, id: EntryId) -> Result<DeadLetterEntry, CoordinationError> {
        let mut state = self.state();
        let status = state
            .store
            .get(id)
            .map(|entry| entry.status)
            .ok_or_else(|| CoordinationError::not_found("dead letter", id))?;
        if status != DlqStatus::Failed {
            return Err(CoordinationError::invalid_state(
                "dead letter",
                id,
                status,
                "requeue",
            ));
        }
        let (config, policy) = (&self.inner.config, &self.inner.policy);
        let requeued = state
            .store
            .update(id, |entry| {
                entry.requeue(config.max_attempts, policy, Utc::now());
                entry.clone()
            })
            .ok_or_else(|| CoordinationError::not_found("dead letter", id))?;
        self.arm_timer(&mut state, id, policy.delay_for_attempt(1));
        info!(entry_id = %id, max_attempts = requeued.max_attempts, "dead letter requeued");
        Ok(requeued)
    }

    pub fn get_entry(&self, id: EntryId) -> Option<DeadLetterEntry> {
        self.state().store.get(id).cloned()
    }

    pub fn get_pending_entries(&self) -> Vec<DeadLetterEntry> {
        self.state()
            .store
            .collect(|e| e.status == DlqStatus::Pending)
    }

    pub fn get_failed_entries(&self) -> Vec<DeadLetterEntry> {
        self.state().store.collect(|e| e.status == DlqStatus::Failed)
    }

    pub fn get_all_entries(&self) -> Vec<DeadLetterEntry> {
        self.state().store.collect(|_| true)
    }

    pub fn get_stats(&self) -> DlqStats {
        self.state().store.stats(Utc::now())
    }

    pub fn len(&self) -> usize {
        self.state().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove resolved entries. Returns how many were removed.
    pub fn purge_resolved(&self) -> usize {
        self.purge(|e| e.status == DlqStatus::Resolved)
    }

    /// Remove entries of any status created more than `max_age` ago.
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        self.purge(|e| now.signed_duration_since(e.created_at) > max_age)
    }

    fn purge(&self, predicate: impl Fn(&DeadLetterEntry) -> bool) -> usize {
        let mut state = self.state();
        let removed = state.store.remove_where(predicate);
        for id in &removed {
            state.cancel_timer(*id);
        }
        if !removed.is_empty() {
            debug!(count = removed.len(), "purged dead letters");
        }
        removed.len()
    }

    /// Cancel every timer and drop every entry.
    pub fn clear(&self) -> usize {
        let mut state = self.state();
        state.cancel_all();
        state.store.drain().len()
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn arm_timer(&self, state: &mut QueueState, id: EntryId, delay: Duration) {
        let Some(runtime) = Handle::try_current().ok().or_else(|| self.inner.runtime.clone()) else {
            warn!(entry_id = %id, "no tokio runtime available, retry not scheduled");
            return;
        };
        state.cancel_timer(id);
        let generation = state.next_generation;
        state.next_generation += 1;

        let queue = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = queue.upgrade() {
                let queue = DeadLetterQueue { inner };
                tokio::spawn(async move {
                    queue.run_attempt(id, Some(generation)).await;
                });
            }
        });
        state.timers.insert(id, ArmedTimer { generation, handle });
    }

    fn notify(&self, f: impl Fn(&dyn DlqObserver)) {
        let observers = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            f(observer.as_ref());
        }
    }
}
