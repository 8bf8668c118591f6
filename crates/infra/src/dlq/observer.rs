//! Lifecycle hooks for dead-letter entries.
//!
//! Observers are invoked after the queue's lock is released, with a snapshot
//! of the entry at the moment of the transition.

use tracing::{info, warn};

use super::types::DeadLetterEntry;

pub trait DlqObserver: Send + Sync {
    /// A new entry was added.
    fn on_dead_letter(&self, _entry: &DeadLetterEntry) {}

    /// A retry attempt is about to call the handler.
    fn on_retry(&self, _entry: &DeadLetterEntry) {}

    /// The entry failed its final attempt.
    fn on_max_retries_exceeded(&self, _entry: &DeadLetterEntry) {}

    /// The entry was dropped to make room for a newer one.
    fn on_evicted(&self, _entry: &DeadLetterEntry) {}
}

/// Logs every lifecycle transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DlqObserver for TracingObserver {
    fn on_dead_letter(&self, entry: &DeadLetterEntry) {
        info!(
            entry_id = %entry.id,
            subject = %entry.original_subject,
            error = %entry.error,
            next_retry_at = ?entry.next_retry_at,
            "event dead-lettered"
        );
    }

    fn on_retry(&self, entry: &DeadLetterEntry) {
        info!(
            entry_id = %entry.id,
            subject = %entry.original_subject,
            attempt = entry.attempts,
            max_attempts = entry.max_attempts,
            "retrying dead-lettered event"
        );
    }

    fn on_max_retries_exceeded(&self, entry: &DeadLetterEntry) {
        warn!(
            entry_id = %entry.id,
            subject = %entry.original_subject,
            attempts = entry.attempts,
            error = %entry.error,
            "dead-lettered event exhausted retries"
        );
    }

    fn on_evicted(&self, entry: &DeadLetterEntry) {
        warn!(
            entry_id = %entry.id,
            subject = %entry.original_subject,
            "dead-lettered event evicted"
        );
    }
}
