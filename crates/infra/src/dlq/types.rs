//! Dead-letter entry types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use tradeflow_core::{DataMap, EntryId};

use super::backoff::{BackoffPolicy, should_retry};

/// Dead-letter entry status.
///
/// ```text
/// pending ──attempt──▶ retrying ──ok──▶ resolved
///    ▲                    │
///    └──fail, budget left─┤
///                         └──fail, exhausted──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlqStatus {
    /// Waiting for its next scheduled attempt
    Pending,
    /// A retry handler call is in flight
    Retrying,
    /// Handled successfully (by retry or by an operator)
    Resolved,
    /// Exhausted its attempts, evicted, or failed by an operator
    Failed,
}

impl DlqStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for DlqStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event that could not be processed, with its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: EntryId,
    pub original_subject: String,
    pub payload: JsonValue,
    /// Most recent failure message
    pub error: String,
    pub stack: Option<String>,
    /// Processing attempts so far, including the one that dead-lettered the event
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    /// Set only while `Pending` with attempts left
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: DlqStatus,
    #[serde(default)]
    pub metadata: DataMap,
}

/// Everything needed to dead-letter one event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeadLetter {
    pub original_subject: String,
    pub payload: JsonValue,
    pub error: String,
    pub stack: Option<String>,
    pub metadata: DataMap,
}

impl NewDeadLetter {
    pub fn new(subject: impl Into<String>, payload: JsonValue, error: impl Into<String>) -> Self {
        Self {
            original_subject: subject.into(),
            payload,
            error: error.into(),
            stack: None,
            metadata: DataMap::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_metadata(mut self, metadata: DataMap) -> Self {
        self.metadata = metadata;
        self
    }
}

impl DeadLetterEntry {
    /// Create an entry. The failed processing that produced it counts as
    /// attempt 1, so a budget of one attempt yields an entry that is already
    /// `Failed`.
    pub fn new(
        dead_letter: NewDeadLetter,
        max_attempts: u32,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        let attempts = 1;
        let retryable = should_retry(attempts, max_attempts);
        let next_retry_at = retryable.then(|| policy.next_retry_at(now, attempts));
        Self {
            id: EntryId::new(),
            original_subject: dead_letter.original_subject,
            payload: dead_letter.payload,
            error: dead_letter.error,
            stack: dead_letter.stack,
            attempts,
            max_attempts,
            created_at: now,
            last_attempt_at: now,
            next_retry_at,
            status: if retryable {
                DlqStatus::Pending
            } else {
                DlqStatus::Failed
            },
            metadata: dead_letter.metadata,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        should_retry(self.attempts, self.max_attempts)
    }

    /// Move to `Retrying` for one handler call.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>) {
        self.status = DlqStatus::Retrying;
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = now;
        self.next_retry_at = None;
    }

    /// Record a failed attempt. Returns `true` when the entry is now exhausted.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> bool {
        self.error = error.into();
        if self.has_attempts_left() {
            self.status = DlqStatus::Pending;
            self.next_retry_at = Some(policy.next_retry_at(now, self.attempts));
            false
        } else {
            self.status = DlqStatus::Failed;
            self.next_retry_at = None;
            true
        }
    }

    pub fn resolve(&mut self) {
        self.status = DlqStatus::Resolved;
        self.next_retry_at = None;
    }

    pub fn fail(&mut self, reason: Option<&str>) {
        if let Some(reason) = reason {
            self.error = reason.to_string();
        }
        self.status = DlqStatus::Failed;
        self.next_retry_at = None;
    }

    /// Give a failed entry a fresh budget of `extra_attempts` and schedule it.
    pub fn requeue(&mut self, extra_attempts: u32, policy: &BackoffPolicy, now: DateTime<Utc>) {
        self.max_attempts = self.attempts.saturating_add(extra_attempts.max(1));
        self.status = DlqStatus::Pending;
        self.next_retry_at = self
            .has_attempts_left()
            .then(|| policy.next_retry_at(now, 1));
    }
}

/// Queue totals per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    pub total: usize,
    pub pending: usize,
    pub retrying: usize,
    pub resolved: usize,
    pub failed: usize,
    /// Age of the oldest pending entry, in milliseconds
    pub oldest_pending_age_ms: Option<i64>,
}

impl DlqStats {
    pub fn record(&mut self, status: DlqStatus) {
        self.total += 1;
        match status {
            DlqStatus::Pending => self.pending += 1,
            DlqStatus::Retrying => self.retrying += 1,
            DlqStatus::Resolved => self.resolved += 1,
            DlqStatus::Failed => self.failed += 1,
        }
    }
}
