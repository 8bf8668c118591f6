use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tradeflow_core::{CorrelationId, EventId};

/// Envelope for an event travelling between services.
///
/// Notes:
/// - `subject` is the bus subject the event was published on
///   (e.g. `"orders.filled"`); there is no ordering across subjects.
/// - `correlation_id` is what a consumer uses to find the saga the event
///   belongs to. Events without one cannot be routed to a saga.
/// - Delivery is at-least-once: the same `event_id` may arrive more than once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: EventId,
    subject: String,
    correlation_id: Option<CorrelationId>,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(subject: impl Into<String>, payload: E) -> Self {
        Self {
            event_id: EventId::new(),
            subject: subject.into(),
            correlation_id: None,
            occurred_at: Utc::now(),
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
