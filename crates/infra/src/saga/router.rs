//! Event → saga routing (application-level correlation table).
//!
//! The router maps an incoming envelope to a saga via its correlation id and
//! a subject → action table, then calls the coordinator. Duplicate or late
//! deliveries (advisory `InvalidState`) become [`RouteOutcome::Duplicate`]
//! instead of errors; an unknown correlation id is an error the caller can
//! hand to the dead letter queue, since the event may simply have overtaken
//! the saga's start.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde_json::Value as JsonValue;
use tracing::debug;

use tradeflow_core::{CoordinationError, CoordinationResult, CorrelationId, SagaId, into_data_map};
use tradeflow_events::EventEnvelope;

use super::coordinator::SagaCoordinator;
use super::model::Saga;

/// What an event subject does to its saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Advance the saga; with `Some(step)`, only while `step` is in flight.
    Advance { expected_step: Option<String> },
    /// Compensate the saga. The reason is the payload's `"reason"` string, or
    /// the subject if absent.
    Compensate,
    /// Fail the saga without compensation (same reason rule as `Compensate`).
    Fail,
}

/// Result of dispatching one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    Advanced(Saga),
    Compensated(Saga),
    Failed(Saga),
    /// The saga had already moved past this event.
    Duplicate { saga_id: SagaId, reason: String },
    /// Nothing routes this event (unknown subject, no correlation id).
    Ignored { reason: &'static str },
}

impl RouteOutcome {
    pub fn saga(&self) -> Option<&Saga> {
        match self {
            Self::Advanced(s) | Self::Compensated(s) | Self::Failed(s) => Some(s),
            Self::Duplicate { .. } | Self::Ignored { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct SagaEventRouter {
    coordinator: SagaCoordinator,
    routes: HashMap<String, RouteAction>,
    bindings: RwLock<HashMap<CorrelationId, SagaId>>,
}

impl SagaEventRouter {
    pub fn new(coordinator: SagaCoordinator) -> Self {
        Self {
            coordinator,
            routes: HashMap::new(),
            bindings: RwLock::new(HashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &SagaCoordinator {
        &self.coordinator
    }

    /// Route `subject` to an unconditional advance.
    pub fn route_advance(mut self, subject: impl Into<String>) -> Self {
        self.routes
            .insert(subject.into(), RouteAction::Advance { expected_step: None });
        self
    }

    /// Route `subject` to an advance that only applies while `step` is in flight.
    pub fn route_step(mut self, subject: impl Into<String>, step: impl Into<String>) -> Self {
        self.routes.insert(
            subject.into(),
            RouteAction::Advance {
                expected_step: Some(step.into()),
            },
        );
        self
    }

    pub fn route_compensate(mut self, subject: impl Into<String>) -> Self {
        self.routes.insert(subject.into(), RouteAction::Compensate);
        self
    }

    pub fn route_fail(mut self, subject: impl Into<String>) -> Self {
        self.routes.insert(subject.into(), RouteAction::Fail);
        self
    }

    /// Bind a correlation id to a saga explicitly.
    ///
    /// Sagas started with a correlation id are found without binding; this is
    /// for additional keys (e.g. an exchange order id learned mid-saga).
    pub fn bind(&self, correlation_id: impl Into<CorrelationId>, saga_id: SagaId) {
        self.bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(correlation_id.into(), saga_id);
    }

    pub fn resolve(&self, correlation_id: &CorrelationId) -> Option<SagaId> {
        let bound = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(correlation_id)
            .copied();
        bound.or_else(|| self.coordinator.registry().saga_id_for(correlation_id))
    }

    /// Apply one envelope to its saga.
    pub fn dispatch(&self, envelope: &EventEnvelope<JsonValue>) -> CoordinationResult<RouteOutcome> {
        let Some(action) = self.routes.get(envelope.subject()) else {
            return Ok(RouteOutcome::Ignored {
                reason: "unrouted subject",
            });
        };
        let Some(correlation_id) = envelope.correlation_id() else {
            return Ok(RouteOutcome::Ignored {
                reason: "missing correlation id",
            });
        };
        let saga_id = self
            .resolve(correlation_id)
            .ok_or_else(|| CoordinationError::not_found("correlation", correlation_id))?;

        let result = match action {
            RouteAction::Advance { expected_step } => {
                let data = into_data_map(envelope.payload().clone());
                let advanced = match expected_step {
                    Some(step) => self.coordinator.advance_saga_step(saga_id, step, data),
                    None => self.coordinator.advance_saga(saga_id, data),
                };
                advanced.map(RouteOutcome::Advanced)
            }
            RouteAction::Compensate => self
                .coordinator
                .compensate_saga(saga_id, &reason_for(envelope))
                .map(RouteOutcome::Compensated),
            RouteAction::Fail => self
                .coordinator
                .fail_saga(saga_id, &reason_for(envelope))
                .map(RouteOutcome::Failed),
        };

        match result {
            Err(err) if err.is_advisory() => {
                debug!(
                    saga_id = %saga_id,
                    event_id = %envelope.event_id(),
                    subject = %envelope.subject(),
                    "duplicate or late event ignored"
                );
                Ok(RouteOutcome::Duplicate {
                    saga_id,
                    reason: err.to_string(),
                })
            }
            other => other,
        }
    }
}

fn reason_for(envelope: &EventEnvelope<JsonValue>) -> String {
    envelope
        .payload()
        .get("reason")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| envelope.subject().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::model::SagaStatus;
    use serde_json::json;
    use tradeflow_core::DataMap;

    fn router() -> SagaEventRouter {
        SagaEventRouter::new(SagaCoordinator::new())
            .route_step("risk.approved", "validate-risk")
            .route_step("orders.accepted", "submit-order")
            .route_advance("orders.filled")
            .route_compensate("orders.rejected")
            .route_fail("exchange.halted")
    }

    fn start(router: &SagaEventRouter, correlation: &str) -> Saga {
        router
            .coordinator()
            .start_saga_with_correlation(
                "trade-execution",
                &["validate-risk", "submit-order", "confirm-fill"],
                DataMap::new(),
                correlation,
            )
            .unwrap()
    }

    fn event(subject: &str, correlation: &str, payload: JsonValue) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(subject, payload).with_correlation_id(correlation)
    }

    #[test]
    fn events_drive_saga_forward() {
        let router = router();
        let saga = start(&router, "co-1");

        let outcome = router
            .dispatch(&event("risk.approved", "co-1", json!({"limit_ok": true})))
            .unwrap();
        assert_eq!(outcome.saga().unwrap().current_step_index, 1);

        router.dispatch(&event("orders.accepted", "co-1", json!({}))).unwrap();
        let outcome = router
            .dispatch(&event("orders.filled", "co-1", json!({"qty": 100})))
            .unwrap();

        let done = outcome.saga().unwrap();
        assert_eq!(done.saga_id, saga.saga_id);
        assert_eq!(done.status, SagaStatus::Completed);
        assert_eq!(done.data["limit_ok"], json!(true));
        assert_eq!(done.data["qty"], json!(100));
    }

    #[test]
    fn redelivered_step_event_is_a_duplicate() {
        let router = router();
        let saga = start(&router, "co-2");
        let approved = event("risk.approved", "co-2", json!({"attempt": 1}));

        router.dispatch(&approved).unwrap();
        let again = router.dispatch(&approved).unwrap();

        assert!(matches!(again, RouteOutcome::Duplicate { saga_id, .. } if saga_id == saga.saga_id));
        let state = router.coordinator().get_saga_status(saga.saga_id).unwrap();
        assert_eq!(state.current_step_index, 1);
    }

    #[test]
    fn rejection_compensates_with_payload_reason() {
        let router = router();
        let saga = start(&router, "co-3");
        router.dispatch(&event("risk.approved", "co-3", json!({}))).unwrap();

        let outcome = router
            .dispatch(&event("orders.rejected", "co-3", json!({"reason": "insufficient margin"})))
            .unwrap();

        let compensated = outcome.saga().unwrap();
        assert_eq!(compensated.saga_id, saga.saga_id);
        assert_eq!(compensated.status, SagaStatus::Compensated);
        assert_eq!(compensated.error.as_deref(), Some("insufficient margin"));

        // A fill arriving after the rejection is late, not an error.
        let late = router.dispatch(&event("orders.filled", "co-3", json!({}))).unwrap();
        assert!(matches!(late, RouteOutcome::Duplicate { .. }));
    }

    #[test]
    fn halt_fails_with_subject_as_reason() {
        let router = router();
        start(&router, "co-4");
        let outcome = router.dispatch(&event("exchange.halted", "co-4", json!({}))).unwrap();
        let failed = outcome.saga().unwrap();
        assert_eq!(failed.status, SagaStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("exchange.halted"));
    }

    #[test]
    fn unroutable_events_are_ignored() {
        let router = router();
        start(&router, "co-5");

        let unknown_subject = router.dispatch(&event("md.tick", "co-5", json!({}))).unwrap();
        assert_eq!(unknown_subject, RouteOutcome::Ignored { reason: "unrouted subject" });

        let uncorrelated = router
            .dispatch(&EventEnvelope::new("orders.filled", json!({})))
            .unwrap();
        assert_eq!(uncorrelated, RouteOutcome::Ignored { reason: "missing correlation id" });
    }

    #[test]
    fn unknown_correlation_is_not_found() {
        let router = router();
        let err = router
            .dispatch(&event("orders.filled", "never-started", json!({})))
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn explicit_bindings_resolve_secondary_keys() {
        let router = router();
        let saga = start(&router, "co-6");
        router.bind("exchange-order-991", saga.saga_id);

        let outcome = router
            .dispatch(&event("risk.approved", "exchange-order-991", json!({})))
            .unwrap();
        assert_eq!(outcome.saga().unwrap().saga_id, saga.saga_id);
    }
}
