//! Saga coordinator: the public state-machine operations over the registry.
//!
//! The coordinator only records declared progress. It never runs step logic
//! and never executes compensating actions; callers read
//! [`Saga::compensation_plan`] and perform the reversal themselves.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use tradeflow_core::{CoordinationError, CoordinationResult, CorrelationId, DataMap, SagaId};

use super::model::{Saga, SagaFilter, SagaStats};
use super::registry::SagaRegistry;

const RESOURCE: &str = "saga";

/// Saga coordinator. Cheap to clone; clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct SagaCoordinator {
    registry: Arc<SagaRegistry>,
}

impl SagaCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a coordinator over an existing registry.
    pub fn with_registry(registry: Arc<SagaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.registry
    }

    pub fn start_saga(
        &self,
        saga_type: &str,
        step_names: &[&str],
        initial_data: DataMap,
    ) -> CoordinationResult<Saga> {
        self.start(saga_type, step_names, initial_data, None)
    }

    /// Start a saga that incoming events can find by `correlation_id`.
    pub fn start_saga_with_correlation(
        &self,
        saga_type: &str,
        step_names: &[&str],
        initial_data: DataMap,
        correlation_id: impl Into<CorrelationId>,
    ) -> CoordinationResult<Saga> {
        self.start(saga_type, step_names, initial_data, Some(correlation_id.into()))
    }

    fn start(
        &self,
        saga_type: &str,
        step_names: &[&str],
        initial_data: DataMap,
        correlation_id: Option<CorrelationId>,
    ) -> CoordinationResult<Saga> {
        let saga = Saga::start(saga_type, step_names, initial_data, correlation_id, Utc::now())?;
        let saga = self.registry.insert(saga);
        info!(
            saga_id = %saga.saga_id,
            saga_type = %saga.saga_type,
            steps = saga.total_steps,
            correlation_id = ?saga.correlation_id,
            "saga started"
        );
        Ok(saga)
    }

    /// Complete the step in flight and start the next one.
    ///
    /// `InvalidState` means the saga is no longer running: a duplicate or late
    /// delivery. Callers should treat it as a no-op.
    pub fn advance_saga(&self, saga_id: SagaId, step_data: DataMap) -> CoordinationResult<Saga> {
        self.mutate(saga_id, |saga| {
            saga.advance(step_data, Utc::now())?;
            Ok(saga.clone())
        })
        .inspect(log_advanced)
    }

    /// Advance only if the step in flight is `expected_step`.
    ///
    /// Guards against a redelivered step outcome advancing a later step.
    pub fn advance_saga_step(
        &self,
        saga_id: SagaId,
        expected_step: &str,
        step_data: DataMap,
    ) -> CoordinationResult<Saga> {
        self.mutate(saga_id, |saga| {
            saga.advance_step(expected_step, step_data, Utc::now())?;
            Ok(saga.clone())
        })
        .inspect(log_advanced)
    }

    /// Mark completed steps compensated (newest first) and end in COMPENSATED.
    ///
    /// Terminal sagas are returned unchanged.
    pub fn compensate_saga(&self, saga_id: SagaId, reason: &str) -> CoordinationResult<Saga> {
        self.mutate(saga_id, |saga| {
            if saga.is_terminal() {
                debug!(saga_id = %saga_id, status = %saga.status, "compensation ignored for terminal saga");
                return Ok(saga.clone());
            }

            let visited = saga.compensate(reason, Utc::now());
            for step in &visited {
                debug!(saga_id = %saga_id, step = %step, "step marked compensated");
            }
            warn!(
                saga_id = %saga_id,
                saga_type = %saga.saga_type,
                reason = %reason,
                compensated_steps = visited.len(),
                "saga compensated"
            );
            Ok(saga.clone())
        })
    }

    /// Terminate a saga as FAILED without compensating anything.
    ///
    /// Terminal sagas are returned unchanged.
    pub fn fail_saga(&self, saga_id: SagaId, reason: &str) -> CoordinationResult<Saga> {
        self.mutate(saga_id, |saga| {
            if saga.fail(reason, Utc::now()) {
                warn!(saga_id = %saga_id, saga_type = %saga.saga_type, reason = %reason, "saga failed");
            } else {
                debug!(saga_id = %saga_id, status = %saga.status, "fail ignored for terminal saga");
            }
            Ok(saga.clone())
        })
    }

    pub fn get_saga_status(&self, saga_id: SagaId) -> Option<Saga> {
        self.registry.snapshot(saga_id)
    }

    pub fn find_by_correlation_id(&self, correlation_id: &CorrelationId) -> Option<Saga> {
        self.registry.find_by_correlation_id(correlation_id)
    }

    /// Non-terminal sagas, optionally narrowed by `filter`, oldest first.
    pub fn get_active_sagas(&self, filter: Option<&SagaFilter>) -> Vec<Saga> {
        self.registry.snapshots(|saga| {
            !saga.is_terminal() && filter.is_none_or(|f| f.matches(saga))
        })
    }

    pub fn stats(&self) -> SagaStats {
        let mut stats = SagaStats::default();
        for saga in self.registry.snapshots(|_| true) {
            stats.record(saga.status);
        }
        stats
    }

    /// Discard all saga state (process shutdown). Nothing is compensated.
    pub fn cleanup(&self) {
        let removed = self.registry.clear();
        info!(removed, "saga registry cleared");
    }

    fn mutate(
        &self,
        saga_id: SagaId,
        f: impl FnOnce(&mut Saga) -> CoordinationResult<Saga>,
    ) -> CoordinationResult<Saga> {
        let result = self
            .registry
            .update(saga_id, f)
            .ok_or_else(|| CoordinationError::not_found(RESOURCE, saga_id))?;

        if let Err(err) = &result {
            if err.is_advisory() {
                debug!(saga_id = %saga_id, error = %err, "saga mutation rejected");
            }
        }
        result
    }
}

fn log_advanced(saga: &Saga) {
    match saga.current_step() {
        Some(step) => debug!(
            saga_id = %saga.saga_id,
            step_index = saga.current_step_index,
            next_step = %step.name,
            "saga advanced"
        ),
        None => info!(saga_id = %saga.saga_id, saga_type = %saga.saga_type, "saga completed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::model::{SagaStatus, StepStatus};
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;
    use tradeflow_core::into_data_map;

    const TRADE_STEPS: [&str; 4] = ["validate-risk", "submit-order", "confirm-fill", "update-position"];

    fn start_trade(coordinator: &SagaCoordinator) -> Saga {
        coordinator
            .start_saga("trade-execution", &TRADE_STEPS, into_data_map(json!({"symbol": "AAPL"})))
            .unwrap()
    }

    #[test]
    fn trade_execution_runs_to_completion() {
        let coordinator = SagaCoordinator::new();
        let saga = start_trade(&coordinator);
        assert_eq!(saga.status, SagaStatus::Running);
        assert_eq!(saga.steps[0].status, StepStatus::Running);

        let mut last = None;
        for (i, data) in [json!({"risk_ok": true}), json!({"order_id": "o-1"}), json!({"filled": 100}), json!({})]
            .into_iter()
            .enumerate()
        {
            let advanced = coordinator.advance_saga(saga.saga_id, into_data_map(data)).unwrap();
            assert_eq!(advanced.current_step_index, i + 1);
            last = Some(advanced);
        }

        let last = last.unwrap();
        assert_eq!(last.status, SagaStatus::Completed);
        assert_eq!(last.current_step_index, 4);
        assert!(last.steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(last.data["symbol"], json!("AAPL"));
        assert_eq!(last.data["order_id"], json!("o-1"));
    }

    #[test]
    fn compensation_after_first_step() {
        let coordinator = SagaCoordinator::new();
        let saga = start_trade(&coordinator);
        coordinator.advance_saga(saga.saga_id, DataMap::new()).unwrap();

        let compensated = coordinator.compensate_saga(saga.saga_id, "order rejected").unwrap();

        assert_eq!(compensated.status, SagaStatus::Compensated);
        assert_eq!(compensated.error.as_deref(), Some("order rejected"));
        assert_eq!(compensated.steps[0].status, StepStatus::Compensated);
        assert!(compensated.steps[1..].iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(compensated.compensation_plan(), vec!["validate-risk"]);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let coordinator = SagaCoordinator::new();
        let missing = SagaId::new();

        assert!(coordinator.advance_saga(missing, DataMap::new()).unwrap_err().is_not_found());
        assert!(coordinator.compensate_saga(missing, "x").unwrap_err().is_not_found());
        assert!(coordinator.fail_saga(missing, "x").unwrap_err().is_not_found());
        assert!(coordinator.get_saga_status(missing).is_none());
    }

    #[test]
    fn terminal_sagas_are_frozen() {
        let coordinator = SagaCoordinator::new();
        let saga = start_trade(&coordinator);
        let compensated = coordinator.compensate_saga(saga.saga_id, "risk breach").unwrap();

        let err = coordinator
            .advance_saga(saga.saga_id, into_data_map(json!({"late": 1})))
            .unwrap_err();
        assert!(err.is_advisory());

        let again = coordinator.compensate_saga(saga.saga_id, "second reason").unwrap();
        assert_eq!(again, compensated);
        assert_eq!(coordinator.fail_saga(saga.saga_id, "x").unwrap(), compensated);
        assert_eq!(coordinator.get_saga_status(saga.saga_id).unwrap(), compensated);
    }

    #[test]
    fn repeated_reads_return_equal_snapshots() {
        let coordinator = SagaCoordinator::new();
        let saga = start_trade(&coordinator);
        assert_eq!(
            coordinator.get_saga_status(saga.saga_id),
            coordinator.get_saga_status(saga.saga_id)
        );
    }

    #[test]
    fn active_sagas_exclude_terminal_ones() {
        let coordinator = SagaCoordinator::new();
        let running = start_trade(&coordinator);
        let done = coordinator.start_saga("rebalance", &["compute"], DataMap::new()).unwrap();
        coordinator.advance_saga(done.saga_id, DataMap::new()).unwrap();
        let other = coordinator.start_saga("rebalance", &["compute", "apply"], DataMap::new()).unwrap();

        let active: Vec<SagaId> = coordinator.get_active_sagas(None).iter().map(|s| s.saga_id).collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&running.saga_id));
        assert!(active.contains(&other.saga_id));

        let rebalances = coordinator.get_active_sagas(Some(&SagaFilter::by_type("rebalance")));
        assert_eq!(rebalances.len(), 1);
        assert_eq!(rebalances[0].saga_id, other.saga_id);

        let stats = coordinator.stats();
        assert_eq!(stats.running, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn correlated_sagas_can_be_found() {
        let coordinator = SagaCoordinator::new();
        let saga = coordinator
            .start_saga_with_correlation("trade-execution", &TRADE_STEPS, DataMap::new(), "client-order-42")
            .unwrap();

        let found = coordinator.find_by_correlation_id(&"client-order-42".into()).unwrap();
        assert_eq!(found.saga_id, saga.saga_id);
    }

    #[test]
    fn cleanup_discards_registry() {
        let coordinator = SagaCoordinator::new();
        let saga = start_trade(&coordinator);
        coordinator.cleanup();
        assert!(coordinator.get_saga_status(saga.saga_id).is_none());
        assert!(coordinator.get_active_sagas(None).is_empty());
    }

    #[test]
    fn concurrent_advances_apply_exactly_once() {
        for _ in 0..50 {
            let coordinator = SagaCoordinator::new();
            let saga_id = start_trade(&coordinator).saga_id;
            let barrier = Arc::new(Barrier::new(2));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let coordinator = coordinator.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        coordinator.advance_saga_step(saga_id, "validate-risk", DataMap::new())
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let succeeded = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(succeeded, 1);
            assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| e.is_advisory()));
            assert_eq!(coordinator.get_saga_status(saga_id).unwrap().current_step_index, 1);
        }
    }

    #[test]
    fn concurrent_advances_on_last_step_complete_once() {
        let coordinator = SagaCoordinator::new();
        let saga_id = coordinator
            .start_saga("close-position", &["flatten"], DataMap::new())
            .unwrap()
            .saga_id;
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    coordinator.advance_saga(saga_id, DataMap::new())
                })
            })
            .collect();

        let succeeded = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(succeeded, 1);

        let final_state = coordinator.get_saga_status(saga_id).unwrap();
        assert_eq!(final_state.status, SagaStatus::Completed);
        assert_eq!(final_state.current_step_index, 1);
    }
}
