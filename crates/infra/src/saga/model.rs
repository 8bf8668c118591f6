//! Saga aggregate and its explicit state machine.
//!
//! The transitions here are pure: no locking, no logging, no IO. The
//! coordinator owns instances through the registry and calls these methods
//! under the per-saga lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tradeflow_core::{CoordinationError, CoordinationResult, CorrelationId, DataMap, SagaId, merge_data};

const RESOURCE: &str = "saga";

/// Saga lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    Pending,
    Running,
    Compensating,
    Completed,
    Compensated,
    Failed,
}

impl SagaStatus {
    /// Terminal statuses freeze the saga.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Compensating => "COMPENSATING",
            Self::Completed => "COMPLETED",
            Self::Compensated => "COMPENSATED",
            Self::Failed => "FAILED",
        }
    }
}

impl core::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Compensated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub compensated_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SagaStep {
    fn pending(name: String) -> Self {
        Self {
            name,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            compensated_at: None,
            error: None,
        }
    }

    fn start(&mut self, now: DateTime<Utc>) {
        self.status = StepStatus::Running;
        self.started_at = Some(now);
    }
}

/// A multi-step workflow tracked as a single aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub steps: Vec<SagaStep>,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    pub data: DataMap,
}

impl Saga {
    /// Create a running saga with its first step in flight.
    pub fn start(
        saga_type: impl Into<String>,
        step_names: &[&str],
        initial_data: DataMap,
        correlation_id: Option<CorrelationId>,
        now: DateTime<Utc>,
    ) -> CoordinationResult<Self> {
        let saga_type = saga_type.into();
        if saga_type.trim().is_empty() {
            return Err(CoordinationError::validation("saga type must not be empty"));
        }
        if step_names.is_empty() {
            return Err(CoordinationError::validation(format!(
                "saga {saga_type} must declare at least one step"
            )));
        }
        if let Some(blank) = step_names.iter().position(|s| s.trim().is_empty()) {
            return Err(CoordinationError::validation(format!(
                "saga {saga_type} step {blank} has an empty name"
            )));
        }

        let mut steps: Vec<SagaStep> = step_names
            .iter()
            .map(|name| SagaStep::pending((*name).to_string()))
            .collect();
        steps[0].start(now);

        Ok(Self {
            saga_id: SagaId::new(),
            saga_type,
            status: SagaStatus::Running,
            total_steps: steps.len(),
            steps,
            current_step_index: 0,
            started_at: now,
            completed_at: None,
            error: None,
            correlation_id,
            data: initial_data,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The step currently in flight, if the saga is running.
    pub fn current_step(&self) -> Option<&SagaStep> {
        if self.status == SagaStatus::Running {
            self.steps.get(self.current_step_index)
        } else {
            None
        }
    }

    fn reject(&self, operation: &'static str) -> CoordinationError {
        CoordinationError::invalid_state(RESOURCE, self.saga_id, self.status, operation)
    }

    /// Complete the current step and move to the next one.
    pub fn advance(&mut self, step_data: DataMap, now: DateTime<Utc>) -> CoordinationResult<()> {
        if self.status != SagaStatus::Running {
            return Err(self.reject("advance"));
        }

        let step = &mut self.steps[self.current_step_index];
        step.status = StepStatus::Completed;
        step.completed_at = Some(now);
        merge_data(&mut self.data, step_data);
        self.current_step_index += 1;

        match self.steps.get_mut(self.current_step_index) {
            Some(next) => next.start(now),
            None => {
                self.status = SagaStatus::Completed;
                self.completed_at = Some(now);
            }
        }
        Ok(())
    }

    /// Like [`Saga::advance`], but only if the step in flight is `expected_step`.
    pub fn advance_step(
        &mut self,
        expected_step: &str,
        step_data: DataMap,
        now: DateTime<Utc>,
    ) -> CoordinationResult<()> {
        match self.current_step() {
            Some(step) if step.name == expected_step => self.advance(step_data, now),
            Some(step) => Err(CoordinationError::invalid_state(
                RESOURCE,
                self.saga_id,
                format!("{} at step {}", self.status, step.name),
                "advance",
            )),
            None => Err(self.reject("advance")),
        }
    }

    /// Mark every completed step compensated, newest first.
    ///
    /// Returns the names of the compensated steps in the order they were
    /// visited. Terminal sagas are left untouched and yield an empty list.
    pub fn compensate(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Vec<String> {
        if self.is_terminal() {
            return Vec::new();
        }
        let reason = reason.into();

        self.status = SagaStatus::Compensating;
        self.interrupt_running_step(&reason);

        let mut visited = Vec::new();
        for step in self.steps.iter_mut().rev() {
            if step.status == StepStatus::Completed {
                step.status = StepStatus::Compensated;
                step.compensated_at = Some(now);
                visited.push(step.name.clone());
            }
        }

        self.error = Some(reason);
        self.status = SagaStatus::Compensated;
        self.completed_at = Some(now);
        visited
    }

    /// Terminate without compensation. Returns false if already terminal.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let reason = reason.into();
        self.interrupt_running_step(&reason);
        self.error = Some(reason);
        self.status = SagaStatus::Failed;
        self.completed_at = Some(now);
        true
    }

    // The in-flight step never finished, so it goes back to PENDING.
    fn interrupt_running_step(&mut self, reason: &str) {
        if let Some(step) = self
            .steps
            .iter_mut()
            .find(|s| s.status == StepStatus::Running)
        {
            step.status = StepStatus::Pending;
            step.error = Some(reason.to_string());
        }
    }

    /// Names of the compensated steps in the order their reversal must run.
    pub fn compensation_plan(&self) -> Vec<&str> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.status == StepStatus::Compensated)
            .map(|s| s.name.as_str())
            .collect()
    }
}

/// Filter for active-saga queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SagaFilter {
    pub saga_type: Option<String>,
    pub status: Option<SagaStatus>,
}

impl SagaFilter {
    pub fn by_type(saga_type: impl Into<String>) -> Self {
        Self {
            saga_type: Some(saga_type.into()),
            status: None,
        }
    }

    pub fn by_status(status: SagaStatus) -> Self {
        Self {
            saga_type: None,
            status: Some(status),
        }
    }

    pub fn matches(&self, saga: &Saga) -> bool {
        self.saga_type.as_deref().is_none_or(|t| t == saga.saga_type)
            && self.status.is_none_or(|s| s == saga.status)
    }
}

/// Saga counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SagaStats {
    pub pending: usize,
    pub running: usize,
    pub compensating: usize,
    pub completed: usize,
    pub compensated: usize,
    pub failed: usize,
}

impl SagaStats {
    pub fn record(&mut self, status: SagaStatus) {
        match status {
            SagaStatus::Pending => self.pending += 1,
            SagaStatus::Running => self.running += 1,
            SagaStatus::Compensating => self.compensating += 1,
            SagaStatus::Completed => self.completed += 1,
            SagaStatus::Compensated => self.compensated += 1,
            SagaStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.running + self.compensating + self.completed + self.compensated + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tradeflow_core::into_data_map;

    const TRADE_STEPS: [&str; 4] = ["validate-risk", "submit-order", "confirm-fill", "update-position"];

    fn trade_saga() -> Saga {
        Saga::start(
            "trade-execution",
            &TRADE_STEPS,
            into_data_map(json!({"symbol": "AAPL"})),
            None,
            Utc::now(),
        )
        .unwrap()
    }

    fn statuses(saga: &Saga) -> Vec<StepStatus> {
        saga.steps.iter().map(|s| s.status).collect()
    }

    #[test]
    fn start_runs_first_step() {
        let saga = trade_saga();
        assert_eq!(saga.status, SagaStatus::Running);
        assert_eq!(saga.current_step_index, 0);
        assert_eq!(saga.total_steps, 4);
        assert_eq!(
            statuses(&saga),
            vec![StepStatus::Running, StepStatus::Pending, StepStatus::Pending, StepStatus::Pending]
        );
        assert_eq!(saga.data["symbol"], json!("AAPL"));
    }

    #[test]
    fn start_rejects_empty_definitions() {
        let now = Utc::now();
        assert!(Saga::start("", &["a"], DataMap::new(), None, now).is_err());
        assert!(Saga::start("t", &[], DataMap::new(), None, now).is_err());
        assert!(Saga::start("t", &["a", " "], DataMap::new(), None, now).is_err());
    }

    #[test]
    fn advancing_every_step_completes() {
        let mut saga = trade_saga();
        for _ in 0..4 {
            saga.advance(DataMap::new(), Utc::now()).unwrap();
        }
        assert_eq!(saga.status, SagaStatus::Completed);
        assert_eq!(saga.current_step_index, 4);
        assert!(saga.completed_at.is_some());
        assert!(saga.steps.iter().all(|s| s.status == StepStatus::Completed));

        let err = saga.advance(DataMap::new(), Utc::now()).unwrap_err();
        assert!(err.is_advisory());
        assert_eq!(saga.current_step_index, 4);
    }

    #[test]
    fn advance_step_rejects_stale_step_names() {
        let mut saga = trade_saga();
        saga.advance_step("validate-risk", DataMap::new(), Utc::now()).unwrap();

        let err = saga
            .advance_step("validate-risk", into_data_map(json!({"late": true})), Utc::now())
            .unwrap_err();
        assert!(err.is_advisory());
        assert_eq!(saga.current_step_index, 1);
        assert!(!saga.data.contains_key("late"));
    }

    #[test]
    fn compensation_reverses_completed_steps_only() {
        let mut saga = trade_saga();
        saga.advance(DataMap::new(), Utc::now()).unwrap();
        saga.advance(DataMap::new(), Utc::now()).unwrap();

        let visited = saga.compensate("order rejected", Utc::now());

        assert_eq!(visited, vec!["submit-order", "validate-risk"]);
        assert_eq!(saga.compensation_plan(), vec!["submit-order", "validate-risk"]);
        assert_eq!(saga.status, SagaStatus::Compensated);
        assert_eq!(saga.error.as_deref(), Some("order rejected"));
        assert_eq!(
            statuses(&saga),
            vec![
                StepStatus::Compensated,
                StepStatus::Compensated,
                StepStatus::Pending,
                StepStatus::Pending
            ]
        );
    }

    #[test]
    fn completed_saga_is_never_compensated() {
        let mut saga = trade_saga();
        for _ in 0..4 {
            saga.advance(DataMap::new(), Utc::now()).unwrap();
        }
        let before = saga.clone();
        assert!(saga.compensate("too late", Utc::now()).is_empty());
        assert!(!saga.fail("too late", Utc::now()));
        assert_eq!(saga, before);
    }

    #[test]
    fn fail_terminates_without_compensating() {
        let mut saga = trade_saga();
        saga.advance(DataMap::new(), Utc::now()).unwrap();
        assert!(saga.fail("exchange halted", Utc::now()));

        assert_eq!(saga.status, SagaStatus::Failed);
        assert_eq!(saga.steps[0].status, StepStatus::Completed);
        assert_eq!(saga.steps[1].status, StepStatus::Pending);
        assert_eq!(saga.steps[1].error.as_deref(), Some("exchange halted"));
        assert!(saga.compensation_plan().is_empty());
    }

    #[test]
    fn filter_matches_type_and_status() {
        let saga = trade_saga();
        assert!(SagaFilter::default().matches(&saga));
        assert!(SagaFilter::by_type("trade-execution").matches(&saga));
        assert!(!SagaFilter::by_type("rebalance").matches(&saga));
        assert!(SagaFilter::by_status(SagaStatus::Running).matches(&saga));
        assert!(!SagaFilter::by_status(SagaStatus::Compensating).matches(&saga));
    }

    #[test]
    fn status_serializes_upper_case() {
        assert_eq!(serde_json::to_value(SagaStatus::Compensated).unwrap(), json!("COMPENSATED"));
        assert_eq!(serde_json::to_value(StepStatus::Running).unwrap(), json!("RUNNING"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Advance,
        Compensate,
        Fail,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            6 => Just(Op::Advance),
            1 => Just(Op::Compensate),
            1 => Just(Op::Fail),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of operations is applied, a running saga
        /// has a completed prefix, at most one running step, and terminal
        /// sagas never change again.
        #[test]
        fn state_machine_invariants_hold(
            step_count in 1usize..6,
            ops in prop::collection::vec(op(), 0..12)
        ) {
            let names: Vec<String> = (0..step_count).map(|i| format!("step-{i}")).collect();
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut saga = Saga::start("prop", &refs, DataMap::new(), None, Utc::now()).unwrap();

            for op in ops {
                let before = saga.clone();
                let index_before = saga.current_step_index;
                match op {
                    Op::Advance => { let _ = saga.advance(DataMap::new(), Utc::now()); }
                    Op::Compensate => { saga.compensate("prop", Utc::now()); }
                    Op::Fail => { saga.fail("prop", Utc::now()); }
                }

                if before.is_terminal() {
                    prop_assert_eq!(&saga, &before);
                }
                prop_assert!(saga.current_step_index >= index_before);

                let running = saga.steps.iter().filter(|s| s.status == StepStatus::Running).count();
                prop_assert!(running <= 1);

                if saga.status == SagaStatus::Running {
                    prop_assert!(saga.steps[..saga.current_step_index]
                        .iter()
                        .all(|s| s.status == StepStatus::Completed));
                    prop_assert_eq!(saga.steps[saga.current_step_index].status, StepStatus::Running);
                }
            }
        }
    }
}
