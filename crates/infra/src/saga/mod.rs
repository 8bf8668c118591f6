//! Saga coordination: aggregate model, registry, coordinator and event routing.
//!
//! - Explicit state machine per saga (`model`)
//! - Per-saga linearized mutation, snapshot reads (`registry`)
//! - Public operations with logging and error mapping (`coordinator`)
//! - Correlation table turning bus events into coordinator calls (`router`)
//!
//! Compensating actions are never executed here. A compensated saga records
//! which steps need reversal; the caller runs them.

pub mod coordinator;
pub mod model;
pub mod registry;
pub mod router;

pub use coordinator::SagaCoordinator;
pub use model::{Saga, SagaFilter, SagaStats, SagaStatus, SagaStep, StepStatus};
pub use registry::SagaRegistry;
pub use router::{RouteAction, RouteOutcome, SagaEventRouter};
