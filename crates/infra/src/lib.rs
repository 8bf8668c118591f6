//! Coordination services: the saga coordinator, its event router, and the
//! dead letter queue with backoff scheduling.

pub mod config;
pub mod dlq;
pub mod saga;

pub use config::{ConfigError, DlqConfig};
pub use dlq::{
    BackoffPolicy, BackoffStrategy, DeadLetterEntry, DeadLetterQueue, DlqObserver, DlqStats,
    DlqStatus, NewDeadLetter, RetryHandler, TracingObserver, retry_fn,
};
pub use saga::{
    RouteAction, RouteOutcome, Saga, SagaCoordinator, SagaEventRouter, SagaFilter, SagaRegistry,
    SagaStats, SagaStatus, SagaStep, StepStatus,
};
