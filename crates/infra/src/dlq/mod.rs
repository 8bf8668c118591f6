//! Dead letter queue: bounded holding area for failed event processing,
//! retried on a backoff schedule until resolved or exhausted.

pub mod backoff;
pub mod handler;
pub mod observer;
pub mod queue;
pub mod store;
pub mod types;

pub use backoff::{BackoffPolicy, BackoffStrategy, UnknownStrategy, should_retry};
pub use handler::{FnRetryHandler, RetryHandler, retry_fn};
pub use observer::{DlqObserver, TracingObserver};
pub use queue::DeadLetterQueue;
pub use types::{DeadLetterEntry, DlqStats, DlqStatus, NewDeadLetter};
