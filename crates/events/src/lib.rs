//! Event transport seam: envelopes and a pub/sub abstraction.
//!
//! The coordination core exposes no subscription mechanism of its own;
//! consumers read from an [`EventBus`] and call into the saga coordinator.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
