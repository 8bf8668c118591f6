//! `tradeflow-core`: identifiers, payload maps and the error taxonomy shared
//! by the coordination components.
//!
//! This crate is pure: no IO, no async, no clocks beyond id generation.

pub mod data;
pub mod error;
pub mod id;

pub use data::{DataMap, into_data_map, merge_data};
pub use error::{CoordinationError, CoordinationResult};
pub use id::{CorrelationId, EntryId, EventId, SagaId};
