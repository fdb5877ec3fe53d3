//! Storage traits for two-factor state.
//!
//! These traits define the persistence collaborators the service depends on.
//! Implement them for your database layer; [`memory`] provides in-memory
//! implementations for tests and single-process development.

pub mod code;
pub mod memory;
pub mod record;

pub use code::{CodeStore, MarkUsed};
pub use memory::{InMemoryCodeStore, InMemoryRecordStore};
pub use record::{RecordStore, SaveOutcome};
