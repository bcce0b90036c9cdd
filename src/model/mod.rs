//! Persisted entities tracked by the status store
//!
//! A batch and its units are created together and from then on the records in
//! the store are the only source of truth about pipeline progress.

mod batch;
mod unit;

pub use batch::{BatchKind, BatchRecord, BatchStatus};
pub use unit::{UnitRecord, UnitStatus};
