//! Domain types: batches, records and cycle aggregates.

pub mod cycle;
pub mod ids;
pub mod record;

pub use cycle::{CycleResult, FetchOutcome};
pub use ids::{BatchId, DocumentId};
pub use record::Record;
