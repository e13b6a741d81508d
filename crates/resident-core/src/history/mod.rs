//! Append-only, date-partitioned request history

mod record;
mod store;

pub use record::{ArtifactRef, HistoryRecord, Outcome, RecordDraft, RecordedError, StoredRef};
pub use store::HistoryStore;
