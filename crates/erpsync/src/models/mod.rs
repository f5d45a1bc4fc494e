//! Domain models for the sync pipeline

mod cursor;
mod record;

pub use cursor::{DEFAULT_OVERLAP_MINUTES, SyncCursor};
pub use record::{LineItem, LocalFields, Provenance, RecordId, RecordSnapshot, StreamKind, SubRecord};
