//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{LineItem, RecordId, RecordSnapshot, StreamKind, SubRecord, SyncCursor};

/// Trait for the portal's local sync store
///
/// Abstracts over storage backends (SQLite in production, in-memory for
/// tests). All operations are keyed on natural business identity and are
/// safe to re-run: the whole pipeline leans on that instead of transactions
/// spanning a run.
///
/// Ownership rule enforced here: on conflict, an upsert never overwrites the
/// portal-owned columns (`payment_pending`, `portal_note`, `provenance`,
/// `first_seen_at`); fresh upstream data supersedes upstream fields only.
/// A successful upsert also clears any tombstone, since the record evidently
/// exists upstream again.
pub trait SyncStore: Send + Sync {
    /// Insert or update a record snapshot keyed on business ID
    fn upsert_record(&self, record: &RecordSnapshot) -> Result<()>;

    /// Get a record by business ID (tombstoned rows included)
    fn get_record(&self, id: &RecordId) -> Result<Option<RecordSnapshot>>;

    /// Get many records by business ID; missing IDs are simply absent
    fn get_records(&self, ids: &[RecordId]) -> Result<Vec<RecordSnapshot>>;

    /// Business IDs of non-tombstoned records in a stream, ordered by ID,
    /// paged for bounded memory
    fn list_active_ids(&self, stream: StreamKind, limit: usize, offset: usize)
    -> Result<Vec<RecordId>>;

    /// Count of non-tombstoned records in a stream
    fn count_active(&self, stream: StreamKind) -> Result<usize>;

    /// Replace all line items for a parent (delete-by-parent then insert)
    fn replace_lines(&self, parent: &RecordId, lines: &[LineItem]) -> Result<()>;

    /// Replace all sub-records for a parent (delete-by-parent then insert)
    fn replace_sub_records(&self, parent: &RecordId, subs: &[SubRecord]) -> Result<()>;

    /// Line items for a parent, ordered by line number
    fn list_lines(&self, parent: &RecordId) -> Result<Vec<LineItem>>;

    /// Sub-records for a parent, ordered by sub-record ID
    fn list_sub_records(&self, parent: &RecordId) -> Result<Vec<SubRecord>>;

    /// Set the tombstone marker on the given IDs where not already set.
    /// Returns how many rows were newly tombstoned; re-running is a no-op.
    fn tombstone_records(
        &self,
        ids: &[RecordId],
        deleted_at: DateTime<Utc>,
    ) -> Result<usize>;

    /// Get the sync cursor for a stream
    fn get_cursor(&self, stream_key: &str) -> Result<Option<SyncCursor>>;

    /// Save the sync cursor for a stream (upsert)
    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()>;

    /// Clear all data (for testing)
    fn clear(&self) -> Result<()>;
}
