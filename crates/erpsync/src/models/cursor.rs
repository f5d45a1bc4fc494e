//! Sync cursor tracking for incremental runs
//!
//! One cursor row per entity stream. The cursor only advances to a value the
//! engine has fully processed; a failed run keeps the previous watermark.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default overlap subtracted from the stored watermark before use, so every
/// run re-scans a small trailing slice of already-processed time (tolerates
/// clock skew and late-arriving upstream writes).
pub const DEFAULT_OVERLAP_MINUTES: i64 = 10;

/// High-water mark for one sync stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Stream key (see `StreamKind::key`)
    pub stream_key: String,
    /// When the last run completed successfully
    pub last_success_at: DateTime<Utc>,
    /// Maximum upstream modification timestamp fully processed so far
    pub last_cursor: DateTime<Utc>,
}

impl SyncCursor {
    pub fn new(
        stream_key: impl Into<String>,
        last_success_at: DateTime<Utc>,
        last_cursor: DateTime<Utc>,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            last_success_at,
            last_cursor,
        }
    }

    /// The lower bound a run should actually query from: the stored watermark
    /// minus the overlap window.
    pub fn effective_since(&self, overlap: Duration) -> DateTime<Utc> {
        self.last_cursor - overlap
    }

    /// Cursor for a run that observed `max_modified` as the newest fully
    /// processed modification timestamp. `None` (nothing observed) keeps the
    /// old watermark; an empty window must not advance past unseen writes.
    pub fn advanced(&self, max_modified: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Self {
            stream_key: self.stream_key.clone(),
            last_success_at: now,
            last_cursor: max_modified.unwrap_or(self.last_cursor).max(self.last_cursor),
        }
    }
}
