//! Change-set discovery
//!
//! The ERP has no change-data-capture stream, and no single query is a
//! trustworthy change signal on its own. Discovery runs several independent,
//! overlapping queries and unions their results; each strategy can be
//! disabled individually when one misbehaves in the field.
//!
//! Deletion reconciliation is separate: a chunked presence check over the
//! locally-active IDs, whose absences become tombstone candidates.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::erp::{ErpClient, ErpError};
use crate::models::RecordId;
use crate::sync::stream::{StreamDescriptor, get_str};

/// Per-query ID chunk size, sized to stay under query-length limits
pub const SCOPE_CHUNK: usize = 120;

/// Pause between chunked queries, to stay under the concurrency ceiling
pub const CHUNK_PAUSE: Duration = Duration::from_millis(200);

/// Which discovery strategies run, and how chunking behaves
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub modified_since: bool,
    pub created_in_window: bool,
    pub related_activity: bool,
    pub full_window: bool,
    /// Days the full-window fallback looks back from the cursor
    pub full_window_days: i64,
    pub scope_chunk: usize,
    pub chunk_pause: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            modified_since: true,
            created_in_window: true,
            related_activity: true,
            full_window: true,
            full_window_days: 30,
            scope_chunk: SCOPE_CHUNK,
            chunk_pause: CHUNK_PAUSE,
        }
    }
}

/// Discover the set of upstream IDs that may have changed since `since`.
///
/// `scope` is the caller's customer-ID scope; empty means unscoped. Chunks
/// run sequentially with a short pause, since overlapping scheduled runs are
/// already possible, so this path must not fan out.
pub fn discover_changed_ids(
    client: &ErpClient,
    descriptor: &StreamDescriptor,
    scope: &[String],
    since: chrono::DateTime<chrono::Utc>,
    options: &DiscoveryOptions,
) -> Result<BTreeSet<RecordId>, ErpError> {
    let mut ids = BTreeSet::new();
    let window_start = since - chrono::Duration::days(options.full_window_days);

    for chunk in scope_chunks(scope, options.scope_chunk) {
        let mut statements: Vec<String> = Vec::new();

        if options.modified_since {
            statements.push(descriptor.modified_since_query(chunk, since));
        }
        if options.created_in_window {
            statements.push(descriptor.created_in_window_query(chunk, since));
        }
        if options.related_activity
            && let Some(q) = descriptor.related_activity_query(chunk, since)
        {
            statements.push(q);
        }
        if options.full_window {
            statements.push(descriptor.full_window_query(chunk, window_start));
        }

        for statement in statements {
            collect_ids(client, &statement, &mut ids)?;
            std::thread::sleep(options.chunk_pause);
        }
    }

    log::info!(
        "[DISCOVERY] {} stream: {} candidate IDs since {}",
        descriptor.kind,
        ids.len(),
        since,
    );
    Ok(ids)
}

/// Presence-check `active_ids` upstream; returns the IDs the ERP no longer
/// reports as live (genuinely absent or terminally voided; both tombstone
/// candidates). O(active IDs), chunked, independent of the change-set union.
pub fn find_missing_upstream(
    client: &ErpClient,
    descriptor: &StreamDescriptor,
    active_ids: &[RecordId],
    options: &DiscoveryOptions,
) -> Result<Vec<RecordId>, ErpError> {
    let mut missing = Vec::new();

    for chunk in active_ids.chunks(options.scope_chunk.max(1)) {
        let mut present = BTreeSet::new();
        collect_ids(client, &descriptor.presence_query(chunk), &mut present)?;

        missing.extend(chunk.iter().filter(|id| !present.contains(*id)).cloned());
        std::thread::sleep(options.chunk_pause);
    }

    if !missing.is_empty() {
        log::info!(
            "[DISCOVERY] {} stream: {} locally-active IDs absent upstream",
            descriptor.kind,
            missing.len(),
        );
    }
    Ok(missing)
}

/// Run one ID query and fold its `id` column into `ids`
fn collect_ids(
    client: &ErpClient,
    statement: &str,
    ids: &mut BTreeSet<RecordId>,
) -> Result<(), ErpError> {
    for row in client.query(statement)? {
        if let Some(id) = get_str(&row, "id") {
            ids.insert(RecordId::new(id));
        }
    }
    Ok(())
}

/// Chunk the scope list; an empty scope yields one unscoped pass
fn scope_chunks(scope: &[String], chunk_size: usize) -> Vec<Option<&[String]>> {
    if scope.is_empty() {
        return vec![None];
    }
    scope.chunks(chunk_size.max(1)).map(Some).collect()
}
