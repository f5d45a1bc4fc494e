//! Idempotent batch writer
//!
//! Applies reconciled records to the local store in bounded batches. There
//! is no run-wide transaction: each batch is an independent unit, so a
//! failure mid-run leaves earlier batches committed and the whole run safe
//! to repeat.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{Provenance, RecordId};
use crate::storage::SyncStore;
use crate::sync::diff::FetchedRecord;

/// Rows per batch, sized for store-side payload limits
pub const BATCH_SIZE: usize = 1_000;

/// Counters from one writer pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteStats {
    pub inserted: usize,
    pub updated: usize,
    pub tombstoned: usize,
    pub batches: usize,
}

/// Batch writer over a [`SyncStore`]
pub struct BatchWriter<'a> {
    store: &'a dyn SyncStore,
    batch_size: usize,
}

impl<'a> BatchWriter<'a> {
    pub fn new(store: &'a dyn SyncStore) -> Self {
        Self {
            store,
            batch_size: BATCH_SIZE,
        }
    }

    pub fn with_batch_size(store: &'a dyn SyncStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Upsert new records. Stamps sync provenance and first-seen on the way
    /// in; the store's conflict clause keeps those stamps from clobbering a
    /// row that already exists.
    pub fn write_new(&self, records: &[FetchedRecord], now: DateTime<Utc>) -> Result<WriteStats> {
        let mut stats = WriteStats::default();

        for batch in records.chunks(self.batch_size) {
            for item in batch {
                let mut record = item.record.clone();
                record.local.provenance = Some(Provenance::Sync);
                record.local.first_seen_at = Some(now);

                self.store
                    .upsert_record(&record)
                    .with_context(|| format!("Failed to insert record {}", record.id))?;
                self.write_children(item)?;
                stats.inserted += 1;
            }
            stats.batches += 1;
            log::debug!("[WRITER] insert batch of {} committed", batch.len());
        }

        Ok(stats)
    }

    /// Upsert changed records; portal-owned fields survive via the store's
    /// conflict semantics, children are fully replaced.
    pub fn write_changed(&self, records: &[FetchedRecord]) -> Result<WriteStats> {
        let mut stats = WriteStats::default();

        for batch in records.chunks(self.batch_size) {
            for item in batch {
                self.store
                    .upsert_record(&item.record)
                    .with_context(|| format!("Failed to update record {}", item.record.id))?;
                self.write_children(item)?;
                stats.updated += 1;
            }
            stats.batches += 1;
            log::debug!("[WRITER] update batch of {} committed", batch.len());
        }

        Ok(stats)
    }

    /// Tombstone missing IDs in batches. The store's `deleted_at IS NULL`
    /// precondition makes a repeat pass a no-op.
    pub fn write_tombstones(&self, ids: &[RecordId], now: DateTime<Utc>) -> Result<WriteStats> {
        let mut stats = WriteStats::default();

        for batch in ids.chunks(self.batch_size) {
            stats.tombstoned += self
                .store
                .tombstone_records(batch, now)
                .context("Failed to tombstone batch")?;
            stats.batches += 1;
        }

        if stats.tombstoned > 0 {
            log::info!("[WRITER] tombstoned {} records", stats.tombstoned);
        }
        Ok(stats)
    }

    /// Children never outlive their parent and line sets can shrink, so
    /// both child tables are replaced wholesale per parent.
    fn write_children(&self, item: &FetchedRecord) -> Result<()> {
        self.store
            .replace_lines(&item.record.id, &item.lines)
            .with_context(|| format!("Failed to replace lines for {}", item.record.id))?;
        self.store
            .replace_sub_records(&item.record.id, &item.subs)
            .with_context(|| format!("Failed to replace sub-records for {}", item.record.id))?;
        Ok(())
    }
}

impl WriteStats {
    pub fn merge(&mut self, other: &WriteStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.tombstoned += other.tombstoned;
        self.batches += other.batches;
    }
}
