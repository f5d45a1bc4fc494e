//! In-memory storage implementation
//!
//! Backs engine and writer tests without touching disk. Mirrors the SQLite
//! store's conflict semantics exactly, including the portal-owned-field
//! preservation rule, so the two are interchangeable under test.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::SyncStore;
use crate::models::{LineItem, RecordId, RecordSnapshot, StreamKind, SubRecord, SyncCursor};

/// In-memory implementation of SyncStore
pub struct InMemorySyncStore {
    records: RwLock<BTreeMap<String, RecordSnapshot>>,
    lines: RwLock<HashMap<String, Vec<LineItem>>>,
    subs: RwLock<HashMap<String, Vec<SubRecord>>>,
    cursors: RwLock<HashMap<String, SyncCursor>>,
}

impl InMemorySyncStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            lines: RwLock::new(HashMap::new()),
            subs: RwLock::new(HashMap::new()),
            cursors: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore for InMemorySyncStore {
    fn upsert_record(&self, record: &RecordSnapshot) -> Result<()> {
        let mut records = self.records.write().unwrap();
        let mut fresh = record.clone();

        if let Some(existing) = records.get(record.id.as_str()) {
            // Conflict path: portal-owned fields survive, tombstone clears
            fresh.local = existing.local.clone();
            fresh.local.deleted_at = None;
        }

        records.insert(fresh.id.as_str().to_string(), fresh);
        Ok(())
    }

    fn get_record(&self, id: &RecordId) -> Result<Option<RecordSnapshot>> {
        Ok(self.records.read().unwrap().get(id.as_str()).cloned())
    }

    fn get_records(&self, ids: &[RecordId]) -> Result<Vec<RecordSnapshot>> {
        let records = self.records.read().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id.as_str()).cloned())
            .collect())
    }

    fn list_active_ids(
        &self,
        stream: StreamKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RecordId>> {
        let records = self.records.read().unwrap();
        Ok(records
            .values()
            .filter(|r| r.stream == stream && !r.is_tombstoned())
            .skip(offset)
            .take(limit)
            .map(|r| r.id.clone())
            .collect())
    }

    fn count_active(&self, stream: StreamKind) -> Result<usize> {
        let records = self.records.read().unwrap();
        Ok(records
            .values()
            .filter(|r| r.stream == stream && !r.is_tombstoned())
            .count())
    }

    fn replace_lines(&self, parent: &RecordId, lines: &[LineItem]) -> Result<()> {
        let mut map = self.lines.write().unwrap();
        let mut sorted = lines.to_vec();
        sorted.sort_by_key(|l| l.line_no);
        map.insert(parent.as_str().to_string(), sorted);
        Ok(())
    }

    fn replace_sub_records(&self, parent: &RecordId, subs: &[SubRecord]) -> Result<()> {
        let mut map = self.subs.write().unwrap();
        let mut sorted = subs.to_vec();
        sorted.sort_by(|a, b| a.sub_id.cmp(&b.sub_id));
        map.insert(parent.as_str().to_string(), sorted);
        Ok(())
    }

    fn list_lines(&self, parent: &RecordId) -> Result<Vec<LineItem>> {
        Ok(self
            .lines
            .read()
            .unwrap()
            .get(parent.as_str())
            .cloned()
            .unwrap_or_default())
    }

    fn list_sub_records(&self, parent: &RecordId) -> Result<Vec<SubRecord>> {
        Ok(self
            .subs
            .read()
            .unwrap()
            .get(parent.as_str())
            .cloned()
            .unwrap_or_default())
    }

    fn tombstone_records(&self, ids: &[RecordId], deleted_at: DateTime<Utc>) -> Result<usize> {
        let mut records = self.records.write().unwrap();
        let mut changed = 0;

        for id in ids {
            if let Some(record) = records.get_mut(id.as_str())
                && record.local.deleted_at.is_none()
            {
                record.local.deleted_at = Some(deleted_at);
                changed += 1;
            }
        }

        Ok(changed)
    }

    fn get_cursor(&self, stream_key: &str) -> Result<Option<SyncCursor>> {
        Ok(self.cursors.read().unwrap().get(stream_key).cloned())
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.cursors
            .write()
            .unwrap()
            .insert(cursor.stream_key.clone(), cursor.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.records.write().unwrap().clear();
        self.lines.write().unwrap().clear();
        self.subs.write().unwrap().clear();
        self.cursors.write().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LocalFields, Provenance};

    fn record(id: &str, stream: StreamKind) -> RecordSnapshot {
        RecordSnapshot::new(id, format!("TRX-{id}"), stream)
    }

    #[test]
    fn test_upsert_preserves_portal_fields() {
        let store = InMemorySyncStore::new();

        let mut first = record("1", StreamKind::Invoice);
        first.local = LocalFields {
            payment_pending: true,
            portal_note: Some("called customer".to_string()),
            provenance: Some(Provenance::Portal),
            first_seen_at: Some(Utc::now()),
            deleted_at: None,
        };
        store.upsert_record(&first).unwrap();

        // Fresh upstream fetch knows nothing about portal state
        let mut second = record("1", StreamKind::Invoice);
        second.amount_remaining = 99.0;
        store.upsert_record(&second).unwrap();

        let stored = store.get_record(&RecordId::new("1")).unwrap().unwrap();
        assert_eq!(stored.amount_remaining, 99.0);
        assert!(stored.local.payment_pending);
        assert_eq!(stored.local.portal_note.as_deref(), Some("called customer"));
        assert_eq!(stored.local.provenance, Some(Provenance::Portal));
    }

    #[test]
    fn test_upsert_clears_tombstone_on_reappearance() {
        let store = InMemorySyncStore::new();
        store.upsert_record(&record("1", StreamKind::Invoice)).unwrap();
        store
            .tombstone_records(&[RecordId::new("1")], Utc::now())
            .unwrap();
        assert!(store.get_record(&RecordId::new("1")).unwrap().unwrap().is_tombstoned());

        store.upsert_record(&record("1", StreamKind::Invoice)).unwrap();
        assert!(!store.get_record(&RecordId::new("1")).unwrap().unwrap().is_tombstoned());
    }

    #[test]
    fn test_tombstone_is_idempotent() {
        let store = InMemorySyncStore::new();
        store.upsert_record(&record("1", StreamKind::Invoice)).unwrap();
        store.upsert_record(&record("2", StreamKind::Invoice)).unwrap();

        let ids = vec![RecordId::new("1"), RecordId::new("2")];
        assert_eq!(store.tombstone_records(&ids, Utc::now()).unwrap(), 2);
        // Second pass touches nothing
        assert_eq!(store.tombstone_records(&ids, Utc::now()).unwrap(), 0);
    }

    #[test]
    fn test_active_listing_excludes_tombstones_and_other_streams() {
        let store = InMemorySyncStore::new();
        store.upsert_record(&record("1", StreamKind::Invoice)).unwrap();
        store.upsert_record(&record("2", StreamKind::Invoice)).unwrap();
        store.upsert_record(&record("3", StreamKind::Fulfillment)).unwrap();
        store
            .tombstone_records(&[RecordId::new("2")], Utc::now())
            .unwrap();

        let active = store.list_active_ids(StreamKind::Invoice, 100, 0).unwrap();
        assert_eq!(active, vec![RecordId::new("1")]);
        assert_eq!(store.count_active(StreamKind::Invoice).unwrap(), 1);
        assert_eq!(store.count_active(StreamKind::Fulfillment).unwrap(), 1);
    }

    #[test]
    fn test_replace_lines_shrinks() {
        let store = InMemorySyncStore::new();
        let parent = RecordId::new("1");
        let line = |n: i64| LineItem {
            parent_id: parent.clone(),
            line_no: n,
            item: "widget".to_string(),
            description: None,
            quantity: 1.0,
            rate: 10.0,
            amount: 10.0,
            extra: BTreeMap::new(),
        };

        store.replace_lines(&parent, &[line(1), line(2), line(3)]).unwrap();
        assert_eq!(store.list_lines(&parent).unwrap().len(), 3);

        store.replace_lines(&parent, &[line(1)]).unwrap();
        assert_eq!(store.list_lines(&parent).unwrap().len(), 1);
    }

    #[test]
    fn test_cursor_round_trip() {
        let store = InMemorySyncStore::new();
        assert!(store.get_cursor("invoice").unwrap().is_none());

        let cursor = SyncCursor::new("invoice", Utc::now(), Utc::now());
        store.save_cursor(&cursor).unwrap();
        assert_eq!(store.get_cursor("invoice").unwrap(), Some(cursor));
    }
}
