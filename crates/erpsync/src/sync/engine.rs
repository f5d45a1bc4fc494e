//! Sync engine orchestration
//!
//! One engine, two paths:
//! - incremental: change-set discovery → per-ID detail queries → diff → write
//! - snapshot: manifest → bulk export files → diff → write
//!
//! Both converge on the same writer and cursor store. A run is a short-lived
//! job: sequential ID batches (the ERP's concurrency ceiling is low), no
//! cross-run locking; safety comes from idempotent upserts and the
//! watermark, not mutual exclusion.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::erp::{ErpClient, fetch_parts, resolve_manifest};
use crate::models::{DEFAULT_OVERLAP_MINUTES, RecordId, SyncCursor};
use crate::storage::SyncStore;
use crate::sync::diff::{DiffOutcome, DiffPolicy, FetchedRecord, reconcile};
use crate::sync::discovery::{DiscoveryOptions, discover_changed_ids, find_missing_upstream};
use crate::sync::notify::{LogNotifier, NotificationEvent, Notifier};
use crate::sync::stream::{StreamDescriptor, parse_jsonl};
use crate::sync::writer::{BATCH_SIZE, BatchWriter, WriteStats};

/// Active-ID listing page size when walking the local store
const ACTIVE_PAGE: usize = 1_000;

/// How a run decides what to look at
#[derive(Debug, Clone)]
pub enum SyncMode {
    /// Normal scheduled run from the stored cursor
    Incremental,
    /// Forced rescan, optionally from a caller-supplied date
    FullRescan { since: Option<DateTime<Utc>> },
    /// Operator-supplied explicit ID list
    Explicit { ids: Vec<RecordId> },
}

/// Per-run options (the job trigger surface fills these in)
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: SyncMode,
    /// Discover and diff but write nothing
    pub dry_run: bool,
    /// Customer-ID scope this portal instance serves; empty = unscoped
    pub scope: Vec<String>,
    /// Overlap subtracted from the stored cursor before use
    pub overlap: Duration,
    pub policy: DiffPolicy,
    pub batch_size: usize,
    /// IDs per detail-fetch query
    pub detail_chunk: usize,
    /// In-flight ceiling for detail enrichment queries
    pub enrichment_parallelism: usize,
    pub discovery: DiscoveryOptions,
    /// Lookback for first-ever runs with no stored cursor
    pub initial_lookback_days: i64,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Incremental,
            dry_run: false,
            scope: Vec::new(),
            overlap: Duration::minutes(DEFAULT_OVERLAP_MINUTES),
            policy: DiffPolicy::default(),
            batch_size: BATCH_SIZE,
            detail_chunk: crate::sync::discovery::SCOPE_CHUNK,
            enrichment_parallelism: 5,
            discovery: DiscoveryOptions::default(),
            initial_lookback_days: 365,
        }
    }
}

/// Statistics from one sync run
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub stream_key: String,
    /// Candidate IDs the change-set union produced
    pub discovered: usize,
    /// Records actually fetched with detail
    pub fetched: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Tombstone candidates after grace exemptions
    pub missing: usize,
    pub exempted: usize,
    /// Rows actually tombstoned (0 on dry runs and re-runs)
    pub tombstoned: usize,
    pub batches: usize,
    pub notifications: usize,
    pub cursor_advanced_to: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub duration_ms: u64,
}

/// The generic sync engine, instantiated once per stream invocation
pub struct SyncEngine {
    client: ErpClient,
    store: Arc<dyn SyncStore>,
    notifier: Box<dyn Notifier>,
}

impl SyncEngine {
    pub fn new(client: ErpClient, store: Arc<dyn SyncStore>) -> Self {
        Self {
            client,
            store,
            notifier: Box::new(LogNotifier),
        }
    }

    pub fn with_notifier(
        client: ErpClient,
        store: Arc<dyn SyncStore>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            client,
            store,
            notifier,
        }
    }

    /// Run the incremental path for one stream.
    ///
    /// Idempotent: interrupted or overlapping invocations may redo work but
    /// never corrupt state, and the cursor only advances on full success.
    pub fn run(&self, descriptor: &StreamDescriptor, options: &SyncOptions) -> Result<SyncReport> {
        let start = std::time::Instant::now();
        let now = Utc::now();
        let stream_key = descriptor.kind.key();

        let cursor = self.load_cursor(stream_key, options, now)?;
        let since = cursor.effective_since(options.overlap);

        // 1. What might have changed? A run may only advance the watermark
        // if its scan window starts at or before the stored cursor; anything
        // narrower (an explicit ID list, a rescan from a later date) leaves
        // unscanned time behind and must not move the cursor past it.
        let (change_set, advances_cursor): (BTreeSet<RecordId>, bool) = match &options.mode {
            SyncMode::Explicit { ids } => (ids.iter().cloned().collect(), false),
            SyncMode::Incremental => (
                discover_changed_ids(
                    &self.client,
                    descriptor,
                    &options.scope,
                    since,
                    &options.discovery,
                )?,
                true,
            ),
            SyncMode::FullRescan { since: override_since } => {
                let rescan_from = override_since
                    .unwrap_or_else(|| now - Duration::days(options.initial_lookback_days));
                (
                    discover_changed_ids(
                        &self.client,
                        descriptor,
                        &options.scope,
                        rescan_from,
                        &options.discovery,
                    )?,
                    rescan_from <= cursor.last_cursor,
                )
            }
        };

        // 2. Fetch full detail for the candidates
        let ids: Vec<RecordId> = change_set.iter().cloned().collect();
        let mut fetched = self.fetch_details(descriptor, &ids, options)?;
        self.enrich_details(descriptor, &mut fetched, options);

        // 3. Which locally-active records does upstream no longer report?
        // Independent of the change set; an empty change set still runs it.
        let active = self.in_scope_active_ids(descriptor, options)?;
        let missing_candidates =
            find_missing_upstream(&self.client, descriptor, &active, &options.discovery)?;

        let max_modified = fetched
            .iter()
            .filter_map(|f| f.record.last_modified_at)
            .max();

        // 4. Classify
        let outcome = reconcile(
            self.store.as_ref(),
            fetched,
            missing_candidates,
            &options.policy,
            now,
        )?;

        // 5. Apply
        let mut report = self.apply(descriptor, &outcome, options, now)?;
        report.stream_key = stream_key.to_string();
        report.discovered = change_set.len();
        report.fetched = outcome.new.len() + outcome.changed.len() + outcome.unchanged.len();

        // 6. Advance the watermark only after everything above succeeded,
        // only for runs that scanned from the cursor onward, and only to a
        // timestamp actually observed, never "now".
        if !options.dry_run && advances_cursor {
            let next = cursor.advanced(max_modified, now);
            self.store.save_cursor(&next).context("Failed to save sync cursor")?;
            report.cursor_advanced_to = Some(next.last_cursor);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        log::info!(
            "[SYNC] {} run: {} discovered, {} new, {} changed, {} unchanged, {} tombstoned in {}ms{}",
            stream_key,
            report.discovered,
            report.new,
            report.changed,
            report.unchanged,
            report.tombstoned,
            report.duration_ms,
            if report.dry_run { " (dry run)" } else { "" },
        );
        Ok(report)
    }

    /// Run the manifest-driven snapshot path for one stream.
    ///
    /// Manifest problems ([`crate::erp::ManifestError`]) abort the whole
    /// path and surface to the caller.
    pub fn run_snapshot(
        &self,
        descriptor: &StreamDescriptor,
        folder: &str,
        options: &SyncOptions,
    ) -> Result<SyncReport> {
        let start = std::time::Instant::now();
        let now = Utc::now();
        let stream_key = descriptor.kind.key();

        let cursor = self.load_cursor(stream_key, options, now)?;

        let manifest = resolve_manifest(&self.client, folder, descriptor.required_datasets)?;

        let headers_text = fetch_parts(&self.client, manifest.parts("headers").unwrap_or_default())?;
        let lines_text = fetch_parts(&self.client, manifest.parts("lines").unwrap_or_default())?;
        let subs_text = match manifest.parts("applications") {
            Some(parts) if descriptor.has_sub_records => fetch_parts(&self.client, parts)?,
            _ => String::new(),
        };

        let mut by_id: HashMap<String, FetchedRecord> = HashMap::new();
        for row in parse_jsonl(&headers_text) {
            match descriptor.parse_header_row(&row) {
                Ok(record) => {
                    by_id.insert(record.id.as_str().to_string(), FetchedRecord::new(record));
                }
                Err(e) => log::warn!("[SYNC] skipping snapshot header: {}", e),
            }
        }
        for row in parse_jsonl(&lines_text) {
            match descriptor.parse_line_row(&row) {
                Ok(line) => {
                    if let Some(item) = by_id.get_mut(line.parent_id.as_str()) {
                        item.lines.push(line);
                    }
                }
                Err(e) => log::warn!("[SYNC] skipping snapshot line: {}", e),
            }
        }
        for row in parse_jsonl(&subs_text) {
            match descriptor.parse_sub_row(&row) {
                Ok(sub) => {
                    if let Some(item) = by_id.get_mut(sub.parent_id.as_str()) {
                        item.subs.push(sub);
                    }
                }
                Err(e) => log::warn!("[SYNC] skipping snapshot sub-record: {}", e),
            }
        }

        // A full snapshot is authoritative for its scope: any active local
        // ID it omits is a tombstone candidate.
        let active = self.in_scope_active_ids(descriptor, options)?;
        let missing_candidates: Vec<RecordId> = active
            .into_iter()
            .filter(|id| !by_id.contains_key(id.as_str()))
            .collect();

        let fetched: Vec<FetchedRecord> = by_id.into_values().collect();
        let max_modified = fetched
            .iter()
            .filter_map(|f| f.record.last_modified_at)
            .max();
        let total = fetched.len();

        let outcome = reconcile(
            self.store.as_ref(),
            fetched,
            missing_candidates,
            &options.policy,
            now,
        )?;

        let mut report = self.apply(descriptor, &outcome, options, now)?;
        report.stream_key = stream_key.to_string();
        report.discovered = total;
        report.fetched = total;

        if !options.dry_run {
            let next = cursor.advanced(max_modified, now);
            self.store.save_cursor(&next).context("Failed to save sync cursor")?;
            report.cursor_advanced_to = Some(next.last_cursor);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        log::info!(
            "[SYNC] {} snapshot: {} in export, {} new, {} changed, {} tombstoned in {}ms",
            stream_key,
            total,
            report.new,
            report.changed,
            report.tombstoned,
            report.duration_ms,
        );
        Ok(report)
    }

    fn load_cursor(
        &self,
        stream_key: &str,
        options: &SyncOptions,
        now: DateTime<Utc>,
    ) -> Result<SyncCursor> {
        match self.store.get_cursor(stream_key)? {
            Some(cursor) => Ok(cursor),
            None => Ok(SyncCursor::new(
                stream_key,
                now,
                now - Duration::days(options.initial_lookback_days),
            )),
        }
    }

    /// Fetch headers, lines, and sub-records for a set of IDs in sequential
    /// chunks (the concurrency ceiling is the ERP's, not ours to spend).
    fn fetch_details(
        &self,
        descriptor: &StreamDescriptor,
        ids: &[RecordId],
        options: &SyncOptions,
    ) -> Result<Vec<FetchedRecord>> {
        let mut by_id: HashMap<String, FetchedRecord> = HashMap::new();

        for chunk in ids.chunks(options.detail_chunk.max(1)) {
            for row in self.client.query(&descriptor.headers_query(chunk))? {
                match descriptor.parse_header_row(&row) {
                    Ok(record) => {
                        by_id.insert(record.id.as_str().to_string(), FetchedRecord::new(record));
                    }
                    Err(e) => log::warn!("[SYNC] skipping header row: {}", e),
                }
            }

            for row in self.client.query(&descriptor.lines_query(chunk))? {
                match descriptor.parse_line_row(&row) {
                    Ok(line) => {
                        if let Some(item) = by_id.get_mut(line.parent_id.as_str()) {
                            item.lines.push(line);
                        }
                    }
                    Err(e) => log::warn!("[SYNC] skipping line row: {}", e),
                }
            }

            if let Some(statement) = descriptor.subs_query(chunk) {
                for row in self.client.query(&statement)? {
                    match descriptor.parse_sub_row(&row) {
                        Ok(sub) => {
                            if let Some(item) = by_id.get_mut(sub.parent_id.as_str()) {
                                item.subs.push(sub);
                            }
                        }
                        Err(e) => log::warn!("[SYNC] skipping sub-record row: {}", e),
                    }
                }
            }

            std::thread::sleep(options.discovery.chunk_pause);
        }

        Ok(by_id.into_values().collect())
    }

    /// Per-record detail enrichment with a small bounded pool. Failures are
    /// logged and skipped; enrichment never fails a run.
    fn enrich_details(
        &self,
        descriptor: &StreamDescriptor,
        fetched: &mut [FetchedRecord],
        options: &SyncOptions,
    ) {
        let Some(field) = descriptor.enrichment_field else {
            return;
        };
        if fetched.is_empty() || options.enrichment_parallelism == 0 {
            return;
        }

        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(options.enrichment_parallelism)
            .build()
        {
            Ok(pool) => pool,
            Err(e) => {
                log::warn!("[SYNC] enrichment pool unavailable, skipping: {}", e);
                return;
            }
        };

        pool.install(|| {
            fetched.par_iter_mut().for_each(|item| {
                let Some(statement) = descriptor.enrichment_query(&item.record.id) else {
                    return;
                };
                match self.client.query(&statement) {
                    Ok(rows) => {
                        let detail = Value::Array(rows.into_iter().map(Value::Object).collect());
                        item.record.extra.insert(field.to_string(), detail);
                    }
                    Err(e) => {
                        log::warn!("[SYNC] enrichment failed for {}: {}", item.record.id, e);
                    }
                }
            });
        });
    }

    /// Locally-active IDs the deletion reconciliation should cover
    fn in_scope_active_ids(
        &self,
        descriptor: &StreamDescriptor,
        options: &SyncOptions,
    ) -> Result<Vec<RecordId>> {
        let mut active = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .list_active_ids(descriptor.kind, ACTIVE_PAGE, offset)?;
            let len = page.len();
            active.extend(page);
            if len < ACTIVE_PAGE {
                break;
            }
            offset += len;
        }

        // An explicit-ID run only reconciles deletions within its own scope
        if let SyncMode::Explicit { ids } = &options.mode {
            let requested: BTreeSet<&str> = ids.iter().map(|id| id.as_str()).collect();
            active.retain(|id| requested.contains(id.as_str()));
        }

        Ok(active)
    }

    /// Write the reconciled outcome (unless dry-run) and emit notifications
    fn apply(
        &self,
        descriptor: &StreamDescriptor,
        outcome: &DiffOutcome,
        options: &SyncOptions,
        now: DateTime<Utc>,
    ) -> Result<SyncReport> {
        let mut report = SyncReport {
            new: outcome.new.len(),
            changed: outcome.changed.len(),
            unchanged: outcome.unchanged.len(),
            missing: outcome.missing.len(),
            exempted: outcome.exempted.len(),
            dry_run: options.dry_run,
            ..SyncReport::default()
        };

        if options.dry_run {
            return Ok(report);
        }

        let writer = BatchWriter::with_batch_size(self.store.as_ref(), options.batch_size);
        let mut stats = WriteStats::default();
        stats.merge(&writer.write_new(&outcome.new, now)?);
        stats.merge(&writer.write_changed(&outcome.changed)?);
        stats.merge(&writer.write_tombstones(&outcome.missing, now)?);
        report.tombstoned = stats.tombstoned;
        report.batches = stats.batches;

        // Fire-and-forget: a notification failure never fails the run
        for item in &outcome.new {
            if !item.record.has_open_balance() {
                continue;
            }
            let event = NotificationEvent {
                stream: descriptor.kind,
                record_id: item.record.id.clone(),
                tran_id: item.record.tran_id.clone(),
                customer_id: item.record.customer_id.clone(),
                amount_remaining: item.record.amount_remaining,
            };
            if let Err(e) = self.notifier.notify(&event) {
                log::warn!("[SYNC] notification for {} failed: {}", item.record.id, e);
            }
            report.notifications += 1;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::{ErpRequest, ErpResponse, ErpTransport, ManifestError, TransportError};
    use crate::models::{Provenance, RecordSnapshot, StreamKind};
    use crate::storage::InMemorySyncStore;
    use crate::sync::notify::Notifier;
    use crate::sync::stream::{invoices, sales_orders};
    use serde_json::{Map, json};
    use std::sync::Mutex;

    /// Routed fake ERP: answers queries by statement shape and serves files
    /// through the page protocol, like a tiny scripted backend.
    #[derive(Default)]
    struct FakeErp {
        headers: Vec<Map<String, Value>>,
        lines: Vec<Map<String, Value>>,
        subs: Vec<Map<String, Value>>,
        /// IDs the presence check reports as live
        live_ids: Vec<String>,
        /// IDs every discovery strategy returns
        changed_ids: Vec<String>,
        /// file_id -> file content lines, for the snapshot path
        files: Vec<(String, Vec<String>)>,
        manifest_file_id: Option<String>,
    }

    impl FakeErp {
        fn row_matches(statement: &str, row: &Map<String, Value>) -> bool {
            row.get("id")
                .and_then(|v| v.as_str())
                .is_some_and(|id| statement.contains(&format!("'{id}'")))
        }
    }

    impl ErpTransport for FakeErp {
        fn execute(&self, req: &ErpRequest) -> Result<ErpResponse, TransportError> {
            let body = match req {
                ErpRequest::Query { statement } => {
                    let items: Vec<Value> = if statement.contains("FROM file WHERE folder") {
                        self.manifest_file_id
                            .iter()
                            .map(|id| json!({"id": id}))
                            .collect()
                    } else if statement.contains("transaction_line") {
                        self.lines
                            .iter()
                            .filter(|r| Self::row_matches(statement, r))
                            .map(|r| Value::Object(r.clone()))
                            .collect()
                    } else if statement.contains("transaction_application") {
                        self.subs
                            .iter()
                            .filter(|r| Self::row_matches(statement, r))
                            .map(|r| Value::Object(r.clone()))
                            .collect()
                    } else if statement.contains("status NOT IN") {
                        self.live_ids
                            .iter()
                            .filter(|id| statement.contains(&format!("'{id}'")))
                            .map(|id| json!({"id": id}))
                            .collect()
                    } else if statement.contains("SELECT id, tranid") {
                        self.headers
                            .iter()
                            .filter(|r| Self::row_matches(statement, r))
                            .map(|r| Value::Object(r.clone()))
                            .collect()
                    } else {
                        // Discovery strategies
                        self.changed_ids.iter().map(|id| json!({"id": id})).collect()
                    };
                    json!({ "items": items }).to_string()
                }
                ErpRequest::FilePage(page) => {
                    let lines = self
                        .files
                        .iter()
                        .find(|(id, _)| *id == page.file_id)
                        .map(|(_, lines)| lines)
                        .ok_or_else(|| TransportError(format!("no such file {}", page.file_id)))?;
                    let start = page.line_start as usize;
                    let slice: Vec<&str> = lines
                        .iter()
                        .skip(start)
                        .take(page.max_lines as usize)
                        .map(|s| s.as_str())
                        .collect();
                    json!({
                        "ok": true,
                        "data": slice.join("\n"),
                        "linesReturned": slice.len() as u64,
                        "done": start + slice.len() >= lines.len(),
                    })
                    .to_string()
                }
            };
            Ok(ErpResponse {
                status: 200,
                retry_after: None,
                body,
            })
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        events: Mutex<Vec<NotificationEvent>>,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, event: &NotificationEvent) -> Result<()> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn header_row(id: &str, remaining: f64) -> Map<String, Value> {
        json!({
            "id": id,
            "tranid": format!("INV-{id}"),
            "entity": "7",
            "status": "Open",
            "trandate": "2026-08-01",
            "total": 250.0,
            "amountremaining": remaining,
            "lastmodifieddate": "2026-08-02 10:15:30",
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn line_row(parent: &str, line_no: i64) -> Map<String, Value> {
        json!({
            "id": parent,
            "line": line_no,
            "item": "widget",
            "quantity": 1.0,
            "rate": 125.0,
            "amount": 125.0,
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn fast_options() -> SyncOptions {
        SyncOptions {
            discovery: DiscoveryOptions {
                chunk_pause: std::time::Duration::ZERO,
                ..DiscoveryOptions::default()
            },
            ..SyncOptions::default()
        }
    }

    fn engine_with(
        fake: FakeErp,
        store: Arc<InMemorySyncStore>,
        notifier: Arc<CountingNotifier>,
    ) -> SyncEngine {
        struct Forward(Arc<CountingNotifier>);
        impl Notifier for Forward {
            fn notify(&self, event: &NotificationEvent) -> Result<()> {
                self.0.notify(event)
            }
        }
        SyncEngine::with_notifier(
            ErpClient::new(Arc::new(fake)),
            store,
            Box::new(Forward(notifier)),
        )
    }

    fn active_record(id: &str, provenance: Provenance, first_seen: DateTime<Utc>) -> RecordSnapshot {
        let mut rec = RecordSnapshot::new(id, format!("INV-{id}"), StreamKind::Invoice);
        rec.status = "Open".to_string();
        rec.local.provenance = Some(provenance);
        rec.local.first_seen_at = Some(first_seen);
        rec
    }

    #[test]
    fn test_first_run_inserts_and_notifies() {
        let fake = FakeErp {
            headers: vec![header_row("100", 250.0)],
            lines: vec![line_row("100", 1), line_row("100", 2)],
            live_ids: vec!["100".to_string()],
            changed_ids: vec!["100".to_string()],
            ..FakeErp::default()
        };
        let store = Arc::new(InMemorySyncStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let engine = engine_with(fake, store.clone(), notifier.clone());

        let report = engine.run(&invoices(), &fast_options()).unwrap();
        assert_eq!(report.new, 1);
        assert_eq!(report.tombstoned, 0);
        assert_eq!(report.notifications, 1);

        let stored = store.get_record(&RecordId::new("100")).unwrap().unwrap();
        assert_eq!(stored.amount_remaining, 250.0);
        assert_eq!(stored.local.provenance, Some(Provenance::Sync));
        assert_eq!(store.list_lines(&RecordId::new("100")).unwrap().len(), 2);

        let events = notifier.events.lock().unwrap();
        assert_eq!(events[0].tran_id, "INV-100");
    }

    #[test]
    fn test_rerun_converges_to_unchanged() {
        let fake = FakeErp {
            headers: vec![header_row("100", 250.0)],
            lines: vec![line_row("100", 1)],
            live_ids: vec!["100".to_string()],
            changed_ids: vec!["100".to_string()],
            ..FakeErp::default()
        };
        let store = Arc::new(InMemorySyncStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let engine = engine_with(fake, store.clone(), notifier.clone());

        engine.run(&invoices(), &fast_options()).unwrap();
        let second = engine.run(&invoices(), &fast_options()).unwrap();
        assert_eq!(second.new, 0);
        assert_eq!(second.changed, 0);
        assert_eq!(second.unchanged, 1);
        // Only the first sighting notifies
        assert_eq!(notifier.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_upstream_is_tombstoned() {
        let store = Arc::new(InMemorySyncStore::new());
        store
            .upsert_record(&active_record(
                "200",
                Provenance::Sync,
                Utc::now() - Duration::days(30),
            ))
            .unwrap();

        let engine = engine_with(
            FakeErp::default(),
            store.clone(),
            Arc::new(CountingNotifier::default()),
        );
        let report = engine.run(&invoices(), &fast_options()).unwrap();

        assert_eq!(report.tombstoned, 1);
        assert_eq!(store.count_active(StreamKind::Invoice).unwrap(), 0);
        // The row still exists, soft-deleted
        let rec = store.get_record(&RecordId::new("200")).unwrap().unwrap();
        assert!(rec.is_tombstoned());
    }

    #[test]
    fn test_portal_record_in_grace_survives() {
        let store = Arc::new(InMemorySyncStore::new());
        store
            .upsert_record(&active_record(
                "300",
                Provenance::Portal,
                Utc::now() - Duration::minutes(10),
            ))
            .unwrap();

        let engine = engine_with(
            FakeErp::default(),
            store.clone(),
            Arc::new(CountingNotifier::default()),
        );
        let report = engine.run(&invoices(), &fast_options()).unwrap();

        assert_eq!(report.exempted, 1);
        assert_eq!(report.tombstoned, 0);
        assert_eq!(store.count_active(StreamKind::Invoice).unwrap(), 1);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let fake = FakeErp {
            headers: vec![header_row("100", 250.0)],
            live_ids: vec!["100".to_string()],
            changed_ids: vec!["100".to_string()],
            ..FakeErp::default()
        };
        let store = Arc::new(InMemorySyncStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let engine = engine_with(fake, store.clone(), notifier.clone());

        let options = SyncOptions {
            dry_run: true,
            ..fast_options()
        };
        let report = engine.run(&invoices(), &options).unwrap();

        assert_eq!(report.new, 1);
        assert!(report.dry_run);
        assert!(store.get_record(&RecordId::new("100")).unwrap().is_none());
        assert!(store.get_cursor("invoice").unwrap().is_none());
        assert!(notifier.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_explicit_mode_scopes_deletion_check() {
        let store = Arc::new(InMemorySyncStore::new());
        // Active locally, absent upstream, but outside the explicit scope
        store
            .upsert_record(&active_record(
                "200",
                Provenance::Sync,
                Utc::now() - Duration::days(30),
            ))
            .unwrap();

        let fake = FakeErp {
            headers: vec![header_row("100", 0.0)],
            live_ids: vec!["100".to_string()],
            ..FakeErp::default()
        };
        let engine = engine_with(fake, store.clone(), Arc::new(CountingNotifier::default()));

        let options = SyncOptions {
            mode: SyncMode::Explicit {
                ids: vec![RecordId::new("100")],
            },
            ..fast_options()
        };
        let report = engine.run(&invoices(), &options).unwrap();

        assert_eq!(report.new, 1);
        assert_eq!(report.tombstoned, 0);
        assert_eq!(store.count_active(StreamKind::Invoice).unwrap(), 2);
    }

    #[test]
    fn test_cursor_advances_to_observed_modified_time() {
        let fake = FakeErp {
            headers: vec![header_row("100", 250.0)],
            live_ids: vec!["100".to_string()],
            changed_ids: vec!["100".to_string()],
            ..FakeErp::default()
        };
        let store = Arc::new(InMemorySyncStore::new());
        let engine = engine_with(fake, store.clone(), Arc::new(CountingNotifier::default()));

        let report = engine.run(&invoices(), &fast_options()).unwrap();

        let expected = chrono::NaiveDate::from_ymd_opt(2026, 8, 2)
            .unwrap()
            .and_hms_opt(10, 15, 30)
            .unwrap()
            .and_utc();
        assert_eq!(report.cursor_advanced_to, Some(expected));
        let cursor = store.get_cursor("invoice").unwrap().unwrap();
        assert_eq!(cursor.last_cursor, expected);
    }

    #[test]
    fn test_cursor_never_regresses() {
        let store = Arc::new(InMemorySyncStore::new());
        let ahead = chrono::NaiveDate::from_ymd_opt(2026, 9, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        store
            .save_cursor(&SyncCursor::new("invoice", Utc::now(), ahead))
            .unwrap();

        // Observed modification time is older than the stored cursor
        let fake = FakeErp {
            headers: vec![header_row("100", 250.0)],
            live_ids: vec!["100".to_string()],
            changed_ids: vec!["100".to_string()],
            ..FakeErp::default()
        };
        let engine = engine_with(fake, store.clone(), Arc::new(CountingNotifier::default()));
        engine.run(&invoices(), &fast_options()).unwrap();

        let cursor = store.get_cursor("invoice").unwrap().unwrap();
        assert_eq!(cursor.last_cursor, ahead);
    }

    #[test]
    fn test_explicit_run_leaves_cursor_untouched() {
        let store = Arc::new(InMemorySyncStore::new());
        let stored = chrono::NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        store
            .save_cursor(&SyncCursor::new("invoice", stored, stored))
            .unwrap();

        // The one requested record was modified months past the cursor; an
        // explicit run never scanned the gap, so the watermark must not jump
        // over it.
        let fake = FakeErp {
            headers: vec![header_row("100", 250.0)],
            live_ids: vec!["100".to_string()],
            ..FakeErp::default()
        };
        let engine = engine_with(fake, store.clone(), Arc::new(CountingNotifier::default()));

        let options = SyncOptions {
            mode: SyncMode::Explicit {
                ids: vec![RecordId::new("100")],
            },
            ..fast_options()
        };
        let report = engine.run(&invoices(), &options).unwrap();

        assert_eq!(report.new, 1);
        assert_eq!(report.cursor_advanced_to, None);
        let cursor = store.get_cursor("invoice").unwrap().unwrap();
        assert_eq!(cursor.last_cursor, stored);
    }

    #[test]
    fn test_rescan_advances_cursor_only_from_covered_window() {
        let stored = chrono::NaiveDate::from_ymd_opt(2026, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        let observed = chrono::NaiveDate::from_ymd_opt(2026, 8, 2)
            .unwrap()
            .and_hms_opt(10, 15, 30)
            .unwrap()
            .and_utc();

        let run_rescan = |since: DateTime<Utc>| {
            let store = Arc::new(InMemorySyncStore::new());
            store
                .save_cursor(&SyncCursor::new("invoice", stored, stored))
                .unwrap();
            let fake = FakeErp {
                headers: vec![header_row("100", 250.0)],
                live_ids: vec!["100".to_string()],
                changed_ids: vec!["100".to_string()],
                ..FakeErp::default()
            };
            let engine = engine_with(fake, store.clone(), Arc::new(CountingNotifier::default()));
            let options = SyncOptions {
                mode: SyncMode::FullRescan { since: Some(since) },
                ..fast_options()
            };
            engine.run(&invoices(), &options).unwrap();
            store.get_cursor("invoice").unwrap().unwrap().last_cursor
        };

        // Rescanning from before the cursor covers the whole gap: advance
        assert_eq!(run_rescan(stored - Duration::days(30)), observed);
        // Rescanning from after the cursor leaves a gap: hold position
        assert_eq!(run_rescan(stored + Duration::days(90)), stored);
    }

    #[test]
    fn test_snapshot_reconciles_against_export() {
        let manifest = json!({
            "headers": {"id": "h1", "name": "headers.jsonl", "rows": 2},
            "lines": {"id": "l1", "name": "lines.jsonl", "rows": 1},
        })
        .to_string();
        let fake = FakeErp {
            manifest_file_id: Some("m1".to_string()),
            files: vec![
                ("m1".to_string(), vec![manifest]),
                (
                    "h1".to_string(),
                    vec![
                        json!({"id": "1", "tranid": "SO-1", "entity": "7", "status": "Open",
                               "total": 50.0, "amountremaining": 0.0,
                               "lastmodifieddate": "2026-08-02 09:00:00"})
                        .to_string(),
                        json!({"id": "2", "tranid": "SO-2", "entity": "7", "status": "Open",
                               "total": 80.0, "amountremaining": 0.0,
                               "lastmodifieddate": "2026-08-02 11:00:00"})
                        .to_string(),
                    ],
                ),
                (
                    "l1".to_string(),
                    vec![
                        json!({"id": "1", "line": 1, "item": "widget",
                               "quantity": 1.0, "rate": 50.0, "amount": 50.0})
                        .to_string(),
                    ],
                ),
            ],
            ..FakeErp::default()
        };

        let store = Arc::new(InMemorySyncStore::new());
        // Active locally but absent from the export
        let mut stale = RecordSnapshot::new("3", "SO-3", StreamKind::SalesOrder);
        stale.local.provenance = Some(Provenance::Sync);
        stale.local.first_seen_at = Some(Utc::now() - Duration::days(30));
        store.upsert_record(&stale).unwrap();

        let engine = engine_with(fake, store.clone(), Arc::new(CountingNotifier::default()));
        let report = engine
            .run_snapshot(&sales_orders(), "exports/portal", &fast_options())
            .unwrap();

        assert_eq!(report.new, 2);
        assert_eq!(report.tombstoned, 1);
        assert_eq!(store.count_active(StreamKind::SalesOrder).unwrap(), 2);
        assert_eq!(store.list_lines(&RecordId::new("1")).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_without_manifest_fails() {
        let store = Arc::new(InMemorySyncStore::new());
        let engine = engine_with(
            FakeErp::default(),
            store,
            Arc::new(CountingNotifier::default()),
        );

        let err = engine
            .run_snapshot(&sales_orders(), "exports/portal", &fast_options())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ManifestError>(),
            Some(ManifestError::NotFound { .. })
        ));
    }
}
