//! Diff & reconciliation
//!
//! Compares freshly fetched records against the local snapshot and
//! classifies every upstream ID as new, changed, unchanged, or missing.
//! Unchanged rows are never rewritten; on a quiet day almost everything is
//! unchanged and write amplification would dwarf the real work.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::models::{LineItem, Provenance, RecordId, RecordSnapshot, SubRecord};
use crate::storage::SyncStore;

/// Tolerance for numeric comparisons. Monetary fields round-trip through
/// floats upstream; sub-cent noise is not a change.
pub const AMOUNT_EPSILON: f64 = 0.01;

/// Default exemption window for recently portal-created records
pub const DEFAULT_GRACE_MINUTES: i64 = 90;

/// One fully fetched upstream record with its children
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub record: RecordSnapshot,
    pub lines: Vec<LineItem>,
    pub subs: Vec<SubRecord>,
}

impl FetchedRecord {
    pub fn new(record: RecordSnapshot) -> Self {
        Self {
            record,
            lines: Vec::new(),
            subs: Vec::new(),
        }
    }
}

/// Comparison policy, overridable per run
#[derive(Debug, Clone)]
pub struct DiffPolicy {
    pub epsilon: f64,
    /// How long a portal-created record is exempt from tombstoning
    pub grace_period: Duration,
}

impl Default for DiffPolicy {
    fn default() -> Self {
        Self {
            epsilon: AMOUNT_EPSILON,
            grace_period: Duration::minutes(DEFAULT_GRACE_MINUTES),
        }
    }
}

/// Result of reconciling one batch of fetched records
#[derive(Debug, Default)]
pub struct DiffOutcome {
    /// No existing local row
    pub new: Vec<FetchedRecord>,
    /// Some tracked field differs
    pub changed: Vec<FetchedRecord>,
    /// Identical within policy; counted but not rewritten
    pub unchanged: Vec<RecordId>,
    /// Tombstone candidates that survived the grace-period exemption
    pub missing: Vec<RecordId>,
    /// Missing IDs exempted this run (portal-created, still in grace)
    pub exempted: Vec<RecordId>,
}

impl DiffOutcome {
    /// Records that need writing, new then changed
    pub fn to_write(&self) -> impl Iterator<Item = &FetchedRecord> {
        self.new.iter().chain(self.changed.iter())
    }
}

/// Classify fetched records against the local store and filter tombstone
/// candidates through the grace-period exemption.
///
/// `missing_candidates` come from the caller (presence check or snapshot
/// set-difference); this function only applies the exemption policy to them.
pub fn reconcile(
    store: &dyn SyncStore,
    fetched: Vec<FetchedRecord>,
    missing_candidates: Vec<RecordId>,
    policy: &DiffPolicy,
    now: DateTime<Utc>,
) -> Result<DiffOutcome> {
    let ids: Vec<RecordId> = fetched.iter().map(|f| f.record.id.clone()).collect();
    let existing = store.get_records(&ids)?;

    let mut outcome = DiffOutcome::default();

    for item in fetched {
        let Some(current) = existing.iter().find(|r| r.id == item.record.id) else {
            outcome.new.push(item);
            continue;
        };

        // A tombstoned row seen fresh upstream has reappeared; treat as a
        // change so the upsert clears the marker.
        if current.is_tombstoned()
            || record_changed(current, &item.record, policy.epsilon)
            || children_changed(store, &item, policy.epsilon)?
        {
            outcome.changed.push(item);
        } else {
            outcome.unchanged.push(item.record.id.clone());
        }
    }

    for id in missing_candidates {
        let local = store.get_record(&id)?;
        match local {
            Some(record) if is_grace_exempt(&record, policy, now) => {
                log::debug!("[DIFF] {} missing upstream but within portal grace, skipping", id);
                outcome.exempted.push(id);
            }
            Some(record) if record.is_tombstoned() => {
                // Already tombstoned; nothing to do this run
            }
            Some(_) => outcome.missing.push(id),
            None => {}
        }
    }

    Ok(outcome)
}

/// Grace-period exemption: keyed on the portal-provenance marker, not age
/// alone. A record the portal created minutes ago may simply not be visible
/// to a bulk export yet; deleting it would race its own creation.
pub fn is_grace_exempt(record: &RecordSnapshot, policy: &DiffPolicy, now: DateTime<Utc>) -> bool {
    if record.local.provenance != Some(Provenance::Portal) {
        return false;
    }
    match record.local.first_seen_at {
        Some(first_seen) => now - first_seen < policy.grace_period,
        None => false,
    }
}

/// Field-level comparison of the engine-owned header fields
fn record_changed(current: &RecordSnapshot, fresh: &RecordSnapshot, epsilon: f64) -> bool {
    current.tran_id != fresh.tran_id
        || current.customer_id != fresh.customer_id
        || current.order_id != fresh.order_id
        || current.status != fresh.status
        || current.tran_date != fresh.tran_date
        || current.due_date != fresh.due_date
        || amount_differs(current.amount_total, fresh.amount_total, epsilon)
        || amount_differs(current.amount_remaining, fresh.amount_remaining, epsilon)
        || current.extra != fresh.extra
}

fn children_changed(store: &dyn SyncStore, fresh: &FetchedRecord, epsilon: f64) -> Result<bool> {
    let current_lines = store.list_lines(&fresh.record.id)?;
    if lines_differ(&current_lines, &fresh.lines, epsilon) {
        return Ok(true);
    }

    let current_subs = store.list_sub_records(&fresh.record.id)?;
    Ok(subs_differ(&current_subs, &fresh.subs, epsilon))
}

fn lines_differ(current: &[LineItem], fresh: &[LineItem], epsilon: f64) -> bool {
    if current.len() != fresh.len() {
        return true;
    }
    let mut fresh_sorted: Vec<&LineItem> = fresh.iter().collect();
    fresh_sorted.sort_by_key(|l| l.line_no);

    current.iter().zip(fresh_sorted).any(|(a, b)| {
        a.line_no != b.line_no
            || a.item != b.item
            || a.description != b.description
            || amount_differs(a.quantity, b.quantity, epsilon)
            || amount_differs(a.rate, b.rate, epsilon)
            || amount_differs(a.amount, b.amount, epsilon)
            || a.extra != b.extra
    })
}

fn subs_differ(current: &[SubRecord], fresh: &[SubRecord], epsilon: f64) -> bool {
    if current.len() != fresh.len() {
        return true;
    }
    let mut fresh_sorted: Vec<&SubRecord> = fresh.iter().collect();
    fresh_sorted.sort_by(|a, b| a.sub_id.cmp(&b.sub_id));

    current.iter().zip(fresh_sorted).any(|(a, b)| {
        a.sub_id != b.sub_id
            || a.kind != b.kind
            || a.applied_at != b.applied_at
            || amount_differs(a.amount, b.amount, epsilon)
            || a.extra != b.extra
    })
}

fn amount_differs(a: f64, b: f64, epsilon: f64) -> bool {
    (a - b).abs() > epsilon
}
