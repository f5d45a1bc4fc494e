//! Record snapshot model: the local projection of one upstream ERP object

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Stable external identifier for a record in the upstream ERP
/// (distinct from any local surrogate key; never reused upstream).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which entity stream a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Invoice,
    Fulfillment,
    SalesOrder,
}

impl StreamKind {
    /// Stable key used for cursor rows and log lines
    pub fn key(&self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Fulfillment => "fulfillment",
            Self::SalesOrder => "sales_order",
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// How a local row came into existence.
///
/// Rows created through the normal sync path are `Sync`; rows entered
/// directly through the portal (a side channel the ERP hasn't exported yet)
/// are `Portal`. The deletion-reconciliation grace period keys on this
/// marker, not on age alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Sync,
    Portal,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Portal => "portal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "portal" => Self::Portal,
            _ => Self::Sync,
        }
    }
}

/// Denormalized projection of one upstream business object as currently known.
///
/// Identity (`id`, `tran_id`) is immutable. Every other upstream field is
/// superseded wholesale by the most recent fetch. The `local` block holds
/// fields the sync engine does NOT own and must carry forward untouched on
/// every upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Upstream business ID
    pub id: RecordId,
    /// Human-readable transaction number (e.g. "INV-100")
    pub tran_id: String,
    pub stream: StreamKind,
    /// Upstream customer the record belongs to
    pub customer_id: String,
    /// Originating sales order, where the stream has one
    pub order_id: Option<String>,
    pub status: String,
    pub tran_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub amount_total: f64,
    pub amount_remaining: f64,
    /// Upstream last-modified timestamp, used for watermark advancement
    pub last_modified_at: Option<DateTime<Utc>>,
    /// Stream-specific free-form fields (tracking numbers, addresses, flags)
    pub extra: BTreeMap<String, Value>,
    /// Fields owned by the portal, never by the sync engine
    pub local: LocalFields,
}

/// Portal-owned state attached to a record.
///
/// The sync engine reads these from the existing local row and writes them
/// back verbatim; fresh upstream data never touches them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LocalFields {
    /// A payment is in flight through the portal's gateway
    pub payment_pending: bool,
    /// Free-form operator note
    pub portal_note: Option<String>,
    pub provenance: Option<Provenance>,
    /// When the local row was first created (either path)
    pub first_seen_at: Option<DateTime<Utc>>,
    /// Tombstone marker; non-null rows are excluded from active reads
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RecordSnapshot {
    /// Create a snapshot with identity only; callers fill in the rest
    pub fn new(id: impl Into<RecordId>, tran_id: impl Into<String>, stream: StreamKind) -> Self {
        Self {
            id: id.into(),
            tran_id: tran_id.into(),
            stream,
            customer_id: String::new(),
            order_id: None,
            status: String::new(),
            tran_date: None,
            due_date: None,
            amount_total: 0.0,
            amount_remaining: 0.0,
            last_modified_at: None,
            extra: BTreeMap::new(),
            local: LocalFields::default(),
        }
    }

    /// Whether the record still owes money (drives first-seen notifications)
    pub fn has_open_balance(&self) -> bool {
        self.amount_remaining > 0.005
    }

    pub fn is_tombstoned(&self) -> bool {
        self.local.deleted_at.is_some()
    }
}

/// Child record of a snapshot, identified by `(parent, line_no)`.
///
/// Lines are replaced wholesale on every sync of their parent, since line sets
/// can shrink, so a partial patch would leave stale rows behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub parent_id: RecordId,
    pub line_no: i64,
    pub item: String,
    pub description: Option<String>,
    pub quantity: f64,
    pub rate: f64,
    pub amount: f64,
    pub extra: BTreeMap<String, Value>,
}

/// Related sub-record (e.g. a payment applied against an invoice), keyed by
/// `(parent, sub_id)`. Same full-replace policy as line items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRecord {
    pub parent_id: RecordId,
    pub sub_id: String,
    pub kind: String,
    pub amount: f64,
    pub applied_at: Option<DateTime<Utc>>,
    pub extra: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_display() {
        let id = RecordId::new("12345");
        assert_eq!(id.to_string(), "12345");
        assert_eq!(id.as_str(), "12345");
    }

    #[test]
    fn test_stream_keys_are_distinct() {
        assert_ne!(StreamKind::Invoice.key(), StreamKind::Fulfillment.key());
        assert_ne!(StreamKind::Fulfillment.key(), StreamKind::SalesOrder.key());
    }

    #[test]
    fn test_provenance_round_trip() {
        assert_eq!(Provenance::parse("portal"), Provenance::Portal);
        assert_eq!(Provenance::parse("sync"), Provenance::Sync);
        // Unknown markers degrade to the normal sync path
        assert_eq!(Provenance::parse("???"), Provenance::Sync);
    }

    #[test]
    fn test_open_balance() {
        let mut rec = RecordSnapshot::new("1", "INV-1", StreamKind::Invoice);
        assert!(!rec.has_open_balance());
        rec.amount_remaining = 250.0;
        assert!(rec.has_open_balance());
        // Sub-cent residue does not count as owing
        rec.amount_remaining = 0.004;
        assert!(!rec.has_open_balance());
    }
}
