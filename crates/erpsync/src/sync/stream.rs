//! Entity stream descriptors
//!
//! One generic engine, parameterized per entity type. A descriptor carries
//! the query templates, the manifest datasets a snapshot export must name,
//! and the row-to-model mapping for its stream. The invoice, fulfillment,
//! and sales-order pipelines are all instances of the same machinery.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::models::{LineItem, RecordId, RecordSnapshot, StreamKind, SubRecord};

/// Header columns consumed by name; everything else lands in `extra`
const HEADER_COLUMNS: &[&str] = &[
    "id",
    "tranid",
    "entity",
    "createdfrom",
    "status",
    "trandate",
    "duedate",
    "total",
    "amountremaining",
    "lastmodifieddate",
];

/// Line columns consumed by name
const LINE_COLUMNS: &[&str] = &["id", "line", "item", "memo", "quantity", "rate", "amount"];

/// Sub-record columns consumed by name
const SUB_COLUMNS: &[&str] = &["id", "subid", "kind", "amount", "applieddate"];

/// Static description of one entity stream
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    /// Upstream transaction type code used in query templates
    pub tran_type: &'static str,
    /// Logical datasets a snapshot manifest must name for this stream
    pub required_datasets: &'static [&'static str],
    /// Upstream statuses that count as terminal/voided (absent for sync purposes)
    pub voided_statuses: &'static [&'static str],
    /// Whether the stream carries sub-records (e.g. payment applications)
    pub has_sub_records: bool,
    /// Extra field populated by detail enrichment, if any
    pub enrichment_field: Option<&'static str>,
}

/// Invoice stream: headers + lines + payment applications
pub fn invoices() -> StreamDescriptor {
    StreamDescriptor {
        kind: StreamKind::Invoice,
        tran_type: "CustInvc",
        required_datasets: &["headers", "lines", "applications"],
        voided_statuses: &["Voided"],
        has_sub_records: true,
        enrichment_field: None,
    }
}

/// Item fulfillment stream: headers + lines, enriched with package detail
pub fn fulfillments() -> StreamDescriptor {
    StreamDescriptor {
        kind: StreamKind::Fulfillment,
        tran_type: "ItemShip",
        required_datasets: &["headers", "lines"],
        voided_statuses: &["Voided"],
        has_sub_records: false,
        enrichment_field: Some("packages"),
    }
}

/// Sales order stream: headers + lines
pub fn sales_orders() -> StreamDescriptor {
    StreamDescriptor {
        kind: StreamKind::SalesOrder,
        tran_type: "SalesOrd",
        required_datasets: &["headers", "lines"],
        voided_statuses: &["Cancelled", "Voided"],
        has_sub_records: false,
        enrichment_field: None,
    }
}

impl StreamDescriptor {
    fn scope_clause(&self, scope: Option<&[String]>) -> String {
        match scope {
            Some(ids) if !ids.is_empty() => {
                format!(" AND entity IN ({})", quote_list(ids))
            }
            _ => String::new(),
        }
    }

    /// IDs whose upstream last-modified timestamp moved past the watermark
    pub fn modified_since_query(&self, scope: Option<&[String]>, since: DateTime<Utc>) -> String {
        format!(
            "SELECT id FROM transaction WHERE type = '{}' AND lastmodifieddate >= '{}'{}",
            self.tran_type,
            format_ts(since),
            self.scope_clause(scope),
        )
    }

    /// IDs created on/after the watermark's calendar date. Catches same-day
    /// creates whose modification timestamps behave differently from their
    /// creation dates (timezone/precision quirks upstream).
    pub fn created_in_window_query(&self, scope: Option<&[String]>, since: DateTime<Utc>) -> String {
        format!(
            "SELECT id FROM transaction WHERE type = '{}' AND trandate >= '{}'{}",
            self.tran_type,
            format_date(since),
            self.scope_clause(scope),
        )
    }

    /// IDs touched indirectly by activity on related objects (a payment
    /// applied to an invoice does not bump the invoice's own timestamp).
    pub fn related_activity_query(
        &self,
        scope: Option<&[String]>,
        since: DateTime<Utc>,
    ) -> Option<String> {
        match self.kind {
            StreamKind::Invoice => Some(format!(
                "SELECT applied_to AS id FROM transaction_link \
                 WHERE link_type = 'Payment' AND lastmodifieddate >= '{}'{}",
                format_ts(since),
                self.scope_clause(scope),
            )),
            StreamKind::SalesOrder => Some(format!(
                "SELECT createdfrom AS id FROM transaction \
                 WHERE type IN ('CustInvc', 'ItemShip') AND createddate >= '{}'{}",
                format_ts(since),
                self.scope_clause(scope),
            )),
            StreamKind::Fulfillment => None,
        }
    }

    /// Plain created-in-lookback scan, unfiltered by the other heuristics
    pub fn full_window_query(&self, scope: Option<&[String]>, window_start: DateTime<Utc>) -> String {
        format!(
            "SELECT id FROM transaction WHERE type = '{}' AND createddate >= '{}'{}",
            self.tran_type,
            format_date(window_start),
            self.scope_clause(scope),
        )
    }

    /// Presence check: which of these IDs does upstream still report as
    /// live? Voided/terminal rows are filtered out server-side so they count
    /// as absent.
    pub fn presence_query(&self, ids: &[RecordId]) -> String {
        format!(
            "SELECT id FROM transaction WHERE type = '{}' AND status NOT IN ({}) AND id IN ({})",
            self.tran_type,
            quote_list(self.voided_statuses),
            quote_ids(ids),
        )
    }

    /// Full header fetch for a batch of IDs
    pub fn headers_query(&self, ids: &[RecordId]) -> String {
        format!(
            "SELECT id, tranid, entity, createdfrom, status, trandate, duedate, \
             total, amountremaining, lastmodifieddate, shipmethod, trackingnumbers, memo \
             FROM transaction WHERE type = '{}' AND id IN ({})",
            self.tran_type,
            quote_ids(ids),
        )
    }

    /// Line fetch for a batch of parent IDs
    pub fn lines_query(&self, ids: &[RecordId]) -> String {
        format!(
            "SELECT id, line, item, memo, quantity, rate, amount \
             FROM transaction_line WHERE id IN ({}) AND mainline = 'F'",
            quote_ids(ids),
        )
    }

    /// Sub-record fetch for a batch of parent IDs (streams that have them)
    pub fn subs_query(&self, ids: &[RecordId]) -> Option<String> {
        if !self.has_sub_records {
            return None;
        }
        Some(format!(
            "SELECT id, subid, kind, amount, applieddate \
             FROM transaction_application WHERE id IN ({})",
            quote_ids(ids),
        ))
    }

    /// Per-record detail enrichment query, for streams that carry one
    pub fn enrichment_query(&self, id: &RecordId) -> Option<String> {
        self.enrichment_field.map(|_| {
            format!(
                "SELECT package_id, tracking_number, weight, carrier \
                 FROM package WHERE fulfillment = '{}'",
                id.as_str(),
            )
        })
    }

    /// Map one header row (query result or export line) to a snapshot.
    /// Unrecognized columns are preserved in `extra`.
    pub fn parse_header_row(&self, row: &Map<String, Value>) -> Result<RecordSnapshot> {
        let id = get_str(row, "id").context("header row missing 'id'")?;
        let tran_id = get_str(row, "tranid").unwrap_or_else(|| id.clone());

        let mut record = RecordSnapshot::new(id, tran_id, self.kind);
        record.customer_id = get_str(row, "entity").unwrap_or_default();
        record.order_id = get_str(row, "createdfrom");
        record.status = get_str(row, "status").unwrap_or_default();
        record.tran_date = get_datetime(row, "trandate");
        record.due_date = get_datetime(row, "duedate");
        record.amount_total = get_f64(row, "total").unwrap_or(0.0);
        record.amount_remaining = get_f64(row, "amountremaining").unwrap_or(0.0);
        record.last_modified_at = get_datetime(row, "lastmodifieddate");
        record.extra = leftover_fields(row, HEADER_COLUMNS);
        Ok(record)
    }

    /// Map one line row to a line item
    pub fn parse_line_row(&self, row: &Map<String, Value>) -> Result<LineItem> {
        let parent = get_str(row, "id").context("line row missing 'id'")?;
        let line_no = get_f64(row, "line").context("line row missing 'line'")? as i64;

        Ok(LineItem {
            parent_id: RecordId::new(parent),
            line_no,
            item: get_str(row, "item").unwrap_or_default(),
            description: get_str(row, "memo"),
            quantity: get_f64(row, "quantity").unwrap_or(0.0),
            rate: get_f64(row, "rate").unwrap_or(0.0),
            amount: get_f64(row, "amount").unwrap_or(0.0),
            extra: leftover_fields(row, LINE_COLUMNS),
        })
    }

    /// Map one sub-record row
    pub fn parse_sub_row(&self, row: &Map<String, Value>) -> Result<SubRecord> {
        let parent = get_str(row, "id").context("sub-record row missing 'id'")?;
        let sub_id = get_str(row, "subid").context("sub-record row missing 'subid'")?;

        Ok(SubRecord {
            parent_id: RecordId::new(parent),
            sub_id,
            kind: get_str(row, "kind").unwrap_or_else(|| "payment".to_string()),
            amount: get_f64(row, "amount").unwrap_or(0.0),
            applied_at: get_datetime(row, "applieddate"),
            extra: leftover_fields(row, SUB_COLUMNS),
        })
    }
}

/// Parse line-delimited JSON export text into row maps.
///
/// Blank lines are skipped; malformed lines are logged and dropped rather
/// than failing a multi-thousand-row snapshot over one bad record.
pub fn parse_jsonl(text: &str) -> Vec<Map<String, Value>> {
    let mut rows = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Map<String, Value>>(line) {
            Ok(row) => rows.push(row),
            Err(e) => log::warn!("[EXPORT] skipping malformed line {}: {}", idx + 1, e),
        }
    }
    rows
}

fn quote_ids(ids: &[RecordId]) -> String {
    ids.iter()
        .map(|id| format!("'{}'", id.as_str().replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quote_list<S: AsRef<str>>(values: &[S]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", v.as_ref().replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_date(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d").to_string()
}

/// String field, tolerating numeric values the ERP returns unquoted
pub fn get_str(row: &Map<String, Value>, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric field, tolerating string-wrapped numbers
pub fn get_f64(row: &Map<String, Value>, key: &str) -> Option<f64> {
    match row.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Timestamp field: RFC 3339, or the ERP's "YYYY-MM-DD HH:MM:SS" / date-only shapes
pub fn get_datetime(row: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    let s = get_str(row, key)?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

fn leftover_fields(row: &Map<String, Value>, consumed: &[&str]) -> BTreeMap<String, Value> {
    row.iter()
        .filter(|(k, v)| !consumed.contains(&k.as_str()) && !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
