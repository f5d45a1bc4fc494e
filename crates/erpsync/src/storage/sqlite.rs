//! SQLite-based sync store

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::traits::SyncStore;
use crate::models::{
    LineItem, LocalFields, Provenance, RecordId, RecordSnapshot, StreamKind, SubRecord, SyncCursor,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            -- Sync cursor per entity stream
            CREATE TABLE sync_cursors (
                stream_key TEXT PRIMARY KEY,
                last_success_at TEXT NOT NULL,
                last_cursor TEXT NOT NULL
            );

            -- Denormalized record snapshots, one row per upstream object.
            -- payment_pending / portal_note / provenance / first_seen_at are
            -- portal-owned: the upsert conflict clause must never touch them.
            CREATE TABLE records (
                business_id TEXT PRIMARY KEY,
                stream TEXT NOT NULL,
                tran_id TEXT NOT NULL,
                customer_id TEXT NOT NULL,
                order_id TEXT,
                status TEXT NOT NULL,
                tran_date TEXT,
                due_date TEXT,
                amount_total REAL NOT NULL DEFAULT 0,
                amount_remaining REAL NOT NULL DEFAULT 0,
                last_modified_at TEXT,
                extra TEXT NOT NULL DEFAULT '{}',
                payment_pending INTEGER NOT NULL DEFAULT 0,
                portal_note TEXT,
                provenance TEXT,
                first_seen_at TEXT,
                deleted_at TEXT
            );

            CREATE INDEX idx_records_stream_active
                ON records(stream, deleted_at, business_id);
            CREATE INDEX idx_records_customer ON records(customer_id);

            -- Line items, fully replaced per parent on every sync
            CREATE TABLE record_lines (
                parent_id TEXT NOT NULL,
                line_no INTEGER NOT NULL,
                item TEXT NOT NULL,
                description TEXT,
                quantity REAL NOT NULL DEFAULT 0,
                rate REAL NOT NULL DEFAULT 0,
                amount REAL NOT NULL DEFAULT 0,
                extra TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (parent_id, line_no),
                FOREIGN KEY (parent_id) REFERENCES records(business_id) ON DELETE CASCADE
            );

            -- Related sub-records (payment applications etc.), same policy
            CREATE TABLE record_subs (
                parent_id TEXT NOT NULL,
                sub_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount REAL NOT NULL DEFAULT 0,
                applied_at TEXT,
                extra TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (parent_id, sub_id),
                FOREIGN KEY (parent_id) REFERENCES records(business_id) ON DELETE CASCADE
            );
            "#,
        ),
    ])
}

/// SQLite-based sync store
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
}

impl SqliteSyncStore {
    /// Create a new SQLite sync store at `db_path`
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL for concurrent readers during sync writes; NORMAL sync is safe
        // under WAL; foreign_keys required for ON DELETE CASCADE.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests that want real SQL semantics
    pub fn in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load_record(conn: &Connection, business_id: &str) -> Result<Option<RecordSnapshot>> {
        let mut stmt = conn.prepare(
            "SELECT business_id, stream, tran_id, customer_id, order_id, status,
                    tran_date, due_date, amount_total, amount_remaining,
                    last_modified_at, extra, payment_pending, portal_note,
                    provenance, first_seen_at, deleted_at
             FROM records WHERE business_id = ?",
        )?;

        let record = stmt
            .query_row([business_id], row_to_record)
            .optional()
            .context("Failed to load record")?;
        Ok(record)
    }
}

/// Map one `records` row to a snapshot
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordSnapshot> {
    let stream_key: String = row.get(1)?;
    let extra_json: String = row.get(11)?;
    let provenance: Option<String> = row.get(14)?;

    Ok(RecordSnapshot {
        id: RecordId::new(row.get::<_, String>(0)?),
        stream: parse_stream(&stream_key),
        tran_id: row.get(2)?,
        customer_id: row.get(3)?,
        order_id: row.get(4)?,
        status: row.get(5)?,
        tran_date: parse_datetime(row.get::<_, Option<String>>(6)?),
        due_date: parse_datetime(row.get::<_, Option<String>>(7)?),
        amount_total: row.get(8)?,
        amount_remaining: row.get(9)?,
        last_modified_at: parse_datetime(row.get::<_, Option<String>>(10)?),
        extra: serde_json::from_str(&extra_json).unwrap_or_default(),
        local: LocalFields {
            payment_pending: row.get(12)?,
            portal_note: row.get(13)?,
            provenance: provenance.as_deref().map(Provenance::parse),
            first_seen_at: parse_datetime(row.get::<_, Option<String>>(15)?),
            deleted_at: parse_datetime(row.get::<_, Option<String>>(16)?),
        },
    })
}

fn parse_stream(key: &str) -> StreamKind {
    match key {
        "fulfillment" => StreamKind::Fulfillment,
        "sales_order" => StreamKind::SalesOrder,
        _ => StreamKind::Invoice,
    }
}

fn parse_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        chrono::DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

fn to_rfc3339(value: &Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339())
}

/// Placeholder list "?,?,..." for an IN clause
fn placeholders(count: usize) -> String {
    let mut s = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            s.push(',');
        }
        s.push('?');
    }
    s
}

impl SyncStore for SqliteSyncStore {
    fn upsert_record(&self, record: &RecordSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        // ON CONFLICT DO UPDATE rather than INSERT OR REPLACE: a replace
        // would delete the row first and CASCADE away its children.
        // The conflict clause intentionally omits the portal-owned columns
        // and resets deleted_at, since a record seen fresh upstream is alive.
        conn.execute(
            "INSERT INTO records
             (business_id, stream, tran_id, customer_id, order_id, status,
              tran_date, due_date, amount_total, amount_remaining,
              last_modified_at, extra, payment_pending, portal_note,
              provenance, first_seen_at, deleted_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(business_id) DO UPDATE SET
                stream = excluded.stream,
                tran_id = excluded.tran_id,
                customer_id = excluded.customer_id,
                order_id = excluded.order_id,
                status = excluded.status,
                tran_date = excluded.tran_date,
                due_date = excluded.due_date,
                amount_total = excluded.amount_total,
                amount_remaining = excluded.amount_remaining,
                last_modified_at = excluded.last_modified_at,
                extra = excluded.extra,
                deleted_at = NULL",
            params![
                record.id.as_str(),
                record.stream.key(),
                record.tran_id,
                record.customer_id,
                record.order_id,
                record.status,
                to_rfc3339(&record.tran_date),
                to_rfc3339(&record.due_date),
                record.amount_total,
                record.amount_remaining,
                to_rfc3339(&record.last_modified_at),
                serde_json::to_string(&record.extra)?,
                record.local.payment_pending,
                record.local.portal_note,
                record.local.provenance.map(|p| p.as_str()),
                to_rfc3339(&record.local.first_seen_at),
                to_rfc3339(&record.local.deleted_at),
            ],
        )?;

        Ok(())
    }

    fn get_record(&self, id: &RecordId) -> Result<Option<RecordSnapshot>> {
        let conn = self.conn.lock().unwrap();
        Self::load_record(&conn, id.as_str())
    }

    fn get_records(&self, ids: &[RecordId]) -> Result<Vec<RecordSnapshot>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();

        let sql = format!(
            "SELECT business_id, stream, tran_id, customer_id, order_id, status,
                    tran_date, due_date, amount_total, amount_remaining,
                    last_modified_at, extra, payment_pending, portal_note,
                    provenance, first_seen_at, deleted_at
             FROM records WHERE business_id IN ({})",
            placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;

        let records = stmt
            .query_map(
                rusqlite::params_from_iter(ids.iter().map(|id| id.as_str())),
                row_to_record,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn list_active_ids(
        &self,
        stream: StreamKind,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RecordId>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT business_id FROM records
             WHERE stream = ? AND deleted_at IS NULL
             ORDER BY business_id
             LIMIT ? OFFSET ?",
        )?;

        let ids = stmt
            .query_map(params![stream.key(), limit as i64, offset as i64], |row| {
                Ok(RecordId::new(row.get::<_, String>(0)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ids)
    }

    fn count_active(&self, stream: StreamKind) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE stream = ? AND deleted_at IS NULL",
            [stream.key()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn replace_lines(&self, parent: &RecordId, lines: &[LineItem]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM record_lines WHERE parent_id = ?", [parent.as_str()])?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO record_lines
                 (parent_id, line_no, item, description, quantity, rate, amount, extra)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for line in lines {
                stmt.execute(params![
                    parent.as_str(),
                    line.line_no,
                    line.item,
                    line.description,
                    line.quantity,
                    line.rate,
                    line.amount,
                    serde_json::to_string(&line.extra)?,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn replace_sub_records(&self, parent: &RecordId, subs: &[SubRecord]) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM record_subs WHERE parent_id = ?", [parent.as_str()])?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO record_subs
                 (parent_id, sub_id, kind, amount, applied_at, extra)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for sub in subs {
                stmt.execute(params![
                    parent.as_str(),
                    sub.sub_id,
                    sub.kind,
                    sub.amount,
                    to_rfc3339(&sub.applied_at),
                    serde_json::to_string(&sub.extra)?,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn list_lines(&self, parent: &RecordId) -> Result<Vec<LineItem>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT line_no, item, description, quantity, rate, amount, extra
             FROM record_lines WHERE parent_id = ? ORDER BY line_no",
        )?;

        let lines = stmt
            .query_map([parent.as_str()], |row| {
                let extra_json: String = row.get(6)?;
                Ok(LineItem {
                    parent_id: parent.clone(),
                    line_no: row.get(0)?,
                    item: row.get(1)?,
                    description: row.get(2)?,
                    quantity: row.get(3)?,
                    rate: row.get(4)?,
                    amount: row.get(5)?,
                    extra: serde_json::from_str(&extra_json).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(lines)
    }

    fn list_sub_records(&self, parent: &RecordId) -> Result<Vec<SubRecord>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            "SELECT sub_id, kind, amount, applied_at, extra
             FROM record_subs WHERE parent_id = ? ORDER BY sub_id",
        )?;

        let subs = stmt
            .query_map([parent.as_str()], |row| {
                let applied_at: Option<String> = row.get(3)?;
                let extra_json: String = row.get(4)?;
                Ok(SubRecord {
                    parent_id: parent.clone(),
                    sub_id: row.get(0)?,
                    kind: row.get(1)?,
                    amount: row.get(2)?,
                    applied_at: parse_datetime(applied_at),
                    extra: serde_json::from_str(&extra_json).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(subs)
    }

    fn tombstone_records(&self, ids: &[RecordId], deleted_at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();

        // The IS NULL precondition makes a re-run a no-op
        let sql = format!(
            "UPDATE records SET deleted_at = ?
             WHERE deleted_at IS NULL AND business_id IN ({})",
            placeholders(ids.len())
        );

        let mut values: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(deleted_at.to_rfc3339())];
        values.extend(
            ids.iter()
                .map(|id| rusqlite::types::Value::Text(id.as_str().to_string())),
        );

        let changed = conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(changed)
    }

    fn get_cursor(&self, stream_key: &str) -> Result<Option<SyncCursor>> {
        let conn = self.conn.lock().unwrap();

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT last_success_at, last_cursor FROM sync_cursors WHERE stream_key = ?",
                [stream_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((success_str, cursor_str)) = row else {
            return Ok(None);
        };

        let last_success_at = parse_datetime(Some(success_str))
            .context("sync_cursors.last_success_at is not a valid timestamp")?;
        let last_cursor = parse_datetime(Some(cursor_str))
            .context("sync_cursors.last_cursor is not a valid timestamp")?;

        Ok(Some(SyncCursor {
            stream_key: stream_key.to_string(),
            last_success_at,
            last_cursor,
        }))
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT INTO sync_cursors (stream_key, last_success_at, last_cursor)
             VALUES (?, ?, ?)
             ON CONFLICT(stream_key) DO UPDATE SET
                last_success_at = excluded.last_success_at,
                last_cursor = excluded.last_cursor",
            params![
                cursor.stream_key,
                cursor.last_success_at.to_rfc3339(),
                cursor.last_cursor.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "DELETE FROM record_lines;
             DELETE FROM record_subs;
             DELETE FROM records;
             DELETE FROM sync_cursors;",
        )?;
        Ok(())
    }
}
