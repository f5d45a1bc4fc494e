//! Erpsync crate - ERP-to-portal data synchronization
//!
//! This crate keeps a customer portal's local datastore converged with an
//! upstream ERP that has no change-data-capture feed. It provides:
//! - Domain models (RecordSnapshot, LineItem, SyncCursor)
//! - Rate-limit-aware ERP query client and bulk export reader
//! - Export manifest resolution
//! - Storage trait abstractions (SQLite and in-memory)
//! - Change discovery, diff/reconciliation, and idempotent batch writing
//! - A generic sync engine parameterized per entity stream
//!
//! This crate has no UI or scheduler dependencies; job triggers live in the
//! `synctl` binary.

pub mod config;
pub mod erp;
pub mod models;
pub mod storage;
pub mod sync;

pub use config::ErpCredentials;
pub use erp::{
    BackoffPolicy, ErpClient, ErpError, ErpTransport, Manifest, ManifestError, ManifestPart,
    UreqTransport, fetch_file, fetch_parts, resolve_manifest,
};
pub use models::{
    LineItem, LocalFields, Provenance, RecordId, RecordSnapshot, StreamKind, SubRecord, SyncCursor,
};
pub use storage::{InMemorySyncStore, SqliteSyncStore, SyncStore};
pub use sync::{
    // Engine surface (for job triggers)
    SyncEngine, SyncMode, SyncOptions, SyncReport,
    // Stream descriptors
    StreamDescriptor, fulfillments, invoices, sales_orders,
    // Diff policy knobs
    DiffOutcome, DiffPolicy,
    // Downstream notifications
    LogNotifier, NotificationEvent, Notifier, WebhookNotifier,
};
