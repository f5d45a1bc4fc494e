//! Incremental synchronization pipeline
//!
//! The pipeline runs in phases, each idempotent on its own:
//! 1. Discovery: union of overlapping change-signal queries
//! 2. Fetch: headers, lines, and sub-records for the candidate IDs
//! 3. Diff: classify against the local snapshot
//! 4. Write: batched upserts and tombstones
//! 5. Cursor: advance the watermark, only on full success
//!
//! The snapshot path (manifest + bulk export files) replaces phases 1-2 and
//! converges on the same diff/write/cursor machinery.

pub mod diff;
pub mod discovery;
pub mod engine;
pub mod notify;
pub mod stream;
pub mod writer;

pub use diff::{AMOUNT_EPSILON, DiffOutcome, DiffPolicy, FetchedRecord, reconcile};
pub use discovery::{DiscoveryOptions, discover_changed_ids, find_missing_upstream};
pub use engine::{SyncEngine, SyncMode, SyncOptions, SyncReport};
pub use notify::{LogNotifier, NotificationEvent, Notifier, WebhookNotifier};
pub use stream::{StreamDescriptor, fulfillments, invoices, parse_jsonl, sales_orders};
pub use writer::{BATCH_SIZE, BatchWriter, WriteStats};
