//! Upstream ERP integration
//!
//! This module provides:
//! - A transport seam over the ERP's HTTP endpoints
//! - A rate-limit-aware bulk query client with exponential backoff
//! - A paged bulk-file reader for pre-staged line-delimited exports
//! - Export manifest resolution and validation
//!
//! All throttle/retry handling lives here; the rest of the engine only ever
//! sees parsed rows, assembled file bodies, or a terminal error.

mod client;
mod files;
mod manifest;
mod transport;

pub use client::{BackoffPolicy, ErpClient, ErpError};
pub use files::{fetch_file, fetch_parts};
pub use manifest::{Manifest, ManifestError, ManifestPart, resolve_manifest};
pub use transport::{ErpRequest, ErpResponse, ErpTransport, TransportError, UreqTransport};

/// ERP endpoint wire types
pub mod api {
    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    /// Response from the bulk query endpoint: one JSON object per row
    #[derive(Debug, Deserialize)]
    pub struct QueryResponse {
        pub items: Vec<Map<String, Value>>,
        #[serde(rename = "hasMore", default)]
        pub has_more: bool,
    }

    /// Request for one page of a pre-staged export file
    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FilePageRequest {
        pub file_id: String,
        pub line_start: u64,
        pub max_lines: u64,
    }

    /// One page of a pre-staged export file
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct FilePageResponse {
        pub ok: bool,
        #[serde(default)]
        pub data: String,
        pub lines_returned: u64,
        pub done: bool,
        #[serde(default)]
        pub error: Option<String>,
    }
}
