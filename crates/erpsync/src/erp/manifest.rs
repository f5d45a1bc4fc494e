//! Export manifest resolution
//!
//! A dataset snapshot is described by a small JSON manifest staged in the
//! export folder alongside the data files. Each logical dataset (e.g.
//! "headers", "lines") maps to either a single file or a list of parts; the
//! resolver normalizes both shapes and refuses manifests that don't name
//! every dataset the caller requires.

use serde::Deserialize;
use std::collections::BTreeMap;

use super::client::{ErpClient, ErpError};
use super::files::fetch_file;

/// Name the ERP-side export job gives the manifest file
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// One data file (or part of a split dataset) named by the manifest
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManifestPart {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rows: u64,
}

/// A manifest entry is either a single file or a split dataset
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ManifestEntry {
    Multi {
        #[serde(default)]
        total_rows: u64,
        parts: Vec<ManifestPart>,
    },
    Single(ManifestPart),
}

/// Validated export manifest: dataset name -> ordered parts
#[derive(Debug, Clone)]
pub struct Manifest {
    datasets: BTreeMap<String, Vec<ManifestPart>>,
}

impl Manifest {
    /// Parts for a logical dataset, in export order
    pub fn parts(&self, dataset: &str) -> Option<&[ManifestPart]> {
        self.datasets.get(dataset).map(|v| v.as_slice())
    }

    pub fn dataset_names(&self) -> impl Iterator<Item = &str> {
        self.datasets.keys().map(|s| s.as_str())
    }

    /// Total declared row count for a dataset
    pub fn total_rows(&self, dataset: &str) -> u64 {
        self.parts(dataset)
            .map(|parts| parts.iter().map(|p| p.rows).sum())
            .unwrap_or(0)
    }
}

/// Manifest resolution failures
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// No manifest file exists in the export folder
    #[error("no manifest found in export folder {folder}")]
    NotFound { folder: String },

    /// The manifest exists but doesn't describe a usable snapshot
    #[error("invalid manifest: {0}")]
    Invalid(String),

    #[error(transparent)]
    Erp(#[from] ErpError),
}

/// Locate the newest manifest in `folder`, fetch it, parse it, and verify it
/// names at least one part for every `required` dataset.
pub fn resolve_manifest(
    client: &ErpClient,
    folder: &str,
    required: &[&str],
) -> Result<Manifest, ManifestError> {
    let statement = format!(
        "SELECT id FROM file WHERE folder = '{}' AND name = '{}' \
         ORDER BY createddate DESC FETCH FIRST 1 ROWS ONLY",
        folder, MANIFEST_FILENAME
    );
    let rows = client.query(&statement)?;

    let file_id = rows
        .first()
        .and_then(|row| row.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ManifestError::NotFound {
            folder: folder.to_string(),
        })?;

    log::info!("[MANIFEST] resolved {} in folder {}", file_id, folder);

    let body = fetch_file(client, &file_id)?;
    let manifest = parse_manifest(&body)?;
    validate_manifest(&manifest, required)?;
    Ok(manifest)
}

/// Parse manifest JSON, normalizing single-file entries to one-part lists
pub fn parse_manifest(body: &str) -> Result<Manifest, ManifestError> {
    let raw: BTreeMap<String, ManifestEntry> =
        serde_json::from_str(body).map_err(|e| ManifestError::Invalid(e.to_string()))?;

    let datasets = raw
        .into_iter()
        .map(|(name, entry)| {
            let parts = match entry {
                ManifestEntry::Single(part) => vec![part],
                ManifestEntry::Multi { parts, .. } => parts,
            };
            (name, parts)
        })
        .collect();

    Ok(Manifest { datasets })
}

fn validate_manifest(manifest: &Manifest, required: &[&str]) -> Result<(), ManifestError> {
    for dataset in required {
        match manifest.parts(dataset) {
            None => {
                return Err(ManifestError::Invalid(format!(
                    "missing required dataset '{}'",
                    dataset
                )));
            }
            Some(parts) if parts.is_empty() => {
                return Err(ManifestError::Invalid(format!(
                    "dataset '{}' names no parts",
                    dataset
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}
