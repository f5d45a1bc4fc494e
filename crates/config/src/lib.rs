//! Shared config-directory helpers
//!
//! Ledgerline keeps its runtime configuration (ERP credentials, the default
//! portal database) under one per-user directory, `~/.config/ledgerline/`.
//! Binaries call [`init`] once at startup; libraries read individual JSON
//! files through [`load_json`] without caring where the directory lives.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Directory name under the platform config root
const APP_DIR: &str = "ledgerline";

/// Create the config directory if missing. Called once at startup.
pub fn init() -> Result<PathBuf> {
    ensure_config_dir()
}

fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|root| root.join(APP_DIR))
}

/// Absolute path a named config file would live at, whether or not it exists
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(filename))
}

/// Whether a named config file is present
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Read and deserialize a named JSON file from the config directory
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("No config directory on this platform")?;
    load_json_file(&path)
}

/// Read and deserialize a JSON file at an explicit path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Cannot parse {}", path.display()))
}

/// Resolve the config directory, creating it if needed
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("No config directory on this platform")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Cannot create {}", dir.display()))?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_land_under_app_dir() {
        let path = config_path("creds.json").unwrap();
        assert!(path.ends_with("ledgerline/creds.json"));
    }

    #[test]
    fn test_load_json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"retries": 3}"#).unwrap();

        let value: serde_json::Value = load_json_file(&path).unwrap();
        assert_eq!(value["retries"], 3);
    }

    #[test]
    fn test_load_json_file_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let err = load_json_file::<serde_json::Value>(&path).unwrap_err();
        assert!(err.to_string().contains("settings.json"));
    }

    #[test]
    fn test_missing_file_does_not_exist() {
        assert!(!config_exists("no-such-file-for-sure.json"));
    }
}
