//! Configuration loading for ERP access
//!
//! Supports loading ERP credentials from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file in the Ledgerline config directory
//! 3. Runtime environment variables (fallback)

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Credentials filename in the Ledgerline config directory
const CREDENTIALS_FILE: &str = "erp-credentials.json";

/// Token credentials for the ERP's query and file endpoints
#[derive(Debug, Clone)]
pub struct ErpCredentials {
    /// Base URL of the ERP's service endpoints
    pub base_url: String,
    /// Bearer token for the integration user
    pub token: String,
}

/// Credential file format
#[derive(Deserialize)]
struct CredentialFile {
    base_url: String,
    token: String,
}

impl ErpCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials (for production builds)
    /// 2. JSON file (~/.config/ledgerline/erp-credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let file: CredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Ok(Self::from_credential_file(file));
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: ERP_BASE_URL=xxx ERP_TOKEN=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let base_url = option_env!("ERP_BASE_URL")?;
        let token = option_env!("ERP_TOKEN")?;

        if base_url.is_empty() || token.is_empty() {
            return None;
        }

        Some(Self {
            base_url: base_url.to_string(),
            token: token.to_string(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let file: CredentialFile = config::load_json_file(path)?;
        Ok(Self::from_credential_file(file))
    }

    /// Parse credentials from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Ok(Self::from_credential_file(file))
    }

    fn from_credential_file(file: CredentialFile) -> Self {
        Self {
            base_url: file.base_url,
            token: file.token,
        }
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("ERP_BASE_URL").context("ERP_BASE_URL environment variable not set")?;
        let token = std::env::var("ERP_TOKEN").context("ERP_TOKEN environment variable not set")?;

        Ok(Self { base_url, token })
    }

    /// Check if credentials are available (compile-time, file, or env vars)
    pub fn is_available() -> bool {
        if Self::from_compile_time().is_some() {
            return true;
        }
        if config::config_exists(CREDENTIALS_FILE) {
            return true;
        }
        std::env::var("ERP_BASE_URL").is_ok() && std::env::var("ERP_TOKEN").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_credentials() {
        let json = r#"{
            "base_url": "https://erp.example.com/app",
            "token": "secret-token"
        }"#;

        let creds = ErpCredentials::from_json(json).unwrap();
        assert_eq!(creds.base_url, "https://erp.example.com/app");
        assert_eq!(creds.token, "secret-token");
    }

    #[test]
    fn test_invalid_json() {
        let json = r#"{ "other": {} }"#;
        assert!(ErpCredentials::from_json(json).is_err());
    }
}
