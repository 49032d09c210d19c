// src/config.rs

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::integrity::ContentExpectation;
use crate::models::{BundleId, DownloadPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(String),
    #[error("failed to parse configuration: {0}")]
    ParseError(String),
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub bundles: Vec<BundleSpec>,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Catalog entry for a known bundle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BundleSpec {
    pub id: BundleId,
    #[serde(default)]
    pub policy: DownloadPolicy,
    /// Content file to read once the bundle is local. Overrides the path
    /// reported in the bundle metadata.
    #[serde(default)]
    pub content_path: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub expected_len: Option<u64>,
}

impl BundleSpec {
    pub fn new(id: impl Into<BundleId>, policy: DownloadPolicy) -> Self {
        Self {
            id: id.into(),
            policy,
            content_path: None,
            sha256: None,
            expected_len: None,
        }
    }

    pub fn with_content_path(mut self, path: impl Into<String>) -> Self {
        self.content_path = Some(path.into());
        self
    }

    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    pub fn expectation(&self) -> ContentExpectation {
        ContentExpectation {
            len: self.expected_len,
            sha256: self.sha256.clone(),
        }
    }
}

/// Settings for the filesystem-backed bundle client.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 0 means unlimited.
    #[serde(default)]
    pub rate_limit_bytes_per_sec: u64,
    #[serde(default = "default_status_buffer")]
    pub status_buffer: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            local_dir: default_local_dir(),
            chunk_size: default_chunk_size(),
            rate_limit_bytes_per_sec: 0,
            status_buffer: default_status_buffer(),
        }
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("remote")
}

fn default_local_dir() -> PathBuf {
    PathBuf::from("AssetPacks")
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_status_buffer() -> usize {
    64
}

/// Load configuration from a TOML file with `ASSETS_` environment overrides
/// (`ASSETS_STORE__CHUNK_SIZE=4096`).
pub fn load_config(path: &Path) -> Result<ManagerConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed("ASSETS_").split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Load configuration from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ManagerConfig, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

pub fn validate_config(config: &ManagerConfig) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for bundle in &config.bundles {
        if bundle.id.as_str().trim().is_empty() {
            return Err(ConfigError::ValidationError("bundle id must not be empty".into()));
        }
        if !seen.insert(&bundle.id) {
            return Err(ConfigError::ValidationError(format!(
                "duplicate bundle id '{}'",
                bundle.id
            )));
        }
        if let Some(digest) = &bundle.sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::ValidationError(format!(
                    "bundle '{}': sha256 must be 64 hex characters",
                    bundle.id
                )));
            }
        }
    }
    if config.store.chunk_size == 0 {
        return Err(ConfigError::ValidationError("store.chunk_size must be > 0".into()));
    }
    if config.store.status_buffer == 0 {
        return Err(ConfigError::ValidationError("store.status_buffer must be > 0".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
[[bundles]]
id = "Essential"
policy = "essential"
content_path = "Essential/image1.jpg"

[[bundles]]
id = "OnDemand"
policy = "on_demand"

[store]
local_dir = "/tmp/packs"
chunk_size = 1024
"#;

    #[test]
    fn parses_catalog_and_store() {
        let config = load_config_from_str(SAMPLE).unwrap();
        assert_eq!(config.bundles.len(), 2);
        assert_eq!(config.bundles[0].policy, DownloadPolicy::Essential);
        assert_eq!(
            config.bundles[0].content_path.as_deref(),
            Some("Essential/image1.jpg")
        );
        assert_eq!(config.store.local_dir, PathBuf::from("/tmp/packs"));
        assert_eq!(config.store.chunk_size, 1024);
        assert_eq!(config.store.status_buffer, 64);
        validate_config(&config).unwrap();
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = load_config_from_str("").unwrap();
        assert!(config.bundles.is_empty());
        assert_eq!(config.store.chunk_size, 64 * 1024);
        assert_eq!(config.store.rate_limit_bytes_per_sec, 0);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut config = load_config_from_str(SAMPLE).unwrap();
        config.bundles[1].id = "Essential".into();
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn rejects_malformed_digest() {
        let mut config = load_config_from_str(SAMPLE).unwrap();
        config.bundles[0].sha256 = Some("abc".into());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn unknown_policy_is_a_parse_error() {
        let result = load_config_from_str("[[bundles]]\nid = \"X\"\npolicy = \"later\"\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/assets.toml"));
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", SAMPLE).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.bundles[1].id, BundleId::from("OnDemand"));
    }
}
