//! Startup configuration, loaded from an optional JSON file.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Header carrying the per-request auth token.
    #[serde(default = "default_token_header")]
    pub token_header: String,
    /// Minimum accepted token length.
    #[serde(default = "default_token_length")]
    pub token_length: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    #[serde(default = "default_max_payload_mb")]
    pub max_payload_mb: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cleanup_grace_secs")]
    pub cleanup_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_token_header() -> String { "X-Shadow-Token".to_string() }
fn default_token_length() -> usize { 16 }
fn default_ttl_hours() -> u64 { 72 }
fn default_max_payload_mb() -> usize { 16 }
fn default_sweep_interval_secs() -> u64 { 3600 }
fn default_max_concurrent() -> usize { 5 }
fn default_timeout_secs() -> u64 { 300 }
fn default_cleanup_grace_secs() -> u64 { 5 }
fn default_workers() -> usize { 4 }
fn default_queue_capacity() -> usize { 100 }

impl Default for ApiConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { token_header: default_token_header(), token_length: default_token_length() }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            max_payload_mb: default_max_payload_mb(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            cleanup_grace_secs: default_cleanup_grace_secs(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { workers: default_workers(), queue_capacity: default_queue_capacity() }
    }
}

impl Config {
    /// Load configuration from a JSON file. Any malformed field is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.token_header.is_empty() {
            return Err(Error::Config("auth.token_header must not be empty".into()));
        }
        if self.auth.token_length == 0 {
            return Err(Error::Config("auth.token_length must be at least 1".into()));
        }
        if self.runner.max_concurrent == 0 {
            return Err(Error::Config("runner.max_concurrent must be at least 1".into()));
        }
        if self.sync.queue_capacity == 0 {
            return Err(Error::Config("sync.queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.auth.token_header, "X-Shadow-Token");
        assert_eq!(config.session.ttl_hours, 72);
        assert_eq!(config.runner.max_concurrent, 5);
        assert_eq!(config.sync.queue_capacity, 100);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"api": {{"port": 9090}}, "runner": {{"max_concurrent": 2}}}}"#).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.api.port, 9090);
        assert_eq!(config.api.host, "0.0.0.0");
        assert_eq!(config.runner.max_concurrent, 2);
        assert_eq!(config.runner.timeout_secs, 300);
    }

    #[test]
    fn malformed_file_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(Config::load(file.path()), Err(crate::error::Error::Config(_))));
    }

    #[test]
    fn zero_ceiling_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"runner": {{"max_concurrent": 0}}}}"#).unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
