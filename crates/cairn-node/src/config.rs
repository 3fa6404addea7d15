//! Node configuration types.
//!
//! Configuration is read from a YAML file, then overridden by `CAIRN_*`
//! environment variables, then checked with `validator`. Every section has
//! defaults, so an empty file (or no file) yields a working memory-backed
//! node on `127.0.0.1:8080`.

use cairn_git::{PackLimits, TransferOptions};
use cairn_storage::{CacheConfig, CompressionLevel};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid YAML for [`NodeConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    Env {
        /// Variable name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationErrors),
}

/// Configuration for the Cairn node.
#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP listener.
    #[validate(nested)]
    pub api: ApiConfig,
    /// Log output.
    #[validate(nested)]
    pub logging: LoggingConfig,
    /// Object and reference storage.
    #[validate(nested)]
    pub storage: StorageConfig,
    /// Transfer limits and push policy.
    #[validate(nested)]
    pub git: GitConfig,
    /// Push authorization.
    pub auth: AuthConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct ApiConfig {
    /// Listen address.
    pub addr: SocketAddr,
    /// Largest accepted request body, after gzip decoding.
    #[validate(range(min = 4096))]
    pub max_body_bytes: usize,
    /// Capacity of the reference update feed.
    #[validate(range(min = 1, max = 1_000_000))]
    pub feed_capacity: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_body_bytes: 512 * 1024 * 1024,
            feed_capacity: 1024,
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for cairn crates (trace, debug, info, warn, error).
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,
    /// `pretty` or `json`.
    #[validate(custom(function = "validate_log_format"))]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Where objects and references live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process memory; lost on restart.
    #[default]
    Memory,
    /// Loose objects and JSON reference files under `data_dir`.
    Fs,
}

impl std::str::FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "fs" => Ok(Self::Fs),
            other => Err(format!("unknown storage backend {:?}", other)),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind.
    pub backend: StorageBackend,
    /// Root for the `fs` backend.
    pub data_dir: PathBuf,
    /// zlib level for loose objects.
    pub compression: CompressionLevel,
    /// Objects kept in the read cache; 0 disables the cache.
    pub cache_max_objects: usize,
    /// Byte budget of the read cache.
    #[validate(range(min = 1))]
    pub cache_max_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let cache = CacheConfig::default();
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("./data"),
            compression: CompressionLevel::Default,
            cache_max_objects: cache.max_objects,
            cache_max_bytes: cache.max_size_bytes,
        }
    }
}

impl StorageConfig {
    /// Directory holding loose objects.
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Directory holding per-repository reference files.
    pub fn refs_dir(&self) -> PathBuf {
        self.data_dir.join("refs")
    }

    /// Read cache settings, if the cache is enabled.
    pub fn cache(&self) -> Option<CacheConfig> {
        (self.cache_max_objects > 0).then(|| CacheConfig {
            max_objects: self.cache_max_objects,
            max_size_bytes: self.cache_max_bytes,
            ..Default::default()
        })
    }
}

/// Transfer limits and push policy.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct GitConfig {
    /// Largest accepted pack.
    #[validate(range(min = 32))]
    pub max_pack_bytes: usize,
    /// Largest object count in one pack.
    #[validate(range(min = 1))]
    pub max_objects: u32,
    /// Largest inflated object.
    #[validate(range(min = 1))]
    pub max_object_bytes: usize,
    /// Longest delta chain.
    #[validate(range(min = 1, max = 10_000))]
    pub max_delta_depth: usize,
    /// Memory for inflated delta bases.
    pub delta_cache_bytes: usize,
    /// Accept non-fast-forward updates not marked `+`.
    pub allow_non_fast_forwards: bool,
    /// Accept delete commands.
    pub allow_deletes: bool,
    /// Create unknown repositories on their first push.
    pub auto_create_on_push: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        let limits = PackLimits::default();
        let options = TransferOptions::default();
        Self {
            max_pack_bytes: limits.max_pack_bytes,
            max_objects: limits.max_objects,
            max_object_bytes: limits.max_object_bytes,
            max_delta_depth: limits.max_delta_depth,
            delta_cache_bytes: limits.delta_cache_bytes,
            allow_non_fast_forwards: options.allow_non_fast_forwards,
            allow_deletes: options.allow_deletes,
            auto_create_on_push: false,
        }
    }
}

impl GitConfig {
    /// Options handed to the transfer handlers.
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            limits: PackLimits {
                max_pack_bytes: self.max_pack_bytes,
                max_objects: self.max_objects,
                max_object_bytes: self.max_object_bytes,
                max_delta_depth: self.max_delta_depth,
                delta_cache_bytes: self.delta_cache_bytes,
            },
            allow_non_fast_forwards: self.allow_non_fast_forwards,
            allow_deletes: self.allow_deletes,
        }
    }
}

/// Push authorization.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer token required for pushes; open when unset.
    pub write_token: Option<String>,
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ValidationError::new("log_level")),
    }
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "pretty" | "json" => Ok(()),
        _ => Err(ValidationError::new("log_format")),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value,
    })
}

impl NodeConfig {
    /// Parses a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Loads the file at `path` (defaults if it does not exist), applies
    /// environment overrides and validates the result.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(text) => Self::from_yaml(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `CAIRN_*` overrides looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("CAIRN_API_ADDR") {
            self.api.addr = parse_env("CAIRN_API_ADDR", v)?;
        }
        if let Some(v) = lookup("CAIRN_MAX_BODY_BYTES") {
            self.api.max_body_bytes = parse_env("CAIRN_MAX_BODY_BYTES", v)?;
        }
        if let Some(v) = lookup("CAIRN_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("CAIRN_LOG_FORMAT") {
            self.logging.format = v;
        }
        if let Some(v) = lookup("CAIRN_STORAGE_BACKEND") {
            self.storage.backend = parse_env("CAIRN_STORAGE_BACKEND", v)?;
        }
        if let Some(v) = lookup("CAIRN_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CAIRN_MAX_PACK_BYTES") {
            self.git.max_pack_bytes = parse_env("CAIRN_MAX_PACK_BYTES", v)?;
        }
        if let Some(v) = lookup("CAIRN_ALLOW_NON_FAST_FORWARDS") {
            self.git.allow_non_fast_forwards = parse_env("CAIRN_ALLOW_NON_FAST_FORWARDS", v)?;
        }
        if let Some(v) = lookup("CAIRN_AUTO_CREATE_ON_PUSH") {
            self.git.auto_create_on_push = parse_env("CAIRN_AUTO_CREATE_ON_PUSH", v)?;
        }
        if let Some(v) = lookup("CAIRN_WRITE_TOKEN") {
            self.auth.write_token = Some(v).filter(|t| !t.is_empty());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api.addr.port(), 8080);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.auth.write_token.is_none());
        assert!(!config.git.allow_non_fast_forwards);
        assert!(!config.git.transfer_options().allow_non_fast_forwards);
    }

    #[test]
    fn test_partial_yaml() {
        let config = NodeConfig::from_yaml(
            "api:\n  addr: 0.0.0.0:9418\nstorage:\n  backend: fs\n  data_dir: /var/lib/cairn\ngit:\n  allow_non_fast_forwards: true\n",
        )
        .unwrap();
        assert_eq!(config.api.addr.port(), 9418);
        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.storage.refs_dir(), PathBuf::from("/var/lib/cairn/refs"));
        assert!(config.git.allow_non_fast_forwards);
        assert!(config.git.allow_deletes);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_empty_yaml() {
        let config = NodeConfig::from_yaml("").unwrap();
        assert_eq!(config.api.addr, NodeConfig::default().api.addr);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CAIRN_API_ADDR", "127.0.0.1:9000"),
            ("CAIRN_LOG_FORMAT", "json"),
            ("CAIRN_STORAGE_BACKEND", "fs"),
            ("CAIRN_WRITE_TOKEN", "token"),
            ("CAIRN_ALLOW_NON_FAST_FORWARDS", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = NodeConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.api.addr.port(), 9000);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.storage.backend, StorageBackend::Fs);
        assert_eq!(config.auth.write_token.as_deref(), Some("token"));
        assert!(config.git.transfer_options().allow_non_fast_forwards);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = NodeConfig::default();
        let err = config
            .apply_env(|key| (key == "CAIRN_MAX_PACK_BYTES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut config = NodeConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = NodeConfig::default();
        config.git.max_delta_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(&dir.path().join("absent.yaml")).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cairn.yaml");
        std::fs::write(&path, "logging:\n  level: debug\n").unwrap();
        assert_eq!(NodeConfig::load(&path).unwrap().logging.level, "debug");

        std::fs::write(&path, "logging: [unterminated\n").unwrap();
        assert!(matches!(NodeConfig::load(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_cache_disabled_at_zero() {
        let mut storage = StorageConfig::default();
        assert!(storage.cache().is_some());
        storage.cache_max_objects = 0;
        assert!(storage.cache().is_none());
    }
}
