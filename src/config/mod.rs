// Agent configuration: defaults, an optional JSON config file, and CLI
// flags with environment-variable sources, merged in that order so flags
// always win.

pub mod client;
pub mod server;
pub mod store;

use std::path::PathBuf;

use clap::Args;
use serde::{Deserialize, Serialize};

pub use client::ClientConfig;
pub use server::{ReaperConfig, ServerConfig};
pub use store::{NvarConfig, StoreConfig, BACKEND_NVAR};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path:?}: {source}")]
    ParseFile {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("{0} must be an absolute path")]
    RelativePath(&'static str),

    #[error("{0} must be set")]
    MissingValue(&'static str),

    #[error("client functionality is only supported on Linux")]
    UnsupportedPlatform,

    #[error("unsupported store backend: {0:?}")]
    UnsupportedBackend(String),

    #[error("invalid {field} {value:?}: {source}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        source: humantime::DurationError,
    },

    #[error("at least one of client or server must be enabled")]
    NothingEnabled,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Log filter directive, e.g. "info" or "weft=debug".
    pub log_level: String,

    pub client: ClientConfig,

    pub server: ServerConfig,

    pub store: StoreConfig,
}

impl Default for AgentConfig {
    fn default() -> AgentConfig {
        AgentConfig {
            log_level: default_log_level(),
            client: ClientConfig::default(),
            server: ServerConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Flags for `weft agent run`. Every flag can also be supplied through its
/// `WEFT_*` environment variable; unset flags leave the file/default value
/// in place.
#[derive(Debug, Default, Args)]
pub struct AgentRunArgs {
    /// Path to a JSON configuration file
    #[arg(long, env = "WEFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log filter directive
    #[arg(long, env = "WEFT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable or disable the client functionality
    #[arg(long, env = "WEFT_CLIENT_ENABLED", num_args = 0..=1, default_missing_value = "true")]
    pub client_enabled: Option<bool>,

    /// The data directory for the client
    #[arg(long, env = "WEFT_CLIENT_DATA_DIR")]
    pub client_data_dir: Option<String>,

    /// The directory CNI configuration files are written to
    #[arg(long, env = "WEFT_CLIENT_CNI_DIR")]
    pub client_cni_dir: Option<String>,

    /// Disable IP masquerading for client networks
    #[arg(long, env = "WEFT_CLIENT_DISABLE_IPMASQ", num_args = 0..=1, default_missing_value = "true")]
    pub client_disable_ipmasq: Option<bool>,

    /// The underlay network interface to use for client networking
    #[arg(long, env = "WEFT_CLIENT_NETWORK_INTERFACE")]
    pub client_network_interface: Option<String>,

    /// Enable or disable the server functionality
    #[arg(long, env = "WEFT_SERVER_ENABLED", num_args = 0..=1, default_missing_value = "true")]
    pub server_enabled: Option<bool>,

    /// Interval between runs of the server reaper
    #[arg(long, env = "WEFT_SERVER_REAPER_INTERVAL")]
    pub server_reaper_interval: Option<String>,

    /// Grace period before expired leases are deleted
    #[arg(long, env = "WEFT_SERVER_REAPER_THRESHOLD")]
    pub server_reaper_threshold: Option<String>,

    /// The backend used for storing coordination state
    #[arg(long, env = "WEFT_STORE_BACKEND")]
    pub store_backend: Option<String>,

    /// Address of the orchestrator API
    #[arg(long, env = "WEFT_STORE_NVAR_ADDRESS")]
    pub store_nvar_address: Option<String>,

    /// ACL token for the orchestrator variables API
    #[arg(long, env = "WEFT_STORE_NVAR_TOKEN")]
    pub store_nvar_token: Option<String>,

    /// Path prefix for variables written by weft
    #[arg(long, env = "WEFT_STORE_NVAR_PATH")]
    pub store_nvar_path: Option<String>,
}

impl AgentConfig {
    /// Resolves the effective configuration: defaults, overlaid by the
    /// config file when one is given, overlaid by set flags.
    pub fn load(args: &AgentRunArgs) -> Result<AgentConfig, ConfigError> {
        let mut cfg = match &args.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| {
                    ConfigError::ReadFile {
                        path: path.clone(),
                        source,
                    }
                })?;
                serde_json::from_str(&raw).map_err(|source| ConfigError::ParseFile {
                    path: path.clone(),
                    source,
                })?
            }
            None => AgentConfig::default(),
        };

        cfg.apply_args(args);
        Ok(cfg)
    }

    fn apply_args(&mut self, args: &AgentRunArgs) {
        if let Some(level) = &args.log_level {
            self.log_level = level.clone();
        }

        if let Some(enabled) = args.client_enabled {
            self.client.enabled = enabled;
        }
        if let Some(dir) = &args.client_data_dir {
            self.client.data_dir = dir.clone();
        }
        if let Some(dir) = &args.client_cni_dir {
            self.client.cni_dir = dir.clone();
        }
        if let Some(disable) = args.client_disable_ipmasq {
            self.client.disable_ipmasq = disable;
        }
        if let Some(interface) = &args.client_network_interface {
            self.client.network_interface = Some(interface.clone());
        }

        if let Some(enabled) = args.server_enabled {
            self.server.enabled = enabled;
        }
        if let Some(interval) = &args.server_reaper_interval {
            self.server.reaper.interval = interval.clone();
        }
        if let Some(threshold) = &args.server_reaper_threshold {
            self.server.reaper.threshold = threshold.clone();
        }

        if let Some(backend) = &args.store_backend {
            self.store.backend = backend.clone();
        }
        if let Some(address) = &args.store_nvar_address {
            self.store.nvar.address = address.clone();
        }
        if let Some(token) = &args.store_nvar_token {
            self.store.nvar.token = Some(token.clone());
        }
        if let Some(path) = &args.store_nvar_path {
            self.store.nvar.path = path.clone();
        }
    }

    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errs = Vec::new();

        if !self.client.enabled && !self.server.enabled {
            errs.push(ConfigError::NothingEnabled);
        }

        self.client.validate(&mut errs);
        self.server.validate(&mut errs);
        self.store.validate(&mut errs);

        errs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_require_an_enabled_role() {
        let cfg = AgentConfig::default();
        let errs = cfg.validate();
        assert!(matches!(errs[0], ConfigError::NothingEnabled));
    }

    #[test]
    fn flags_override_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "log_level": "debug",
                "client": {{"enabled": true, "data_dir": "/from/file"}},
                "store": {{"nvar": {{"path": "file/"}}}}
            }}"#
        )
        .unwrap();

        let args = AgentRunArgs {
            config: Some(file.path().to_path_buf()),
            client_data_dir: Some("/from/flag".to_string()),
            store_nvar_path: Some("flag/".to_string()),
            ..AgentRunArgs::default()
        };

        let cfg = AgentConfig::load(&args).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert!(cfg.client.enabled);
        assert_eq!(cfg.client.data_dir, "/from/flag");
        assert_eq!(cfg.store.nvar.path, "flag/");
        // Untouched fields keep their defaults.
        assert_eq!(cfg.store.nvar.address, "http://127.0.0.1:4646");
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let args = AgentRunArgs {
            server_enabled: Some(true),
            ..AgentRunArgs::default()
        };
        let cfg = AgentConfig::load(&args).unwrap();
        assert!(cfg.server.enabled);
        assert!(!cfg.client.enabled);
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();

        let args = AgentRunArgs {
            config: Some(file.path().to_path_buf()),
            ..AgentRunArgs::default()
        };
        assert!(matches!(
            AgentConfig::load(&args),
            Err(ConfigError::ParseFile { .. })
        ));
    }
}
