use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

/// The orchestrator variable store backend.
pub const BACKEND_NVAR: &str = "nvar";

fn default_backend() -> String {
    BACKEND_NVAR.to_string()
}

/// Where coordination state lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: String,

    pub nvar: NvarConfig,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            backend: default_backend(),
            nvar: NvarConfig::default(),
        }
    }
}

/// Settings for the variables backend: the orchestrator API endpoint and the
/// path prefix all weft variables live under.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NvarConfig {
    pub address: String,

    /// ACL token for the variables API, if the cluster requires one.
    pub token: Option<String>,

    pub path: String,
}

impl Default for NvarConfig {
    fn default() -> NvarConfig {
        NvarConfig {
            address: "http://127.0.0.1:4646".to_string(),
            token: None,
            path: "weft/".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self, errs: &mut Vec<ConfigError>) {
        match self.backend.as_str() {
            BACKEND_NVAR => {
                if self.nvar.path.is_empty() {
                    errs.push(ConfigError::MissingValue("store nvar path"));
                }
                if self.nvar.address.is_empty() {
                    errs.push(ConfigError::MissingValue("store nvar address"));
                }
            }
            other => errs.push(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_store_is_valid() {
        let mut errs = Vec::new();
        StoreConfig::default().validate(&mut errs);
        assert!(errs.is_empty());
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let cfg = StoreConfig {
            backend: "etcd".to_string(),
            ..StoreConfig::default()
        };
        let mut errs = Vec::new();
        cfg.validate(&mut errs);
        assert!(matches!(&errs[0], ConfigError::UnsupportedBackend(b) if b == "etcd"));
    }

    #[test]
    fn nvar_backend_requires_path_and_address() {
        let cfg = StoreConfig {
            backend: BACKEND_NVAR.to_string(),
            nvar: NvarConfig {
                address: String::new(),
                token: None,
                path: String::new(),
            },
        };
        let mut errs = Vec::new();
        cfg.validate(&mut errs);
        assert_eq!(errs.len(), 2);
    }
}
