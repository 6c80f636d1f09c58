use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

fn default_data_dir() -> String {
    "/var/lib/weft/client".to_string()
}

fn default_cni_dir() -> String {
    "/opt/weft/cni".to_string()
}

/// Client-role configuration: where local state lives and which underlay
/// interface carries the overlay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Whether the client functionality is enabled on this agent.
    pub enabled: bool,

    /// Directory for client state, including the persistent host identity.
    pub data_dir: String,

    /// Directory the per-network CNI configuration files are written into.
    pub cni_dir: String,

    /// Disables IP masquerading for client networks regardless of the
    /// per-network setting.
    pub disable_ipmasq: bool,

    /// Underlay interface to use. When empty the default interface is
    /// discovered.
    pub network_interface: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            enabled: false,
            data_dir: default_data_dir(),
            cni_dir: default_cni_dir(),
            disable_ipmasq: false,
            network_interface: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self, errs: &mut Vec<ConfigError>) {
        if !self.enabled {
            return;
        }

        if !cfg!(target_os = "linux") {
            errs.push(ConfigError::UnsupportedPlatform);
        }
        if !Path::new(&self.data_dir).is_absolute() {
            errs.push(ConfigError::RelativePath("client data directory"));
        }
        if !Path::new(&self.cni_dir).is_absolute() {
            errs.push(ConfigError::RelativePath("client CNI directory"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_client_skips_validation() {
        let cfg = ClientConfig {
            enabled: false,
            data_dir: "relative".to_string(),
            ..ClientConfig::default()
        };
        let mut errs = Vec::new();
        cfg.validate(&mut errs);
        assert!(errs.is_empty());
    }

    #[test]
    fn enabled_client_requires_absolute_paths() {
        let cfg = ClientConfig {
            enabled: true,
            data_dir: "relative".to_string(),
            cni_dir: "also-relative".to_string(),
            ..ClientConfig::default()
        };
        let mut errs = Vec::new();
        cfg.validate(&mut errs);
        assert_eq!(
            errs.iter()
                .filter(|e| matches!(e, ConfigError::RelativePath(_)))
                .count(),
            2
        );
    }

    #[test]
    fn defaults_fill_missing_file_fields() {
        let cfg: ClientConfig = serde_json::from_str(r#"{"enabled": true}"#).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.data_dir, "/var/lib/weft/client");
        assert_eq!(cfg.cni_dir, "/opt/weft/cni");
    }
}
