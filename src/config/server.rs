use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;

fn default_reaper_interval() -> String {
    "5m".to_string()
}

fn default_reaper_threshold() -> String {
    "5m".to_string()
}

/// Server-role configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Whether the server functionality is enabled on this agent.
    pub enabled: bool,

    pub reaper: ReaperConfig,
}

/// Settings for the lease reaper. Durations are humantime strings such as
/// "5m" or "1h30m".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReaperConfig {
    /// Time between reaper sweeps.
    pub interval: String,

    /// Grace period between a lease being flagged expired and its deletion.
    /// Peers tear down routes on the flag; deletion frees the block for
    /// reallocation.
    pub threshold: String,
}

impl Default for ReaperConfig {
    fn default() -> ReaperConfig {
        ReaperConfig {
            interval: default_reaper_interval(),
            threshold: default_reaper_threshold(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        parse_duration("reaper interval", &self.interval)
    }

    pub fn threshold(&self) -> Result<Duration, ConfigError> {
        parse_duration("reaper threshold", &self.threshold)
    }
}

fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|source| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
        source,
    })
}

impl ServerConfig {
    pub fn validate(&self, errs: &mut Vec<ConfigError>) {
        if !self.enabled {
            return;
        }

        if let Err(err) = self.reaper.interval() {
            errs.push(err);
        }
        if let Err(err) = self.reaper.threshold() {
            errs.push(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reaper_durations_parse() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.reaper.interval().unwrap(), Duration::from_secs(300));
        assert_eq!(cfg.reaper.threshold().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn bad_durations_fail_validation() {
        let cfg = ServerConfig {
            enabled: true,
            reaper: ReaperConfig {
                interval: "soon".to_string(),
                threshold: "5m".to_string(),
            },
        };
        let mut errs = Vec::new();
        cfg.validate(&mut errs);
        assert_eq!(errs.len(), 1);
        assert!(matches!(errs[0], ConfigError::InvalidDuration { field, .. } if field == "reaper interval"));
    }

    #[test]
    fn disabled_server_skips_validation() {
        let cfg = ServerConfig {
            enabled: false,
            reaper: ReaperConfig {
                interval: "nonsense".to_string(),
                threshold: "nonsense".to_string(),
            },
        };
        let mut errs = Vec::new();
        cfg.validate(&mut errs);
        assert!(errs.is_empty());
    }
}
