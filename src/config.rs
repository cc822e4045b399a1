//! Engine configuration, persisted as TOML.
//!
//! Environment variables override file values:
//!
//! | variable                           | effect                          |
//! |------------------------------------|---------------------------------|
//! | `AKH_GATE_MAX_GOAL_STACK`          | sets `max_goal_stack`           |
//! | `AKH_GATE_IGNORE_NO_ALLOW_WARNING` | clears `warn_missing_allow`     |
//! | `AKH_GATE_TRACE`                   | sets `default_trace`            |

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::vm::DEFAULT_MAX_GOALS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bound on pending goals and choice points per query.
    #[serde(default = "default_max_goal_stack")]
    pub max_goal_stack: usize,
    /// Warn after a load that defines no `allow`, `allow_field` or
    /// `allow_request` rule.
    #[serde(default = "default_true")]
    pub warn_missing_allow: bool,
    /// Trace queries opened without an explicit choice.
    #[serde(default)]
    pub default_trace: bool,
}

fn default_max_goal_stack() -> usize {
    DEFAULT_MAX_GOALS
}
fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_goal_stack: default_max_goal_stack(),
            warn_missing_allow: true,
            default_trace: false,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Apply `AKH_GATE_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(value) = get("AKH_GATE_MAX_GOAL_STACK") {
            self.max_goal_stack = value.trim().parse().map_err(|_| ConfigError::Invalid {
                message: format!("AKH_GATE_MAX_GOAL_STACK must be a positive integer, got {value:?}"),
            })?;
        }
        if get("AKH_GATE_IGNORE_NO_ALLOW_WARNING").is_some() {
            self.warn_missing_allow = false;
        }
        if let Some(value) = get("AKH_GATE_TRACE") {
            self.default_trace = !matches!(value.trim(), "" | "0" | "false" | "no");
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_goal_stack == 0 {
            return Err(ConfigError::Invalid {
                message: "max_goal_stack must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = EngineConfig::from_toml_str("default_trace = true").unwrap();
        assert_eq!(config.max_goal_stack, DEFAULT_MAX_GOALS);
        assert!(config.warn_missing_allow);
        assert!(config.default_trace);
    }

    #[test]
    fn config_roundtrip_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("gate.toml");
        let config = EngineConfig {
            max_goal_stack: 500,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(EngineConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn environment_overrides_file_values() {
        let config = EngineConfig::default()
            .with_overrides(|key| match key {
                "AKH_GATE_MAX_GOAL_STACK" => Some("64".into()),
                "AKH_GATE_IGNORE_NO_ALLOW_WARNING" => Some("1".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.max_goal_stack, 64);
        assert!(!config.warn_missing_allow);
        assert!(!config.default_trace);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("max_goal_stack = 0"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            EngineConfig::default().with_overrides(|_| Some("lots".into())),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            EngineConfig::load(Path::new("/nonexistent/gate.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
