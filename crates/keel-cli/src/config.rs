//! CLI configuration management.

use keel_core::pipeline::BarrierPolicy;
use keel_core::worker::Worker;
use serde::{Deserialize, Serialize};
use std::num::{NonZeroU64, NonZeroUsize};
use std::path::PathBuf;

/// CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CliConfig {
    /// Directory commands run in; defaults to the current directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_parallel: Option<NonZeroUsize>,
    #[serde(default)]
    pub default_timeout_minutes: Option<NonZeroU64>,
    /// Local worker pool used when no `--worker` is given.
    #[serde(default)]
    pub workers: Vec<Worker>,
    #[serde(default)]
    pub barrier_policy: Option<BarrierPolicy>,
}

impl CliConfig {
    /// Load configuration from file.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(serde_yaml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dirs = directories::ProjectDirs::from("ci", "keel", "keel-cli")
            .ok_or("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Set a configuration value. An empty value unsets optional keys.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), String> {
        let value = value.trim();
        match key {
            "working_dir" => {
                self.working_dir = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "max_parallel" => self.max_parallel = parse_optional(key, value)?,
            "default_timeout_minutes" => self.default_timeout_minutes = parse_optional(key, value)?,
            "barrier_policy" => {
                self.barrier_policy = if value.is_empty() {
                    None
                } else {
                    Some(parse_barrier(value)?)
                };
            }
            "workers" => {
                self.workers = value
                    .split(';')
                    .map(str::trim)
                    .filter(|w| !w.is_empty())
                    .map(|w| Worker::parse(w).map_err(|e| e.to_string()))
                    .collect::<Result<_, _>>()?;
            }
            _ => return Err(format!("Unknown config key: {}", key)),
        }
        Ok(())
    }
}

fn parse_optional<T: std::str::FromStr>(key: &str, value: &str) -> Result<Option<T>, String> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| format!("Invalid value for {}: {} (expected a positive number)", key, value))
}

pub fn parse_barrier(value: &str) -> Result<BarrierPolicy, String> {
    match value.trim().replace('-', "_").as_str() {
        "await_completion" => Ok(BarrierPolicy::AwaitCompletion),
        "require_success" => Ok(BarrierPolicy::RequireSuccess),
        other => Err(format!(
            "Invalid barrier policy: {} (expected await_completion or require_success)",
            other
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_values() {
        let mut config = CliConfig::default();
        config.set("max_parallel", "4").unwrap();
        config.set("barrier_policy", "require-success").unwrap();
        config
            .set("workers", "builder-1:production=true,docker; builder-2")
            .unwrap();

        assert_eq!(config.max_parallel, NonZeroUsize::new(4));
        assert_eq!(config.barrier_policy, Some(BarrierPolicy::RequireSuccess));
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].tags["docker"], "true");

        config.set("max_parallel", "").unwrap();
        assert_eq!(config.max_parallel, None);
    }

    #[test]
    fn test_invalid_values() {
        let mut config = CliConfig::default();
        assert!(config.set("max_parallel", "many").is_err());
        assert!(config.set("max_parallel", "0").is_err());
        assert!(config.set("default_timeout_minutes", "0").is_err());
        assert_eq!(config, CliConfig::default());
        assert!(config.set("barrier_policy", "sometimes").is_err());
        assert!(config.set("api_url", "http://localhost").is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
max_parallel: 2
barrier_policy: require_success
workers:
  - id: w1
    tags:
      production: "true"
"#;
        let config: CliConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.workers[0].id.as_str(), "w1");
        assert_eq!(config.barrier_policy, Some(BarrierPolicy::RequireSuccess));
    }

    #[test]
    fn test_zero_limits_rejected_in_file() {
        assert!(serde_yaml::from_str::<CliConfig>("max_parallel: 0").is_err());
        assert!(serde_yaml::from_str::<CliConfig>("default_timeout_minutes: 0").is_err());
    }
}
