//! Configuration structures.
//!
//! Configuration is loaded from a JSON file (see [`Config::from_json_file`]);
//! durations are human-readable strings (`"30s"`, `"250ms"`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use super::errors::{Error, Result};
use super::item::{ExecutionMode, ItemConfig};
use crate::validation::{validate_non_empty, validate_positive, validate_rate_limit};

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Engine-wide defaults.
    #[serde(default)]
    pub engine: EngineDefaults,

    /// Isolated-process transport configuration.
    #[serde(default)]
    pub isolation: IsolationConfig,

    /// The item graph.
    #[serde(default)]
    pub production: ProductionConfig,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.production.validate()?;
        Ok(config)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Engine-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineDefaults {
    /// How long a draining host may keep processing before the rest of its
    /// queue is dead-lettered.
    #[serde(with = "humantime_serde")]
    pub drain_deadline: Duration,

    /// How long reload waits for new hosts to reach `Running`.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// Circuit breaker settings shared by every destination.
    pub breaker: BreakerSettings,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            drain_deadline: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(10),
            breaker: BreakerSettings::default(),
        }
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,

    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,

    pub half_open_max_attempts: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            half_open_max_attempts: 3,
        }
    }
}

/// Isolated-process transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// How long a worker process gets to exit after the shutdown frame.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// How long the handshake may take before the worker is killed.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// The item graph: every host and its connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProductionConfig {
    pub name: String,
    pub items: Vec<ItemConfig>,
}

impl ProductionConfig {
    pub fn new(name: impl Into<String>, items: Vec<ItemConfig>) -> Self {
        Self {
            name: name.into(),
            items,
        }
    }

    /// Items that should be running.
    pub fn enabled_items(&self) -> impl Iterator<Item = &ItemConfig> {
        self.items.iter().filter(|item| item.enabled)
    }

    /// Validate the graph before any host is built from it.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for item in &self.items {
            validate_non_empty(&item.name, "item name")?;
            validate_non_empty(&item.host_type, &format!("{}.host_type", item.name))?;
            if !names.insert(item.name.as_str()) {
                return Err(Error::config(format!("duplicate item '{}'", item.name)));
            }
            validate_positive(item.workers, &format!("{}.workers", item.name))?;
            if item.queue.capacity == 0 {
                return Err(Error::config(format!(
                    "{}.queue.capacity must be positive",
                    item.name
                )));
            }
            if item.execution == ExecutionMode::IsolatedProcess {
                match &item.worker_command {
                    Some(cmd) => {
                        validate_non_empty(&cmd.program, &format!("{}.worker_command", item.name))?
                    }
                    None => {
                        return Err(Error::config(format!(
                            "{} runs isolated_process but has no worker_command",
                            item.name
                        )))
                    }
                }
            }
            for limit in [&item.rate_limit, &item.outbound_rate_limit]
                .into_iter()
                .flatten()
            {
                validate_rate_limit(limit, &item.name)?;
            }
        }

        let enabled: HashSet<&str> = self.enabled_items().map(|i| i.name.as_str()).collect();
        for item in self.enabled_items() {
            for target in item.targets.iter().chain(item.dead_letter_target.iter()) {
                if !enabled.contains(target.as_str()) {
                    return Err(Error::config(format!(
                        "{} connects to unknown item '{}'",
                        item.name, target
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WorkerCommand;
    use std::io::Write;

    fn graph() -> ProductionConfig {
        ProductionConfig::new(
            "lab",
            vec![
                ItemConfig::new("adt-in", "passthrough").with_targets(["lab-out"]),
                ItemConfig::new("lab-out", "sink"),
            ],
        )
    }

    #[test]
    fn test_valid_graph() {
        assert!(graph().validate().is_ok());
    }

    #[test]
    fn test_duplicate_item_rejected() {
        let mut config = graph();
        config.items.push(ItemConfig::new("lab-out", "sink"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_unknown_connection_rejected() {
        let mut config = graph();
        config.items[0].targets.push("nowhere".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_disabled_target_counts_as_unknown() {
        let mut config = graph();
        config.items[1].enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_isolated_needs_command() {
        let mut config = graph();
        config.items[1].execution = ExecutionMode::IsolatedProcess;
        assert!(config.validate().is_err());

        config.items[1].worker_command = Some(WorkerCommand {
            program: "courier-engine".into(),
            args: vec!["worker".into()],
            ..WorkerCommand::default()
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = graph();
        config.items[0].queue.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "engine": {{ "drain_deadline": "2s" }},
                "production": {{
                    "name": "lab",
                    "items": [
                        {{ "name": "adt-in", "host_type": "passthrough", "targets": ["lab-out"] }},
                        {{ "name": "lab-out", "host_type": "sink" }}
                    ]
                }}
            }}"#
        )
        .unwrap();

        let config = Config::from_json_file(file.path()).unwrap();
        assert_eq!(config.engine.drain_deadline, Duration::from_secs(2));
        assert_eq!(config.engine.startup_timeout, Duration::from_secs(10));
        assert_eq!(config.engine.breaker.failure_threshold, 5);
        assert_eq!(config.production.items.len(), 2);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
