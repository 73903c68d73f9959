use crate::agents::AgentId;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable carrying the JSON config into worker processes.
pub const CONFIG_ENV: &str = "CANSAT_FSW_CONFIG";

const DEFAULT_TEAM_ID: u16 = 1000;
const DEFAULT_SPAWN_DELAY_MS: u64 = 200;
const DEFAULT_QUEUE_POLL_MS: u64 = 100;
const DEFAULT_WORKER_READ_TIMEOUT_MS: u64 = 250;
const DEFAULT_GRACE_PERIOD_MS: u64 = 3000;
const DEFAULT_ESCALATION_MS: u64 = 1000;
const DEFAULT_HEARTBEAT_PERIOD_MS: u64 = 1000;
// Downlink runs at 1 Hz per the mission telemetry rate
const DEFAULT_DOWNLINK_PERIOD_MS: u64 = 1000;
const DEFAULT_SENSOR_PERIOD_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    /// One OS process per agent.
    Process,
    /// One tokio task per agent inside the supervisor process.
    InProcess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FswConfig {
    pub team_id: u16,
    pub launch_mode: LaunchMode,
    pub agents: Vec<AgentId>,
    /// Executable re-launched for worker processes; defaults to the running binary.
    pub worker_program: Option<PathBuf>,
    pub spawn_delay_ms: u64,
    pub queue_poll_ms: u64,
    pub worker_read_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub escalation_ms: u64,
    pub max_runtime_s: Option<u64>,
    pub heartbeat_period_ms: u64,
    pub downlink_period_ms: u64,
    pub sensor_period_ms: u64,
    pub telemetry_on_start: bool,
    pub link_bind: String,
    /// Program and arguments run on `RBT`; `None` only logs the request.
    pub reboot_command: Option<Vec<String>>,
    pub log_level: String,
    pub bus_health: BusHealthConfig,
}

impl Default for FswConfig {
    fn default() -> Self {
        Self {
            team_id: DEFAULT_TEAM_ID,
            launch_mode: LaunchMode::Process,
            agents: AgentId::workers().collect(),
            worker_program: None,
            spawn_delay_ms: DEFAULT_SPAWN_DELAY_MS,
            queue_poll_ms: DEFAULT_QUEUE_POLL_MS,
            worker_read_timeout_ms: DEFAULT_WORKER_READ_TIMEOUT_MS,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            escalation_ms: DEFAULT_ESCALATION_MS,
            max_runtime_s: None,
            heartbeat_period_ms: DEFAULT_HEARTBEAT_PERIOD_MS,
            downlink_period_ms: DEFAULT_DOWNLINK_PERIOD_MS,
            sensor_period_ms: DEFAULT_SENSOR_PERIOD_MS,
            telemetry_on_start: true,
            link_bind: "127.0.0.1:8080".to_string(),
            reboot_command: None,
            log_level: "info".to_string(),
            bus_health: BusHealthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusHealthConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Consecutive errors at which a device is marked `Error`; below it, `Degraded`.
    pub error_threshold: u32,
    /// Consecutive errors at which a device is marked `Offline`.
    pub offline_threshold: u32,
    pub stabilization_delay_ms: u64,
    /// Addresses present on the simulated bus.
    pub devices: Vec<u8>,
    pub fault_rate_percent: f32,
    pub min_fault_ticks: u32,
    pub max_fault_ticks: u32,
}

impl Default for BusHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            error_threshold: 3,
            offline_threshold: 5,
            stabilization_delay_ms: 2000,
            // BMP388, MPU6050, GPS DDC, battery monitor
            devices: vec![0x77, 0x68, 0x42, 0x40],
            fault_rate_percent: 1.0,
            min_fault_ticks: 1,
            max_fault_ticks: 8,
        }
    }
}

impl FswConfig {
    /// Load from an optional JSON file; a missing path means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                serde_json::from_str::<Self>(&text)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Config handed down to a worker process by the supervisor.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = match std::env::var(CONFIG_ENV) {
            Ok(json) => serde_json::from_str::<Self>(&json)?,
            Err(_) => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.team_id > 9999 {
            return Err(ConfigError::Invalid(format!(
                "team id {} is not a 4-digit id",
                self.team_id
            )));
        }
        if self.agents.contains(&AgentId::Supervisor) {
            return Err(ConfigError::Invalid(
                "the supervisor cannot be launched as a worker".to_string(),
            ));
        }
        let periods = [
            ("queue_poll_ms", self.queue_poll_ms),
            ("worker_read_timeout_ms", self.worker_read_timeout_ms),
            ("heartbeat_period_ms", self.heartbeat_period_ms),
            ("downlink_period_ms", self.downlink_period_ms),
            ("sensor_period_ms", self.sensor_period_ms),
            ("bus_health.interval_ms", self.bus_health.interval_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        let bus = &self.bus_health;
        if bus.error_threshold < 2 {
            return Err(ConfigError::Invalid(
                "bus_health.error_threshold must be at least 2".to_string(),
            ));
        }
        if bus.offline_threshold <= bus.error_threshold {
            return Err(ConfigError::Invalid(
                "bus_health.offline_threshold must exceed error_threshold".to_string(),
            ));
        }
        if bus.max_fault_ticks < bus.min_fault_ticks {
            return Err(ConfigError::Invalid(
                "bus_health.max_fault_ticks must not be below min_fault_ticks".to_string(),
            ));
        }
        Ok(())
    }

    pub fn spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn worker_read_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_read_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn escalation(&self) -> Duration {
        Duration::from_millis(self.escalation_ms)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        self.max_runtime_s.map(Duration::from_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn downlink_period(&self) -> Duration {
        Duration::from_millis(self.downlink_period_ms)
    }

    pub fn sensor_period(&self) -> Duration {
        Duration::from_millis(self.sensor_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = FswConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agents.len(), AgentId::ALL.len() - 1);
        assert_eq!(config.downlink_period(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: FswConfig =
            serde_json::from_str(r#"{"team_id":2031,"launch_mode":"in-process"}"#).unwrap();
        assert_eq!(config.team_id, 2031);
        assert_eq!(config.launch_mode, LaunchMode::InProcess);
        assert_eq!(config.grace_period_ms, DEFAULT_GRACE_PERIOD_MS);
        assert_eq!(config.bus_health.offline_threshold, 5);
    }

    #[test]
    fn test_threshold_ordering_is_enforced() {
        let mut config = FswConfig::default();
        config.bus_health.offline_threshold = config.bus_health.error_threshold;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = FswConfig::default();
        config.bus_health.error_threshold = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_period_rejected() {
        let mut config = FswConfig::default();
        config.downlink_period_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_team_id_range() {
        let mut config = FswConfig::default();
        config.team_id = 10_000;
        assert!(config.validate().is_err());
    }
}
