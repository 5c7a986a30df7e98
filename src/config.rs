//! Server configuration.
//!
//! Loaded from an optional TOML file, then overridden by `TOFD_*` environment
//! variables. Every key has a default, so an empty file is a valid config.

use crate::capture::CaptureConfig;
use crate::codec::Codec;
use crate::session::SessionConfig;
use crate::streaming::StreamingConfig;
use crate::transport::HeartbeatConfig;
use crate::{Result, ServerError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const ENV_CONTROL_ADDR: &str = "TOFD_CONTROL_ADDR";
pub const ENV_FRAME_ADDR: &str = "TOFD_FRAME_ADDR";
pub const ENV_COMPRESSION: &str = "TOFD_COMPRESSION";
pub const ENV_SEND_HWM: &str = "TOFD_SEND_HWM";

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub network: NetworkConfig,
    pub streaming: StreamingSection,
    pub buffers: BuffersConfig,
    pub interrupts: InterruptsConfig,
    pub sensor: SensorConfig,
}

/// Endpoints and keep-alive for the two channels.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Request/reply endpoint, e.g. `0.0.0.0:5556`.
    pub control_addr: String,
    /// Frame push endpoint, e.g. `0.0.0.0:5555`.
    pub frame_addr: String,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub heartbeat_ttl_ms: u64,
    pub connection_lock_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:5556".to_string(),
            frame_addr: "0.0.0.0:5555".to_string(),
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            heartbeat_ttl_ms: 5000,
            connection_lock_timeout_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingSection {
    /// Frames queued towards the socket before new ones are dropped.
    pub send_high_water_mark: usize,
    pub send_timeout_ms: u64,
    pub wait_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub compression: Codec,
    pub stats_window: usize,
    pub stats_log_interval_ms: u64,
}

impl Default for StreamingSection {
    fn default() -> Self {
        Self {
            send_high_water_mark: 10,
            send_timeout_ms: 1000,
            wait_timeout_ms: 500,
            stop_grace_ms: 5000,
            compression: Codec::None,
            stats_window: 50,
            stats_log_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BuffersConfig {
    pub quiesce_timeout_ms: u64,
}

impl Default for BuffersConfig {
    fn default() -> Self {
        Self {
            quiesce_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InterruptsConfig {
    pub capacity: usize,
}

impl Default for InterruptsConfig {
    fn default() -> Self {
        Self {
            capacity: crate::interrupts::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SensorConfig {
    pub frame_timeout_ms: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 1000,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ServerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// File (if any) plus process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `TOFD_*` overrides read through `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        self.network.control_addr =
            read_env_string(&lookup, ENV_CONTROL_ADDR, &self.network.control_addr);
        self.network.frame_addr = read_env_string(&lookup, ENV_FRAME_ADDR, &self.network.frame_addr);
        self.streaming.send_high_water_mark = read_env_usize(
            &lookup,
            ENV_SEND_HWM,
            self.streaming.send_high_water_mark,
        );
        if let Some(value) = lookup(ENV_COMPRESSION) {
            match value.parse::<Codec>() {
                Ok(codec) => self.streaming.compression = codec,
                Err(e) => log::warn!("Ignoring {}: {}", ENV_COMPRESSION, e),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.streaming.send_high_water_mark == 0 {
            return Err(ServerError::Config(
                "streaming.send_high_water_mark must be at least 1".to_string(),
            ));
        }
        if self.network.heartbeat_timeout_ms < self.network.heartbeat_interval_ms {
            return Err(ServerError::Config(format!(
                "network.heartbeat_timeout_ms ({}) is shorter than the interval ({})",
                self.network.heartbeat_timeout_ms, self.network.heartbeat_interval_ms
            )));
        }
        if self.interrupts.capacity == 0 {
            return Err(ServerError::Config(
                "interrupts.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.network.heartbeat_interval_ms),
            timeout: Duration::from_millis(self.network.heartbeat_timeout_ms),
            ttl: Duration::from_millis(self.network.heartbeat_ttl_ms),
        }
    }

    pub fn connection_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connection_lock_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.streaming.send_timeout_ms)
    }

    pub fn session(&self) -> SessionConfig {
        let wait_timeout = Duration::from_millis(self.streaming.wait_timeout_ms);
        SessionConfig {
            capture: CaptureConfig {
                wait_timeout,
                frame_timeout: Duration::from_millis(self.sensor.frame_timeout_ms),
                ..CaptureConfig::default()
            },
            streaming: StreamingConfig {
                codec: self.streaming.compression,
                wait_timeout,
                send_timeout: self.send_timeout(),
                stop_grace: Duration::from_millis(self.streaming.stop_grace_ms),
                stats_window: self.streaming.stats_window,
                stats_log_interval: Duration::from_millis(self.streaming.stats_log_interval_ms),
                repeat_frame: false,
            },
            quiesce_timeout: Duration::from_millis(self.buffers.quiesce_timeout_ms),
            interrupt_capacity: self.interrupts.capacity,
        }
    }
}

fn read_env_string(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_env_usize(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: usize) -> usize {
    match lookup(name) {
        Some(v) => v.trim().parse::<usize>().unwrap_or_else(|_| {
            log::warn!("Ignoring {}={:?}: not a number", name, v);
            default
        }),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.network.control_addr, "0.0.0.0:5556");
        assert_eq!(config.network.frame_addr, "0.0.0.0:5555");
        assert_eq!(config.streaming.send_high_water_mark, 10);
        assert_eq!(config.streaming.compression, Codec::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[network]\ncontrol_addr = \"127.0.0.1:7000\"\n\n[streaming]\ncompression = \"rvl\"\nsend_high_water_mark = 3"
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.network.control_addr, "127.0.0.1:7000");
        assert_eq!(config.network.frame_addr, "0.0.0.0:5555");
        assert_eq!(config.streaming.compression, Codec::Rvl);
        assert_eq!(config.streaming.send_high_water_mark, 3);
        assert_eq!(config.buffers.quiesce_timeout_ms, 1000);
    }

    #[test]
    fn test_bad_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[streaming]\ncompression = \"zstd\"").unwrap();
        assert!(matches!(
            ServerConfig::from_file(file.path()),
            Err(ServerError::Config(_))
        ));
        assert!(ServerConfig::from_file(Path::new("/nonexistent/tofd.toml")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_CONTROL_ADDR, "127.0.0.1:9000"),
            (ENV_COMPRESSION, "LZ4"),
            (ENV_SEND_HWM, "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = ServerConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.network.control_addr, "127.0.0.1:9000");
        assert_eq!(config.network.frame_addr, "0.0.0.0:5555");
        assert_eq!(config.streaming.compression, Codec::Lz4);
        assert_eq!(config.streaming.send_high_water_mark, 10);
    }

    #[test]
    fn test_validation() {
        let mut config = ServerConfig::default();
        config.streaming.send_high_water_mark = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.network.heartbeat_timeout_ms = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_conversion() {
        let mut config = ServerConfig::default();
        config.streaming.compression = Codec::Rvl;
        config.sensor.frame_timeout_ms = 250;
        let session = config.session();
        assert_eq!(session.streaming.codec, Codec::Rvl);
        assert_eq!(session.capture.frame_timeout, Duration::from_millis(250));
        assert_eq!(config.heartbeat().timeout, Duration::from_millis(3000));
    }
}
