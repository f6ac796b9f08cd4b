use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::error::{BridgeError, BridgeResult};

/// Fixed line speed of the serial device.
pub const BAUD_RATE: u32 = 9600;

/// Serial Bridge configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Serial device settings
    #[serde(default)]
    pub serial: SerialConfig,
    /// TCP listener settings
    #[serde(default)]
    pub tcp: TcpConfig,
    /// Retry timing for device and listener recovery
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial device configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device identifier, e.g. `COM4` or `/dev/ttyUSB0`
    #[serde(default = "default_serial_port")]
    pub port: String,
    /// Interval between checks for unread bytes, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// TCP listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    /// Address to bind, all interfaces by default
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Listening port
    #[serde(default = "default_tcp_port")]
    pub port: u16,
    /// Accept loop cadence in milliseconds
    #[serde(default = "default_accept_poll")]
    pub accept_poll_ms: u64,
    /// Longest a single client write may take before the client is dropped
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Exponential backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first retry
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_serial_port() -> String {
    if cfg!(windows) {
        "COM4".to_string()
    } else {
        "/dev/ttyUSB0".to_string()
    }
}

fn default_poll_interval() -> u64 {
    10
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_tcp_port() -> u16 {
    6001
}

fn default_accept_poll() -> u64 {
    100
}

fn default_write_timeout() -> u64 {
    5000
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_tcp_port(),
            accept_poll_ms: default_accept_poll(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SerialConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl TcpConfig {
    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl BridgeConfig {
    /// Reject settings the bridge cannot run with.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.serial.port.trim().is_empty() {
            return Err(BridgeError::Config {
                message: "serial port must not be empty".to_string(),
            });
        }

        if self.serial.poll_interval_ms == 0
            || self.tcp.accept_poll_ms == 0
            || self.tcp.write_timeout_ms == 0
        {
            return Err(BridgeError::Config {
                message: "poll intervals and write timeout must be greater than zero".to_string(),
            });
        }

        if self.tcp.port == 0 {
            return Err(BridgeError::Config {
                message: "TCP port must be between 1 and 65535".to_string(),
            });
        }

        if self.backoff.base_delay_ms == 0 || self.backoff.max_delay_ms < self.backoff.base_delay_ms {
            return Err(BridgeError::Config {
                message: format!(
                    "backoff delays must satisfy 0 < base ({}) <= max ({})",
                    self.backoff.base_delay_ms, self.backoff.max_delay_ms
                ),
            });
        }

        Ok(())
    }
}
