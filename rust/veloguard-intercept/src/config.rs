//! Interception core configuration
//!
//! Every field has a serde default, so an empty YAML document yields the
//! stock configuration.

use crate::error::{InterceptError, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Largest frame the u16 length prefix can describe
pub const MAX_WIRE_FRAME: usize = u16::MAX as usize;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InterceptConfig {
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub udp: UdpRelayConfig,
    #[serde(default)]
    pub write_queue: WriteQueueConfig,
    #[serde(default)]
    pub ping_pool: PingPoolConfig,
    #[serde(default)]
    pub side_channel: SideChannelConfig,
    #[serde(default)]
    pub log_level: LogLevel,
}

impl InterceptConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.classifier.tcp_connect_timeout_ms == 0 {
            return Err(InterceptError::config(
                "classifier.tcp_connect_timeout_ms must be greater than 0",
            ));
        }
        if self.udp.read_timeout_secs == 0 {
            return Err(InterceptError::config(
                "udp.read_timeout_secs must be greater than 0",
            ));
        }
        if self.udp.mtu == 0 {
            return Err(InterceptError::config("udp.mtu must be greater than 0"));
        }
        if self.write_queue.max_frame_len == 0 || self.write_queue.max_frame_len > MAX_WIRE_FRAME {
            return Err(InterceptError::config(format!(
                "write_queue.max_frame_len must be between 1 and {}",
                MAX_WIRE_FRAME
            )));
        }
        if self.ping_pool.max_workers == 0 {
            return Err(InterceptError::config(
                "ping_pool.max_workers must be greater than 0",
            ));
        }
        if self.side_channel.timeout_ms == 0 {
            return Err(InterceptError::config(
                "side_channel.timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Let every flow through untouched
    #[serde(default)]
    pub direct_allow_all: bool,
    /// Owners above this uid are blocked
    #[serde(default = "default_privileged_uid")]
    pub privileged_uid: i32,
    /// Pass DNS straight through instead of relaying it
    #[serde(default)]
    pub allow_direct_dns: bool,
    #[serde(default = "default_tcp_connect_timeout_ms")]
    pub tcp_connect_timeout_ms: u64,
    /// Address redirected flows are NATed to
    #[serde(default = "default_loopback")]
    pub loopback: IpAddr,
    /// Ask the device side channel which application owns a flow
    #[serde(default)]
    pub resolve_owner: bool,
}

impl ClassifierConfig {
    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_timeout_ms)
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            direct_allow_all: false,
            privileged_uid: default_privileged_uid(),
            allow_direct_dns: false,
            tcp_connect_timeout_ms: default_tcp_connect_timeout_ms(),
            loopback: default_loopback(),
            resolve_owner: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpRelayConfig {
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

impl UdpRelayConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl Default for UdpRelayConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout_secs(),
            mtu: default_mtu(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueConfig {
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl WriteQueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            max_frame_len: default_max_frame_len(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for PingPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideChannelConfig {
    /// Device endpoint answering owner queries; none disables lookups
    #[serde(default)]
    pub device: Option<SocketAddr>,
    #[serde(default = "default_side_channel_timeout_ms")]
    pub timeout_ms: u64,
}

impl SideChannelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SideChannelConfig {
    fn default() -> Self {
        Self {
            device: None,
            timeout_ms: default_side_channel_timeout_ms(),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
    Debug,
    Trace,
    Silent,
}

fn default_privileged_uid() -> i32 {
    2000
}

fn default_tcp_connect_timeout_ms() -> u64 {
    10_000
}

fn default_loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_mtu() -> usize {
    1500
}

fn default_max_frame_len() -> usize {
    30_000
}

fn default_retry_delay_ms() -> u64 {
    10
}

fn default_max_workers() -> usize {
    20
}

fn default_side_channel_timeout_ms() -> u64 {
    1500
}
