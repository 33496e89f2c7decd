// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::net::IpAddr;
use std::time::Duration;

use tracing::warn;

use crate::constants::{
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCOVERY_TIMEOUT, DEFAULT_ESCALATION_THRESHOLD,
    DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEVICE_PORT, MAX_POLL_INTERVAL,
    MIN_POLL_INTERVAL,
};
use crate::device::{DeviceIdentity, DeviceKey, Endpoint, normalize_unique_id};
use crate::error::{DaikinError, Result};

/// Keep a poll interval inside the supported window, warning when it had to move.
pub fn clamp_poll_interval(interval: Duration) -> Duration {
    let clamped = interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
    if clamped != interval {
        warn!(
            "Poll interval {:?} outside {:?}..={:?}, using {:?}",
            interval, MIN_POLL_INTERVAL, MAX_POLL_INTERVAL, clamped
        );
    }
    clamped
}

/// Timing and retry policy for one coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorOptions {
    /// Time between scheduled polls (default: 10s, clamped to 5s..=300s)
    pub poll_interval: Duration,
    /// TCP connect plus handshake budget
    pub connect_timeout: Duration,
    /// Budget for one request/reply exchange
    pub request_timeout: Duration,
    /// How long to browse when re-resolving the hostname
    pub discovery_timeout: Duration,
    /// Consecutive failures before the unit is marked unavailable (default: 3)
    pub escalation_threshold: u32,
    /// Broadcast event channel capacity
    pub event_capacity: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            escalation_threshold: DEFAULT_ESCALATION_THRESHOLD,
            event_capacity: 64,
        }
    }
}

impl CoordinatorOptions {
    pub fn builder() -> CoordinatorOptionsBuilder {
        CoordinatorOptionsBuilder::default()
    }

    /// Longest a command waits for an in-flight poll before giving up.
    pub fn command_wait(&self) -> Duration {
        self.connect_timeout + self.request_timeout
    }
}

/// Builder for CoordinatorOptions.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorOptionsBuilder {
    options: CoordinatorOptions,
}

impl CoordinatorOptionsBuilder {
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.options.poll_interval = clamp_poll_interval(interval);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.options.discovery_timeout = timeout;
        self
    }

    pub fn escalation_threshold(mut self, threshold: u32) -> Self {
        self.options.escalation_threshold = threshold.max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> CoordinatorOptions {
        self.options
    }
}

/// Everything needed to run one configured unit.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Display label
    pub name: String,
    /// `DAIKINXXXXXX` access-point name, used for discovery
    pub hostname: String,
    /// Fixed address; discovery is used when absent
    pub ip: Option<IpAddr>,
    /// Device TCP port (default: 15914)
    pub port: u16,
    pub device_key: DeviceKey,
    /// Recorded at setup
    pub unique_id: String,
    pub options: CoordinatorOptions,
}

impl DeviceConfig {
    pub fn builder() -> DeviceConfigBuilder {
        DeviceConfigBuilder::default()
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            unique_id: self.unique_id.clone(),
            hostname: self.hostname.clone(),
            endpoint: self.ip.map(|ip| Endpoint::with_port(ip, self.port)),
            firmware: None,
        }
    }
}

/// Builder for DeviceConfig.
#[derive(Debug, Clone)]
pub struct DeviceConfigBuilder {
    name: Option<String>,
    hostname: Option<String>,
    ip: Option<IpAddr>,
    port: u16,
    device_key: Option<DeviceKey>,
    unique_id: Option<String>,
    options: CoordinatorOptions,
}

impl Default for DeviceConfigBuilder {
    fn default() -> Self {
        Self {
            name: None,
            hostname: None,
            ip: None,
            port: DEVICE_PORT,
            device_key: None,
            unique_id: None,
            options: CoordinatorOptions::default(),
        }
    }
}

impl DeviceConfigBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn device_key(mut self, key: DeviceKey) -> Self {
        self.device_key = Some(key);
        self
    }

    pub fn unique_id(mut self, unique_id: impl AsRef<str>) -> Self {
        self.unique_id = Some(normalize_unique_id(unique_id.as_ref()));
        self
    }

    pub fn options(mut self, options: CoordinatorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<DeviceConfig> {
        let hostname = self
            .hostname
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| DaikinError::Config("hostname is required".to_string()))?;
        let device_key = self
            .device_key
            .ok_or_else(|| DaikinError::Config("device key is required".to_string()))?;
        let unique_id = self
            .unique_id
            .filter(|u| !u.is_empty())
            .ok_or_else(|| DaikinError::Config("unique id is required (run setup first)".to_string()))?;
        Ok(DeviceConfig {
            name: self.name.unwrap_or_else(|| hostname.clone()),
            hostname,
            ip: self.ip,
            port: self.port,
            device_key,
            unique_id,
            options: self.options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DeviceKey {
        DeviceKey::parse("c2VjcmV0LWtleS0xMjM0NTY=").unwrap()
    }

    #[test]
    fn test_options_defaults() {
        let options = CoordinatorOptions::builder().build();
        assert_eq!(options.poll_interval, Duration::from_secs(10));
        assert_eq!(options.escalation_threshold, 3);
        assert_eq!(options.command_wait(), Duration::from_secs(10));
    }

    #[test]
    fn test_poll_interval_clamped() {
        let fast = CoordinatorOptions::builder()
            .poll_interval(Duration::from_secs(1))
            .build();
        assert_eq!(fast.poll_interval, MIN_POLL_INTERVAL);
        let slow = CoordinatorOptions::builder()
            .poll_interval(Duration::from_secs(3600))
            .build();
        assert_eq!(slow.poll_interval, MAX_POLL_INTERVAL);
        let normal = CoordinatorOptions::builder()
            .poll_interval(Duration::from_secs(30))
            .build();
        assert_eq!(normal.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_device_config_builder() {
        let config = DeviceConfig::builder()
            .hostname("DAIKIN1A2B3C")
            .ip("192.168.1.40".parse().unwrap())
            .device_key(key())
            .unique_id("AA:BB:CC:1A:2B:3C")
            .build()
            .unwrap();
        assert_eq!(config.name, "DAIKIN1A2B3C");
        assert_eq!(config.unique_id, "aabbcc1a2b3c");
        let identity = config.identity();
        assert_eq!(identity.endpoint.map(|e| e.port), Some(DEVICE_PORT));
    }

    #[test]
    fn test_device_config_requires_fields() {
        assert!(DeviceConfig::builder().device_key(key()).unique_id("aa").build().is_err());
        assert!(DeviceConfig::builder().hostname("DAIKIN1").unique_id("aa").build().is_err());
        assert!(DeviceConfig::builder().hostname("DAIKIN1").device_key(key()).build().is_err());
    }
}
