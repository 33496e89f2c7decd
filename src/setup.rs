// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

//! First-time setup and reconfiguration of a unit.
//!
//! Both flows parse the key locally first, then open one authenticated
//! session to read the unit's identity, and close it again.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_DISCOVERY_TIMEOUT, DEVICE_PORT};
use crate::device::{DeviceIdentity, DeviceKey, Endpoint};
use crate::error::DaikinError;
use crate::transport::direct::TcpConnector;
use crate::transport::discovery::{MdnsResolver, Resolver};
use crate::transport::{Connector, DeviceSession};

/// Why a setup attempt failed. `code()` gives the stable string form.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SetupError {
    #[error("cannot connect: {0}")]
    CannotConnect(String),

    #[error("the unit rejected the device key")]
    InvalidAuth,

    #[error("malformed device key: {0}")]
    InvalidKey(String),

    #[error("a different unit answered (expected {expected}, got {actual})")]
    UniqueIdMismatched { expected: String, actual: String },
}

impl SetupError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CannotConnect(_) => "cannot_connect",
            Self::InvalidAuth => "invalid_auth",
            Self::InvalidKey(_) => "invalid_key",
            Self::UniqueIdMismatched { .. } => "unique_id_mismatched",
        }
    }
}

impl From<DaikinError> for SetupError {
    fn from(err: DaikinError) -> Self {
        match err {
            DaikinError::Auth { .. } => Self::InvalidAuth,
            DaikinError::Config(msg) => Self::InvalidKey(msg),
            DaikinError::UniqueIdMismatch { expected, actual } => {
                Self::UniqueIdMismatched { expected, actual }
            }
            other => Self::CannotConnect(other.to_string()),
        }
    }
}

/// Runs setup against a connector and resolver.
pub struct SetupFlow<C: Connector, R: Resolver> {
    connector: C,
    resolver: R,
    connect_timeout: Duration,
    discovery_timeout: Duration,
}

impl Default for SetupFlow<TcpConnector, MdnsResolver> {
    fn default() -> Self {
        Self::new(TcpConnector::default(), MdnsResolver::default())
    }
}

impl<C: Connector, R: Resolver> SetupFlow<C, R> {
    pub fn new(connector: C, resolver: R) -> Self {
        Self {
            connector,
            resolver,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, discovery: Duration) -> Self {
        self.connect_timeout = connect;
        self.discovery_timeout = discovery;
        self
    }

    /// Check that `device_key` opens a session with the unit at `host_or_ip`
    /// and return its identity.
    ///
    /// `host_or_ip` is an address (optionally `ip:port`) or a `DAIKINXXXXXX`
    /// hostname, which is resolved through discovery.
    pub async fn validate_and_connect(
        &self,
        host_or_ip: &str,
        device_key: &str,
    ) -> Result<DeviceIdentity, SetupError> {
        let key = DeviceKey::parse(device_key)?;
        let host_or_ip = host_or_ip.trim();

        let endpoint = if let Ok(addr) = host_or_ip.parse::<SocketAddr>() {
            Endpoint::with_port(addr.ip(), addr.port())
        } else {
            match host_or_ip.parse::<IpAddr>() {
                Ok(ip) => Endpoint::new(ip),
                Err(_) => {
                    let ip = self
                        .resolver
                        .resolve(host_or_ip, self.discovery_timeout)
                        .await?;
                    debug!("{} resolved to {}", host_or_ip, ip);
                    Endpoint::new(ip)
                }
            }
        };

        let identity = self.identify(&endpoint, &key, host_or_ip).await?;
        info!(
            "Set up {} ({}) at {}",
            identity.hostname, identity.unique_id, endpoint
        );
        Ok(identity)
    }

    /// Validate a replacement key and/or address for an existing unit.
    ///
    /// Without a new address the stored one is tried, falling back to
    /// discovery. The unit found must report the same unique id as before.
    pub async fn reconfigure(
        &self,
        existing: &DeviceIdentity,
        current_key: &DeviceKey,
        new_key: Option<&str>,
        new_ip: Option<IpAddr>,
    ) -> Result<DeviceIdentity, SetupError> {
        let key = match new_key {
            Some(raw) => DeviceKey::parse(raw)?,
            None => current_key.clone(),
        };
        let port = existing.endpoint.map_or(DEVICE_PORT, |e| e.port);

        let endpoint = match (new_ip, existing.endpoint) {
            (Some(ip), _) => Endpoint::with_port(ip, port),
            (None, Some(endpoint)) => endpoint,
            (None, None) => {
                let ip = self
                    .resolver
                    .resolve(&existing.hostname, self.discovery_timeout)
                    .await?;
                Endpoint::with_port(ip, port)
            }
        };

        let identity = self.identify(&endpoint, &key, &existing.hostname).await?;
        if identity.unique_id != existing.unique_id {
            warn!(
                "Reconfigure reached {} instead of {}",
                identity.unique_id, existing.unique_id
            );
            return Err(SetupError::UniqueIdMismatched {
                expected: existing.unique_id.clone(),
                actual: identity.unique_id,
            });
        }
        info!("Reconfigured {} at {}", identity.hostname, endpoint);
        Ok(identity)
    }

    async fn identify(
        &self,
        endpoint: &Endpoint,
        key: &DeviceKey,
        fallback_hostname: &str,
    ) -> Result<DeviceIdentity, SetupError> {
        let mut session = self
            .connector
            .connect(endpoint, key, self.connect_timeout)
            .await?;
        let info = session.info().clone();
        session.close().await;

        let hostname = if info.apn.trim().is_empty() {
            fallback_hostname.to_string()
        } else {
            info.apn.clone()
        };
        Ok(DeviceIdentity {
            unique_id: info.unique_id(),
            hostname,
            endpoint: Some(*endpoint),
            firmware: info.fw_ver,
        })
    }
}

/// [`SetupFlow::validate_and_connect`] over TCP and mDNS with default timeouts.
pub async fn validate_and_connect(
    host_or_ip: &str,
    device_key: &str,
) -> Result<DeviceIdentity, SetupError> {
    SetupFlow::default()
        .validate_and_connect(host_or_ip, device_key)
        .await
}

/// [`SetupFlow::reconfigure`] over TCP and mDNS with default timeouts.
pub async fn reconfigure(
    existing: &DeviceIdentity,
    current_key: &DeviceKey,
    new_key: Option<&str>,
    new_ip: Option<IpAddr>,
) -> Result<DeviceIdentity, SetupError> {
    SetupFlow::default()
        .reconfigure(existing, current_key, new_key, new_ip)
        .await
}
