// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::constants::DEVICE_PORT;
use crate::error::{DaikinError, Result};

const KEY_MIN_LEN: usize = 16;
const KEY_MAX_LEN: usize = 64;

/// Per-device secret printed on the unit's label, used to encrypt session traffic.
///
/// `Debug` never prints the secret.
pub struct DeviceKey(SecretString);

impl DeviceKey {
    /// Validate the key's format without contacting the device.
    ///
    /// Keys are 16..=64 characters of base64 alphabet (`A-Z a-z 0-9 + / =`).
    /// Surrounding whitespace from copy/paste is trimmed.
    pub fn parse(raw: &str) -> Result<Self> {
        let key = raw.trim();
        if key.len() < KEY_MIN_LEN || key.len() > KEY_MAX_LEN {
            return Err(DaikinError::Config(format!(
                "device key must be {}-{} characters (got {})",
                KEY_MIN_LEN,
                KEY_MAX_LEN,
                key.len()
            )));
        }
        if !key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=')
        {
            return Err(DaikinError::Config(
                "device key contains invalid characters".to_string(),
            ));
        }
        Ok(Self(SecretString::from(key.to_string())))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for DeviceKey {
    fn clone(&self) -> Self {
        Self(SecretString::from(self.expose().to_string()))
    }
}

impl PartialEq for DeviceKey {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceKey(***)")
    }
}

/// Network address of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            port: DEVICE_PORT,
        }
    }

    pub fn with_port(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Identity details reported by the unit in reply to `Identify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Access-point style hostname, e.g. `DAIKIN1A2B3C`.
    pub apn: String,
    pub mac: String,
    #[serde(default)]
    pub fw_ver: Option<String>,
}

impl DeviceInfo {
    /// Stable identifier derived from the reported MAC.
    pub fn unique_id(&self) -> String {
        normalize_unique_id(&self.mac)
    }
}

/// Lowercase hex with `:`/`-`/`.` separators stripped.
pub fn normalize_unique_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// What setup records about a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIdentity {
    pub unique_id: String,
    pub hostname: String,
    /// Last known address; `None` until discovery finds the unit.
    pub endpoint: Option<Endpoint>,
    pub firmware: Option<String>,
}
