// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::constants::{DEVICE_PORT, SERVICE_TYPE};
use crate::error::{DaikinError, Result};

/// Maps a unit's hostname to its current address.
///
/// Resolution is best-effort: `NotFound` is an ordinary outcome, and the
/// caller keeps using the last known address.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, hostname: &str, timeout: Duration) -> impl Future<Output = Result<IpAddr>> + Send;
}

/// A unit seen while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub hostname: String,
    pub ip: IpAddr,
    pub port: u16,
}

/// Multicast DNS-SD resolver.
#[derive(Debug, Clone)]
pub struct MdnsResolver {
    service_type: String,
    port: u16,
}

impl Default for MdnsResolver {
    fn default() -> Self {
        Self::new(SERVICE_TYPE)
    }
}

impl MdnsResolver {
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            port: DEVICE_PORT,
        }
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Browse for `timeout` and collect every unit that answers on the device port.
    pub async fn browse(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        let mut found: Vec<DiscoveredDevice> = Vec::new();
        self.run_browse(timeout, |info| {
            if info.get_port() != self.port {
                return false;
            }
            if let Some(ip) = pick_address(info.get_addresses().iter()) {
                let hostname = short_name(info.get_hostname());
                if !found.iter().any(|d| d.hostname == hostname) {
                    found.push(DiscoveredDevice {
                        hostname,
                        ip,
                        port: info.get_port(),
                    });
                }
            }
            false
        })
        .await?;
        found.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(found)
    }

    /// Run a browse until `on_resolved` returns true or `timeout` elapses.
    async fn run_browse<F>(&self, timeout: Duration, mut on_resolved: F) -> Result<bool>
    where
        F: FnMut(&ServiceInfo) -> bool,
    {
        let daemon = ServiceDaemon::new().map_err(|e| DaikinError::Discovery {
            reason: format!("cannot start mDNS daemon: {}", e),
        })?;
        let receiver = daemon
            .browse(&self.service_type)
            .map_err(|e| DaikinError::Discovery {
                reason: format!("cannot browse {}: {}", self.service_type, e),
            })?;

        let deadline = Instant::now() + timeout;
        let mut matched = false;
        while let Ok(event) = timeout_at(deadline, receiver.recv_async()).await {
            match event {
                Ok(ServiceEvent::ServiceResolved(info)) => {
                    debug!(
                        "mDNS resolved {} ({}:{})",
                        info.get_fullname(),
                        info.get_hostname(),
                        info.get_port()
                    );
                    if on_resolved(&info) {
                        matched = true;
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mDNS browse channel closed: {}", e);
                    break;
                }
            }
        }

        if let Err(e) = daemon.stop_browse(&self.service_type) {
            debug!("mDNS stop_browse: {}", e);
        }
        if let Err(e) = daemon.shutdown() {
            debug!("mDNS shutdown: {}", e);
        }
        Ok(matched)
    }
}

impl Resolver for MdnsResolver {
    async fn resolve(&self, hostname: &str, timeout: Duration) -> Result<IpAddr> {
        debug!("Resolving {} via {}", hostname, self.service_type);
        let mut resolved = None;
        self.run_browse(timeout, |info| {
            if !matches_device(hostname, info.get_hostname(), info.get_fullname())
                || info.get_port() != self.port
            {
                return false;
            }
            resolved = pick_address(info.get_addresses().iter());
            resolved.is_some()
        })
        .await?;

        match resolved {
            Some(ip) => {
                info!("Resolved {} to {}", hostname, ip);
                Ok(ip)
            }
            None => Err(DaikinError::NotFound {
                hostname: hostname.to_string(),
            }),
        }
    }
}

/// Always answers with the same address. For networks where multicast
/// does not reach the unit.
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver(pub IpAddr);

impl Resolver for StaticResolver {
    async fn resolve(&self, _hostname: &str, _timeout: Duration) -> Result<IpAddr> {
        Ok(self.0)
    }
}

/// Never finds anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiscovery;

impl Resolver for NoDiscovery {
    async fn resolve(&self, hostname: &str, _timeout: Duration) -> Result<IpAddr> {
        Err(DaikinError::NotFound {
            hostname: hostname.to_string(),
        })
    }
}

/// Lowercased first label, e.g. `DAIKIN1A2B3C.local.` → `daikin1a2b3c`.
fn short_name(name: &str) -> String {
    name.trim_end_matches('.')
        .split('.')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase()
}

/// Whether a resolved record belongs to `hostname`, by host name or instance name.
pub fn matches_device(hostname: &str, record_host: &str, record_fullname: &str) -> bool {
    let wanted = short_name(hostname);
    !wanted.is_empty() && (short_name(record_host) == wanted || short_name(record_fullname) == wanted)
}

/// Prefer IPv4; among equals take the lowest for a stable answer.
pub fn pick_address<'a>(addrs: impl Iterator<Item = &'a IpAddr>) -> Option<IpAddr> {
    addrs.copied().min_by_key(|ip| (ip.is_ipv6(), *ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_device() {
        assert!(matches_device("DAIKIN1A2B3C", "DAIKIN1A2B3C.local.", "x._daikin._tcp.local."));
        assert!(matches_device("daikin1a2b3c.local", "esp.local.", "DAIKIN1A2B3C._daikin._tcp.local."));
        assert!(!matches_device("DAIKIN1A2B3C", "DAIKIN999999.local.", "DAIKIN999999._daikin._tcp.local."));
        assert!(!matches_device("", "DAIKIN1A2B3C.local.", ""));
    }

    #[test]
    fn test_pick_address_prefers_ipv4() {
        let addrs: Vec<IpAddr> = vec![
            "fe80::1".parse().unwrap(),
            "192.168.1.50".parse().unwrap(),
            "192.168.1.20".parse().unwrap(),
        ];
        assert_eq!(pick_address(addrs.iter()), Some("192.168.1.20".parse().unwrap()));
        let v6: Vec<IpAddr> = vec!["fe80::1".parse().unwrap()];
        assert_eq!(pick_address(v6.iter()), Some("fe80::1".parse().unwrap()));
        assert_eq!(pick_address([].iter()), None);
    }

    #[tokio::test]
    async fn test_static_and_no_discovery() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(
            StaticResolver(ip).resolve("DAIKIN1A2B3C", Duration::from_millis(10)).await.unwrap(),
            ip
        );
        assert!(matches!(
            NoDiscovery.resolve("DAIKIN1A2B3C", Duration::from_millis(10)).await,
            Err(DaikinError::NotFound { .. })
        ));
    }
}
