// MIT License - Copyright (c) 2026 Peter Wright
// Daikin BR LAN client

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use daikin_br::constants::{DEFAULT_DISCOVERY_TIMEOUT, DEVICE_PORT};
use daikin_br::device::normalize_unique_id;
use daikin_br::setup::SetupFlow;
use daikin_br::transport::direct::TcpConnector;
use daikin_br::transport::discovery::{MdnsResolver, Resolver};
use daikin_br::{
    ClimateEntity, Coordinator, CoordinatorEvent, CoordinatorOptions, DaikinClimate, DeviceConfig,
    DeviceKey, FanMode, HvacMode, Intent, PresetMode, SwingMode,
};

type LanCoordinator = Coordinator<TcpConnector, MdnsResolver>;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "daikin-br")]
#[command(about = "Local control of Daikin (Brazil) smart air-conditioners")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Poll every configured unit until SIGINT/SIGTERM (SIGHUP reloads)
    Run,
    /// Browse the network for units, or resolve one hostname
    Discover {
        hostname: Option<String>,
        /// Browse time in seconds
        #[arg(long, default_value_t = 5)]
        timeout: u64,
    },
    /// Check a device key against a unit and print its config entry
    Setup {
        /// Unit address or DAIKINXXXXXX hostname
        host: String,
        #[arg(long)]
        key: String,
        /// Label for the config entry
        #[arg(long)]
        name: Option<String>,
    },
    /// Poll a configured unit once and print its state
    Status { device: String },
    /// Change a configured unit's settings
    Set {
        device: String,
        #[arg(long)]
        mode: Option<HvacMode>,
        #[arg(long)]
        temp: Option<f64>,
        #[arg(long)]
        fan: Option<FanMode>,
        #[arg(long)]
        swing: Option<SwingMode>,
        #[arg(long)]
        preset: Option<PresetMode>,
        #[arg(long, value_enum)]
        power: Option<Power>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Power {
    On,
    Off,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Config {
    #[serde(default)]
    devices: Vec<DeviceToml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceToml {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    hostname: String,
    /// Last known address; discovery is used when absent. Rewritten when the
    /// unit is found at a new address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<IpAddr>,
    #[serde(default = "default_port")]
    port: u16,
    device_key: String,
    unique_id: String,
    #[serde(default = "default_poll_interval")]
    poll_interval_secs: u64,
}

fn default_port() -> u16 {
    DEVICE_PORT
}
fn default_poll_interval() -> u64 {
    10
}

fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&text).context("Failed to parse config file")
}

fn build_device_config(toml: &DeviceToml) -> Result<DeviceConfig> {
    let key = DeviceKey::parse(&toml.device_key)
        .with_context(|| format!("Invalid device_key for {}", toml.hostname))?;
    let options = CoordinatorOptions::builder()
        .poll_interval(Duration::from_secs(toml.poll_interval_secs))
        .build();
    let mut builder = DeviceConfig::builder()
        .hostname(&toml.hostname)
        .port(toml.port)
        .device_key(key)
        .unique_id(&toml.unique_id)
        .options(options);
    if let Some(name) = &toml.name {
        builder = builder.name(name);
    }
    if let Some(ip) = toml.ip {
        builder = builder.ip(ip);
    }
    Ok(builder.build()?)
}

/// Record a unit's new address in the config file so the next start goes
/// straight to it. Returns false when no entry matches `unique_id`.
///
/// The file is re-serialised, so comments and key order are not preserved.
fn persist_endpoint(path: impl AsRef<Path>, unique_id: &str, ip: IpAddr) -> Result<bool> {
    // loggers for different units may write at the same time
    static WRITE_LOCK: Mutex<()> = Mutex::new(());
    let _guard = WRITE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let path = path.as_ref();
    let mut config = load_config(path)?;
    let unique_id = normalize_unique_id(unique_id);
    let Some(device) = config
        .devices
        .iter_mut()
        .find(|d| normalize_unique_id(&d.unique_id) == unique_id)
    else {
        return Ok(false);
    };
    if device.ip == Some(ip) {
        return Ok(true);
    }
    device.ip = Some(ip);

    let text = toml::to_string(&config).context("Failed to serialise config")?;
    let staging = path.with_extension("toml.tmp");
    std::fs::write(&staging, text).context("Failed to write config file")?;
    std::fs::rename(&staging, path).context("Failed to replace config file")?;
    Ok(true)
}

fn build_device_configs(config: &Config) -> Result<Vec<DeviceConfig>> {
    config.devices.iter().map(build_device_config).collect()
}

/// Find a device by name, hostname or unique id (case-insensitive).
fn find_device<'a>(devices: &'a [DeviceConfig], query: &str) -> Option<&'a DeviceConfig> {
    let query = query.trim();
    devices.iter().find(|d| {
        d.name.eq_ignore_ascii_case(query)
            || d.hostname.eq_ignore_ascii_case(query)
            || d.unique_id.eq_ignore_ascii_case(query)
    })
}

fn build_coordinator(config: &DeviceConfig) -> LanCoordinator {
    Coordinator::new(
        config.identity(),
        config.device_key.clone(),
        TcpConnector::new(config.options.request_timeout),
        MdnsResolver::default(),
        config.options.clone(),
    )
}

fn build_intent(
    mode: Option<HvacMode>,
    temp: Option<f64>,
    fan: Option<FanMode>,
    swing: Option<SwingMode>,
    preset: Option<PresetMode>,
    power: Option<Power>,
) -> Intent {
    Intent {
        hvac_mode: mode,
        target_temperature: temp,
        fan_mode: fan,
        swing_mode: swing,
        preset_mode: preset,
        power: power.map(|p| p == Power::On),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_discover(hostname: Option<String>, timeout: Duration) -> Result<()> {
    let resolver = MdnsResolver::default();
    match hostname {
        Some(hostname) => {
            let ip = resolver
                .resolve(&hostname, timeout)
                .await
                .with_context(|| format!("Could not resolve {hostname}"))?;
            println!("{hostname}\t{ip}");
        }
        None => {
            let found = resolver.browse(timeout).await.context("mDNS browse failed")?;
            if found.is_empty() {
                println!("No units found on {}", resolver.service_type());
            }
            for device in found {
                println!("{}\t{}:{}", device.hostname, device.ip, device.port);
            }
        }
    }
    Ok(())
}

async fn cmd_setup(host: &str, key: &str, name: Option<String>) -> Result<()> {
    let flow = SetupFlow::default();
    let identity = match flow.validate_and_connect(host, key).await {
        Ok(identity) => identity,
        Err(e) => anyhow::bail!("Setup failed [{}]: {e}", e.code()),
    };
    info!(
        "Unit {} verified (firmware {})",
        identity.unique_id,
        identity.firmware.as_deref().unwrap_or("unknown")
    );

    let entry = Config {
        devices: vec![DeviceToml {
            name,
            hostname: identity.hostname.clone(),
            ip: identity.endpoint.map(|e| e.ip),
            port: identity.endpoint.map_or(DEVICE_PORT, |e| e.port),
            device_key: key.trim().to_string(),
            unique_id: identity.unique_id,
            poll_interval_secs: default_poll_interval(),
        }],
    };
    print!("{}", toml::to_string(&entry).context("Failed to render config entry")?);
    Ok(())
}

async fn cmd_status(config: &DeviceConfig) -> Result<()> {
    let coordinator = build_coordinator(config);
    let result = coordinator.refresh().await;
    let status = coordinator.status();
    coordinator.shutdown().await;

    let snapshot = result.with_context(|| format!("Failed to poll {}", config.name))?;
    let out = serde_json::json!({
        "name": config.name,
        "unique_id": config.unique_id,
        "state": snapshot.climate,
        "updated_at": snapshot.updated_at,
        "coordinator": status,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn cmd_set(config: &DeviceConfig, intent: Intent) -> Result<()> {
    let coordinator = Arc::new(build_coordinator(config));
    let entity = DaikinClimate::new(coordinator.clone(), &config.name, &config.unique_id);

    // The first poll gives the mapper the unit's current mode to validate against
    if let Err(e) = coordinator.refresh().await {
        warn!("Initial poll of {} failed: {e}", config.name);
    }
    let result = entity.apply(&intent).await;
    coordinator.shutdown().await;

    let state = result.with_context(|| format!("Failed to apply change to {}", config.name))?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Bridge loop
// ---------------------------------------------------------------------------

fn spawn_event_logger(
    name: String,
    unique_id: String,
    config_path: String,
    coordinator: &LanCoordinator,
) -> JoinHandle<()> {
    let mut rx = coordinator.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(CoordinatorEvent::StateUpdated(snapshot)) => {
                    let c = &snapshot.climate;
                    debug!(
                        "[{name}] {} {}°C fan={} room={}",
                        c.hvac_mode,
                        c.target_temperature,
                        c.fan_mode.map_or("-", |f| f.as_str()),
                        c.current_temperature
                            .map_or_else(|| "-".to_string(), |t| format!("{t}°C"))
                    );
                }
                Ok(CoordinatorEvent::StateChanged { old, new }) => {
                    info!("[{name}] {old} -> {new}");
                }
                Ok(CoordinatorEvent::AvailabilityChanged { available }) => {
                    if available {
                        info!("[{name}] available");
                    } else {
                        warn!("[{name}] unavailable");
                    }
                }
                Ok(CoordinatorEvent::EndpointUpdated { old, new }) => {
                    info!("[{name}] address changed {old} -> {new}");
                    match persist_endpoint(&config_path, &unique_id, new.ip) {
                        Ok(true) => debug!("[{name}] saved {} to {config_path}", new.ip),
                        Ok(false) => warn!("[{name}] no entry for {unique_id} in {config_path}"),
                        Err(e) => warn!("[{name}] failed to save new address: {e:#}"),
                    }
                }
                Ok(CoordinatorEvent::AuthFailed) => {
                    error!("[{name}] device key rejected; update device_key and send SIGHUP");
                }
                Ok(CoordinatorEvent::UniqueIdMismatch { expected, actual }) => {
                    error!("[{name}] expected unit {expected} but found {actual}; rerun setup");
                }
                Ok(CoordinatorEvent::Stopped) => break,
                Ok(event) => debug!("[{name}] {event:?}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("[{name}] event logger lagged by {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn cmd_run(config_path: &str, mut devices: Vec<DeviceConfig>) -> Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        if devices.is_empty() {
            warn!("No devices configured in {config_path}");
        }

        let mut running = Vec::with_capacity(devices.len());
        for config in &devices {
            let coordinator = Arc::new(build_coordinator(config));
            let logger = spawn_event_logger(
                config.name.clone(),
                config.unique_id.clone(),
                config_path.to_string(),
                &coordinator,
            );
            coordinator
                .start()
                .await
                .with_context(|| format!("Failed to start {}", config.name))?;
            info!("Polling {} every {:?}", config.name, config.options.poll_interval);
            running.push((coordinator, logger));
        }

        info!("Running. Send SIGHUP to reload, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting coordinators...");
                true
            }
        };

        for (coordinator, logger) in running {
            coordinator.shutdown().await;
            if let Err(e) = logger.await {
                warn!("Event logger ended abnormally: {e}");
            }
        }

        if !restart {
            break;
        }

        // Keep the previous config if the new one does not load
        match load_config(config_path).and_then(|c| build_device_configs(&c)) {
            Ok(new_devices) => {
                devices = new_devices;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=daikin_br=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let devices = build_device_configs(&load_config(&cli.config)?)?;
            cmd_run(&cli.config, devices).await
        }
        Command::Discover { hostname, timeout } => {
            let timeout = Duration::from_secs(timeout).max(DEFAULT_DISCOVERY_TIMEOUT);
            cmd_discover(hostname, timeout).await
        }
        Command::Setup { host, key, name } => cmd_setup(&host, &key, name).await,
        Command::Status { device } => {
            let devices = build_device_configs(&load_config(&cli.config)?)?;
            let config = find_device(&devices, &device)
                .with_context(|| format!("No device named {device} in {}", cli.config))?;
            cmd_status(config).await
        }
        Command::Set {
            device,
            mode,
            temp,
            fan,
            swing,
            preset,
            power,
        } => {
            let devices = build_device_configs(&load_config(&cli.config)?)?;
            let config = find_device(&devices, &device)
                .with_context(|| format!("No device named {device} in {}", cli.config))?;
            let intent = build_intent(mode, temp, fan, swing, preset, power);
            cmd_set(config, intent).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
[[devices]]
name = "Living room"
hostname = "DAIKIN1A2B3C"
ip = "192.168.1.40"
device_key = "c2VjcmV0LWtleS0xMjM0NTY="
unique_id = "AA:BB:CC:1A:2B:3C"

[[devices]]
hostname = "DAIKIN4D5E6F"
device_key = "c2VjcmV0LWtleS0xMjM0NTY="
unique_id = "aabbcc4d5e6f"
poll_interval_secs = 1
"#;

    fn write_config(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = write_config(CONFIG);
        let config = load_config(file.path()).unwrap();
        let devices = build_device_configs(&config).unwrap();
        assert_eq!(devices.len(), 2);

        let living = &devices[0];
        assert_eq!(living.name, "Living room");
        assert_eq!(living.unique_id, "aabbcc1a2b3c");
        assert_eq!(living.port, DEVICE_PORT);
        assert_eq!(living.options.poll_interval, Duration::from_secs(10));

        let second = &devices[1];
        assert_eq!(second.name, "DAIKIN4D5E6F");
        assert_eq!(second.ip, None);
        // clamped to the floor
        assert_eq!(second.options.poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_find_device() {
        let file = write_config(CONFIG);
        let devices = build_device_configs(&load_config(file.path()).unwrap()).unwrap();
        assert!(find_device(&devices, "living room").is_some());
        assert!(find_device(&devices, "daikin4d5e6f").is_some());
        assert!(find_device(&devices, "AABBCC1A2B3C").is_some());
        assert!(find_device(&devices, "kitchen").is_none());
    }

    #[test]
    fn test_bad_key_rejected() {
        let file = write_config(
            r#"
[[devices]]
hostname = "DAIKIN1A2B3C"
device_key = "nope"
unique_id = "aabbcc1a2b3c"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert!(build_device_configs(&config).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(load_config("/nonexistent/daikin.toml").is_err());
    }

    #[test]
    fn test_setup_entry_round_trips() {
        let entry = Config {
            devices: vec![DeviceToml {
                name: None,
                hostname: "DAIKIN1A2B3C".to_string(),
                ip: Some("192.168.1.40".parse().unwrap()),
                port: DEVICE_PORT,
                device_key: "c2VjcmV0LWtleS0xMjM0NTY=".to_string(),
                unique_id: "aabbcc1a2b3c".to_string(),
                poll_interval_secs: 10,
            }],
        };
        let text = toml::to_string(&entry).unwrap();
        assert!(text.contains("[[devices]]"));
        let file = write_config(&text);
        let devices = build_device_configs(&load_config(file.path()).unwrap()).unwrap();
        assert_eq!(devices[0].ip, Some("192.168.1.40".parse().unwrap()));
    }

    #[test]
    fn test_new_address_written_back() {
        let file = write_config(CONFIG);
        let moved: IpAddr = "192.168.1.77".parse().unwrap();

        assert!(persist_endpoint(file.path(), "aabbcc4d5e6f", moved).unwrap());
        let devices = build_device_configs(&load_config(file.path()).unwrap()).unwrap();
        assert_eq!(devices[0].ip, Some("192.168.1.40".parse().unwrap()));
        assert_eq!(devices[1].ip, Some(moved));
        assert_eq!(devices[1].options.poll_interval, Duration::from_secs(5));

        // stored ids are matched after normalisation
        assert!(persist_endpoint(file.path(), "aa:bb:cc:1a:2b:3c", moved).unwrap());
        let devices = build_device_configs(&load_config(file.path()).unwrap()).unwrap();
        assert_eq!(devices[0].ip, Some(moved));
        assert_eq!(devices[0].name, "Living room");

        assert!(!persist_endpoint(file.path(), "aabbcc000000", moved).unwrap());
    }

    #[test]
    fn test_build_intent() {
        let intent = build_intent(Some(HvacMode::Cool), Some(24.0), None, None, None, Some(Power::On));
        assert_eq!(intent.hvac_mode, Some(HvacMode::Cool));
        assert_eq!(intent.power, Some(true));
        assert!(build_intent(None, None, None, None, None, None).is_empty());
    }
}
