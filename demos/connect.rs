//! Example: Connect to a Daikin unit and print its current state.

use daikin_br::setup::validate_and_connect;
use daikin_br::transport::direct::TcpConnector;
use daikin_br::transport::discovery::MdnsResolver;
use daikin_br::{Coordinator, CoordinatorOptions, DeviceKey};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let key = "c2VjcmV0LWtleS0xMjM0NTY=";

    println!("Connecting to unit...");
    let identity = validate_and_connect("DAIKIN1A2B3C", key).await?;
    println!(
        "  {} at {} (id {}, firmware {})",
        identity.hostname,
        identity
            .endpoint
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
        identity.unique_id,
        identity.firmware.as_deref().unwrap_or("unknown"),
    );

    let coordinator = Coordinator::new(
        identity,
        DeviceKey::parse(key)?,
        TcpConnector::default(),
        MdnsResolver::default(),
        CoordinatorOptions::default(),
    );

    let snapshot = coordinator.refresh().await?;
    let climate = &snapshot.climate;
    println!("\n--- State ---");
    println!("  mode:    {}", climate.hvac_mode);
    println!("  target:  {:.1}", climate.target_temperature);
    if let Some(room) = climate.current_temperature {
        println!("  room:    {room:.1}");
    }
    if let Some(fan) = climate.fan_mode {
        println!("  fan:     {fan}");
    }
    println!("  swing:   {}", climate.swing_mode);
    if let Some(preset) = climate.preset_mode {
        println!("  preset:  {preset}");
    }
    println!("  status:  {}", coordinator.state().as_str());

    coordinator.shutdown().await;
    Ok(())
}
