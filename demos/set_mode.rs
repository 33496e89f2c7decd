//! Example: Switch a Daikin unit to cooling at 24 degrees and watch it settle.

use std::sync::Arc;
use std::time::Duration;

use daikin_br::setup::validate_and_connect;
use daikin_br::transport::direct::TcpConnector;
use daikin_br::transport::discovery::MdnsResolver;
use daikin_br::{
    ClimateEntity, Coordinator, CoordinatorEvent, CoordinatorOptions, DaikinClimate, DeviceKey,
    HvacMode, Intent,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let key = "c2VjcmV0LWtleS0xMjM0NTY=";
    let identity = validate_and_connect("DAIKIN1A2B3C", key).await?;

    let options = CoordinatorOptions::builder()
        .poll_interval(Duration::from_secs(5))
        .build();
    let coordinator = Arc::new(Coordinator::new(
        identity.clone(),
        DeviceKey::parse(key)?,
        TcpConnector::default(),
        MdnsResolver::default(),
        options,
    ));
    coordinator.start().await?;

    let entity = DaikinClimate::new(coordinator.clone(), "Living room", identity.unique_id);
    let mut events = coordinator.subscribe();

    let intent = Intent {
        target_temperature: Some(24.0),
        ..Intent::hvac_mode(HvacMode::Cool)
    };
    let state = entity.apply(&intent).await?;
    println!(
        "Applied: mode={} target={:.1}",
        state.hvac_mode, state.target_temperature
    );

    println!("Listening for updates (Ctrl+C to stop)...");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(CoordinatorEvent::AvailabilityChanged { available }) => {
                    println!("  available={available}");
                }
                Ok(_) => {
                    if let Some(state) = entity.state() {
                        println!(
                            "  mode={} target={:.1} room={:?}",
                            state.hvac_mode, state.target_temperature, state.current_temperature
                        );
                    }
                }
                Err(_) => break,
            },
        }
    }

    coordinator.shutdown().await;
    Ok(())
}
