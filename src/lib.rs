// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client
//
//! # daikin-br
//!
//! Local-network control of Daikin (Brazil) smart air-conditioners, with no
//! cloud round-trip.
//!
//! A [`Coordinator`] owns one authenticated session per unit, polls it on a
//! fixed schedule, applies user changes, follows the unit when its address
//! changes, and publishes an immutable [`DeviceSnapshot`] plus an
//! availability flag.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use daikin_br::{ClimateEntity, Coordinator, CoordinatorOptions, DaikinClimate, HvacMode, Intent};
//! use daikin_br::setup::validate_and_connect;
//! use daikin_br::transport::direct::TcpConnector;
//! use daikin_br::transport::discovery::MdnsResolver;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let key = "c2VjcmV0LWtleS0xMjM0NTY=";
//!     let identity = validate_and_connect("DAIKIN1A2B3C", key).await?;
//!
//!     let coordinator = Arc::new(Coordinator::new(
//!         identity.clone(),
//!         daikin_br::DeviceKey::parse(key)?,
//!         TcpConnector::default(),
//!         MdnsResolver::default(),
//!         CoordinatorOptions::default(),
//!     ));
//!     coordinator.start().await?;
//!
//!     let entity = DaikinClimate::new(coordinator.clone(), "Bedroom", identity.unique_id);
//!     entity.apply(&Intent::hvac_mode(HvacMode::Cool)).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod climate;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod crypto;
pub mod device;
pub mod entity;
pub mod error;
pub mod event;
pub mod protocol;
pub mod setup;
pub mod transport;

// Re-exports for convenience
pub use climate::{ClimateState, FanMode, HvacMode, Intent, PresetMode, SwingMode};
pub use config::{CoordinatorOptions, CoordinatorOptionsBuilder, DeviceConfig, DeviceConfigBuilder};
pub use coordinator::{Coordinator, CoordinatorState, CoordinatorStatus, DeviceSnapshot};
pub use device::{DeviceIdentity, DeviceInfo, DeviceKey, Endpoint};
pub use entity::{ClimateEntity, ClimateFeatures, DaikinClimate, DeviceCard};
pub use error::{DaikinError, DecodeError, Result, ValidationError};
pub use event::{CoordinatorEvent, EventReceiver};
pub use setup::SetupError;
