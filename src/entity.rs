// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::future::Future;
use std::sync::Arc;

use bitflags::bitflags;
use serde::Serialize;

use crate::climate::{ClimateState, FanMode, HvacMode, Intent, PresetMode, SwingMode};
use crate::constants::{MAX_TEMPERATURE, MIN_TEMPERATURE, TEMPERATURE_STEP};
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::transport::Connector;
use crate::transport::discovery::Resolver;

bitflags! {
    /// Controls a climate entity exposes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClimateFeatures: u8 {
        const TARGET_TEMPERATURE = 0b0000_0001;
        const FAN_MODE           = 0b0000_0010;
        const SWING_MODE         = 0b0000_0100;
        const PRESET_MODE        = 0b0000_1000;
        const TURN_ON            = 0b0001_0000;
        const TURN_OFF           = 0b0010_0000;
    }
}

impl ClimateFeatures {
    /// Names of the set flags, lowercased.
    pub fn names(&self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect()
    }
}

/// Static device description shown next to the entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceCard {
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
    pub sw_version: Option<String>,
    /// `("daikin_br", unique_id)`
    pub identifiers: Vec<(&'static str, String)>,
}

/// A controllable air-conditioner as seen by a host application.
pub trait ClimateEntity: Send + Sync {
    fn unique_id(&self) -> &str;

    fn name(&self) -> &str;

    /// Last known state, `None` before the first successful poll.
    fn state(&self) -> Option<ClimateState>;

    fn available(&self) -> bool;

    /// Apply a change and resolve to the resulting state.
    fn apply(&self, intent: &Intent) -> impl Future<Output = Result<ClimateState>> + Send;

    fn supported_features(&self) -> ClimateFeatures;

    fn hvac_modes(&self) -> &'static [HvacMode] {
        HvacMode::ALL
    }

    fn fan_modes(&self) -> &'static [FanMode] {
        FanMode::ALL
    }

    fn swing_modes(&self) -> &'static [SwingMode] {
        SwingMode::ALL
    }

    fn preset_modes(&self) -> &'static [PresetMode] {
        PresetMode::ALL
    }

    fn min_temperature(&self) -> f64 {
        MIN_TEMPERATURE
    }

    fn max_temperature(&self) -> f64 {
        MAX_TEMPERATURE
    }

    fn temperature_step(&self) -> f64 {
        TEMPERATURE_STEP
    }

    fn device_card(&self) -> DeviceCard;
}

/// Climate entity backed by a [`Coordinator`].
pub struct DaikinClimate<C: Connector, R: Resolver> {
    coordinator: Arc<Coordinator<C, R>>,
    name: String,
    unique_id: String,
}

impl<C: Connector, R: Resolver> DaikinClimate<C, R> {
    pub fn new(coordinator: Arc<Coordinator<C, R>>, name: impl Into<String>, unique_id: impl Into<String>) -> Self {
        Self {
            coordinator,
            name: name.into(),
            unique_id: unique_id.into(),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<C, R>> {
        &self.coordinator
    }
}

impl<C: Connector, R: Resolver> ClimateEntity for DaikinClimate<C, R> {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Option<ClimateState> {
        self.coordinator.snapshot().map(|s| s.climate.clone())
    }

    fn available(&self) -> bool {
        self.coordinator.is_available()
    }

    async fn apply(&self, intent: &Intent) -> Result<ClimateState> {
        let snapshot = self.coordinator.apply(intent).await?;
        Ok(snapshot.climate.clone())
    }

    fn supported_features(&self) -> ClimateFeatures {
        ClimateFeatures::all()
    }

    fn device_card(&self) -> DeviceCard {
        DeviceCard {
            name: self.name.clone(),
            manufacturer: "Daikin",
            model: "Smart AC Series",
            sw_version: self.state().and_then(|s| s.firmware),
            identifiers: vec![("daikin_br", self.unique_id.clone())],
        }
    }
}
