// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::constants::{
    COOL_MIN_TEMPERATURE, FanCode, MAX_TEMPERATURE, MIN_TEMPERATURE, ModeCode, PresetCode,
    TEMPERATURE_STEP,
};
use crate::error::ValidationError;
use crate::protocol::{Command, StatusReport};

macro_rules! vocabulary {
    ($name:ident, $err:ident, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ValidationError::$err(s.to_string())),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Off,
    Auto,
    Heat,
    Cool,
    Dry,
    FanOnly,
}

vocabulary!(HvacMode, UnknownHvacMode, {
    Off => "off",
    Auto => "auto",
    Heat => "heat",
    Cool => "cool",
    Dry => "dry",
    FanOnly => "fan_only",
});

impl HvacMode {
    /// Power 0 always presents as off, whatever mode code the unit remembers.
    pub fn from_code(power: bool, code: u8) -> Self {
        if !power {
            return HvacMode::Off;
        }
        match ModeCode::from_u8(code) {
            Some(ModeCode::Auto) => HvacMode::Auto,
            Some(ModeCode::Dry) => HvacMode::Dry,
            Some(ModeCode::Cool) => HvacMode::Cool,
            Some(ModeCode::Heat) => HvacMode::Heat,
            Some(ModeCode::Fan) => HvacMode::FanOnly,
            Some(ModeCode::Off) | None => HvacMode::Off,
        }
    }

    pub fn code(&self) -> ModeCode {
        match self {
            HvacMode::Off => ModeCode::Off,
            HvacMode::Auto => ModeCode::Auto,
            HvacMode::Heat => ModeCode::Heat,
            HvacMode::Cool => ModeCode::Cool,
            HvacMode::Dry => ModeCode::Dry,
            HvacMode::FanOnly => ModeCode::Fan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FanMode {
    Auto,
    High,
    MediumHigh,
    Medium,
    LowMedium,
    Low,
    Quiet,
}

vocabulary!(FanMode, UnknownFanMode, {
    Auto => "auto",
    High => "high",
    MediumHigh => "medium_high",
    Medium => "medium",
    LowMedium => "low_medium",
    Low => "low",
    Quiet => "quiet",
});

impl FanMode {
    pub fn from_code(code: u8) -> Option<Self> {
        FanCode::from_u8(code).map(|c| match c {
            FanCode::Auto => FanMode::Auto,
            FanCode::High => FanMode::High,
            FanCode::MediumHigh => FanMode::MediumHigh,
            FanCode::Medium => FanMode::Medium,
            FanCode::LowMedium => FanMode::LowMedium,
            FanCode::Low => FanMode::Low,
            FanCode::Quiet => FanMode::Quiet,
        })
    }

    pub fn code(&self) -> FanCode {
        match self {
            FanMode::Auto => FanCode::Auto,
            FanMode::High => FanCode::High,
            FanMode::MediumHigh => FanCode::MediumHigh,
            FanMode::Medium => FanCode::Medium,
            FanMode::LowMedium => FanCode::LowMedium,
            FanMode::Low => FanCode::Low,
            FanMode::Quiet => FanCode::Quiet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwingMode {
    Off,
    Vertical,
}

vocabulary!(SwingMode, UnknownSwingMode, {
    Off => "off",
    Vertical => "vertical",
});

/// Presets offered to the user. The unit's Coanda airflow preset is not
/// offered and presents as unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresetMode {
    None,
    Eco,
    Boost,
}

vocabulary!(PresetMode, UnknownPreset, {
    None => "none",
    Eco => "eco",
    Boost => "boost",
});

impl PresetMode {
    pub fn from_code(code: PresetCode) -> Option<Self> {
        match code {
            PresetCode::None => Some(PresetMode::None),
            PresetCode::Econo => Some(PresetMode::Eco),
            PresetCode::PowerChill => Some(PresetMode::Boost),
            PresetCode::Coanda => None,
        }
    }

    pub fn code(&self) -> PresetCode {
        match self {
            PresetMode::None => PresetCode::None,
            PresetMode::Eco => PresetCode::Econo,
            PresetMode::Boost => PresetCode::PowerChill,
        }
    }
}

/// Unit state in the controller's vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateState {
    pub power: bool,
    pub hvac_mode: HvacMode,
    pub target_temperature: f64,
    pub current_temperature: Option<f64>,
    /// `None` when the unit reports a fan code outside the known set.
    pub fan_mode: Option<FanMode>,
    pub swing_mode: SwingMode,
    /// `None` when the unit runs a preset that is not offered (Coanda).
    pub preset_mode: Option<PresetMode>,
    pub firmware: Option<String>,
}

pub fn to_presented_state(report: &StatusReport) -> ClimateState {
    ClimateState {
        power: report.power,
        hvac_mode: HvacMode::from_code(report.power, report.mode),
        target_temperature: report.temperature,
        current_temperature: report.room_temp,
        fan_mode: FanMode::from_code(report.fan),
        swing_mode: if report.v_swing {
            SwingMode::Vertical
        } else {
            SwingMode::Off
        },
        preset_mode: PresetMode::from_code(report.preset()),
        firmware: report.fw_ver.clone(),
    }
}

/// A change requested by the user. Unset fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Intent {
    pub hvac_mode: Option<HvacMode>,
    pub target_temperature: Option<f64>,
    pub fan_mode: Option<FanMode>,
    pub swing_mode: Option<SwingMode>,
    pub preset_mode: Option<PresetMode>,
    pub power: Option<bool>,
}

impl Intent {
    pub fn hvac_mode(mode: HvacMode) -> Self {
        Self {
            hvac_mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn temperature(value: f64) -> Self {
        Self {
            target_temperature: Some(value),
            ..Default::default()
        }
    }

    pub fn fan_mode(mode: FanMode) -> Self {
        Self {
            fan_mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn swing_mode(mode: SwingMode) -> Self {
        Self {
            swing_mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn preset_mode(mode: PresetMode) -> Self {
        Self {
            preset_mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn power(on: bool) -> Self {
        Self {
            power: Some(on),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Supported set-point range for `mode`.
pub fn temperature_range(mode: HvacMode) -> (f64, f64) {
    match mode {
        HvacMode::Cool => (COOL_MIN_TEMPERATURE, MAX_TEMPERATURE),
        _ => (MIN_TEMPERATURE, MAX_TEMPERATURE),
    }
}

/// Validate `intent` against the current state and turn it into a command.
///
/// The effective mode is the intent's own mode when present, otherwise the
/// unit's current mode. Nothing is sent when this fails.
pub fn to_command(intent: &Intent, current: Option<&ClimateState>) -> Result<Command, ValidationError> {
    if intent.is_empty() {
        return Err(ValidationError::EmptyIntent);
    }

    match (intent.power, intent.hvac_mode) {
        (Some(false), Some(mode)) if mode != HvacMode::Off => {
            return Err(ValidationError::Conflict("power off with an active mode"));
        }
        (Some(true), Some(HvacMode::Off)) => {
            return Err(ValidationError::Conflict("power on with mode off"));
        }
        _ => {}
    }

    let effective_mode = intent.hvac_mode.or(current.map(|c| c.hvac_mode));
    let powered = match (intent.hvac_mode, intent.power) {
        (Some(HvacMode::Off), _) | (_, Some(false)) => false,
        (Some(_), _) | (_, Some(true)) => true,
        (None, None) => current.is_some_and(|c| c.power),
    };

    let mut command = Command::default();

    match intent.hvac_mode {
        Some(HvacMode::Off) => command.power = Some(false),
        Some(mode) => {
            command.power = Some(true);
            command.mode = Some(mode.code());
        }
        None => command.power = intent.power,
    }

    if let Some(value) = intent.target_temperature {
        if let Some(mode @ (HvacMode::FanOnly | HvacMode::Dry)) = effective_mode {
            return Err(ValidationError::TemperatureNotAdjustable(mode.as_str()));
        }
        let (min, max) = temperature_range(effective_mode.unwrap_or(HvacMode::Auto));
        if !value.is_finite() || value < min || value > max {
            return Err(ValidationError::TemperatureOutOfRange { value, min, max });
        }
        if (value / TEMPERATURE_STEP).fract() != 0.0 {
            return Err(ValidationError::TemperatureStep(value));
        }
        command.temperature = Some(value as u8);
    }

    if let Some(fan) = intent.fan_mode {
        if effective_mode == Some(HvacMode::Dry) {
            return Err(ValidationError::FanNotAdjustable(HvacMode::Dry.as_str()));
        }
        command.fan = Some(fan.code());
    }

    if let Some(swing) = intent.swing_mode {
        command.v_swing = Some(swing == SwingMode::Vertical);
    }

    if let Some(preset) = intent.preset_mode {
        if !powered {
            return Err(ValidationError::DeviceOff);
        }
        command.preset = Some(preset.code());
    }

    command.validate()?;
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(power: bool, mode: u8) -> StatusReport {
        StatusReport {
            power,
            mode,
            temperature: 24.0,
            fan: 17,
            v_swing: false,
            econo: false,
            powerchill: false,
            coanda: false,
            room_temp: Some(27.0),
            fw_ver: Some("1.0.4".to_string()),
        }
    }

    fn state(power: bool, mode: u8) -> ClimateState {
        to_presented_state(&report(power, mode))
    }

    #[test]
    fn test_present_mode_codes() {
        assert_eq!(state(true, 0).hvac_mode, HvacMode::Off);
        assert_eq!(state(true, 1).hvac_mode, HvacMode::Auto);
        assert_eq!(state(true, 2).hvac_mode, HvacMode::Dry);
        assert_eq!(state(true, 3).hvac_mode, HvacMode::Cool);
        assert_eq!(state(true, 4).hvac_mode, HvacMode::Heat);
        assert_eq!(state(true, 6).hvac_mode, HvacMode::FanOnly);
        assert_eq!(state(true, 9).hvac_mode, HvacMode::Off);
        assert_eq!(state(false, 3).hvac_mode, HvacMode::Off);
    }

    #[test]
    fn test_present_fan_and_swing() {
        let mut r = report(true, 3);
        r.fan = 6;
        r.v_swing = true;
        let s = to_presented_state(&r);
        assert_eq!(s.fan_mode, Some(FanMode::MediumHigh));
        assert_eq!(s.swing_mode, SwingMode::Vertical);
        assert_eq!(s.current_temperature, Some(27.0));
        assert_eq!(s.firmware.as_deref(), Some("1.0.4"));

        r.fan = 99;
        assert_eq!(to_presented_state(&r).fan_mode, None);
    }

    #[test]
    fn test_present_presets() {
        let mut r = report(true, 3);
        assert_eq!(to_presented_state(&r).preset_mode, Some(PresetMode::None));
        r.econo = true;
        assert_eq!(to_presented_state(&r).preset_mode, Some(PresetMode::Eco));
        r.econo = false;
        r.powerchill = true;
        assert_eq!(to_presented_state(&r).preset_mode, Some(PresetMode::Boost));
        r.powerchill = false;
        r.coanda = true;
        assert_eq!(to_presented_state(&r).preset_mode, None);
    }

    #[test]
    fn test_coanda_is_never_offered() {
        assert!(PresetMode::ALL.iter().all(|p| p.code() != PresetCode::Coanda));
        assert!("coanda".parse::<PresetMode>().is_err());
    }

    #[test]
    fn test_vocabulary_parse() {
        assert_eq!("fan_only".parse::<HvacMode>().unwrap(), HvacMode::FanOnly);
        assert_eq!(" Medium_High ".parse::<FanMode>().unwrap(), FanMode::MediumHigh);
        assert_eq!("vertical".parse::<SwingMode>().unwrap(), SwingMode::Vertical);
        assert_eq!("eco".parse::<PresetMode>().unwrap(), PresetMode::Eco);
        assert_eq!(
            "turbo".parse::<FanMode>(),
            Err(ValidationError::UnknownFanMode("turbo".to_string()))
        );
        for mode in HvacMode::ALL {
            assert_eq!(mode.as_str().parse::<HvacMode>().unwrap(), *mode);
        }
    }

    #[test]
    fn test_mode_change_commands() {
        let current = state(true, 3);
        let cmd = to_command(&Intent::hvac_mode(HvacMode::Heat), Some(&current)).unwrap();
        assert_eq!(cmd.power, Some(true));
        assert_eq!(cmd.mode, Some(ModeCode::Heat));

        let cmd = to_command(&Intent::hvac_mode(HvacMode::Off), Some(&current)).unwrap();
        assert_eq!(cmd, Command::power_off());
    }

    #[test]
    fn test_temperature_rules() {
        let cool = state(true, 3);
        let heat = state(true, 4);
        assert_eq!(
            to_command(&Intent::temperature(24.0), Some(&cool)).unwrap().temperature,
            Some(24)
        );
        assert!(matches!(
            to_command(&Intent::temperature(12.0), Some(&cool)),
            Err(ValidationError::TemperatureOutOfRange { min, .. }) if min == 16.0
        ));
        assert!(to_command(&Intent::temperature(12.0), Some(&heat)).is_ok());
        assert!(to_command(&Intent::temperature(9.0), Some(&heat)).is_err());
        assert!(to_command(&Intent::temperature(33.0), Some(&heat)).is_err());
        assert_eq!(
            to_command(&Intent::temperature(22.5), Some(&heat)),
            Err(ValidationError::TemperatureStep(22.5))
        );
        assert!(to_command(&Intent::temperature(f64::NAN), Some(&heat)).is_err());
    }

    #[test]
    fn test_temperature_locked_in_fan_and_dry() {
        for code in [2u8, 6] {
            assert!(matches!(
                to_command(&Intent::temperature(24.0), Some(&state(true, code))),
                Err(ValidationError::TemperatureNotAdjustable(_))
            ));
        }
        let switching = Intent {
            hvac_mode: Some(HvacMode::Cool),
            target_temperature: Some(20.0),
            ..Default::default()
        };
        assert!(to_command(&switching, Some(&state(true, 6))).is_ok());
    }

    #[test]
    fn test_fan_locked_in_dry() {
        assert_eq!(
            to_command(&Intent::fan_mode(FanMode::High), Some(&state(true, 2))),
            Err(ValidationError::FanNotAdjustable("dry"))
        );
        let cmd = to_command(&Intent::fan_mode(FanMode::Quiet), Some(&state(true, 3))).unwrap();
        assert_eq!(cmd.fan, Some(FanCode::Quiet));
    }

    #[test]
    fn test_preset_requires_power() {
        assert_eq!(
            to_command(&Intent::preset_mode(PresetMode::Eco), Some(&state(false, 3))),
            Err(ValidationError::DeviceOff)
        );
        assert_eq!(
            to_command(&Intent::preset_mode(PresetMode::Eco), None),
            Err(ValidationError::DeviceOff)
        );
        let switching_on = Intent {
            hvac_mode: Some(HvacMode::Cool),
            preset_mode: Some(PresetMode::Boost),
            ..Default::default()
        };
        let cmd = to_command(&switching_on, Some(&state(false, 3))).unwrap();
        assert_eq!(cmd.preset, Some(PresetCode::PowerChill));
    }

    #[test]
    fn test_swing_command() {
        let cmd = to_command(&Intent::swing_mode(SwingMode::Vertical), Some(&state(true, 3))).unwrap();
        assert_eq!(cmd.v_swing, Some(true));
    }

    #[test]
    fn test_conflicts_and_empty() {
        assert_eq!(to_command(&Intent::default(), None), Err(ValidationError::EmptyIntent));
        let conflict = Intent {
            power: Some(false),
            hvac_mode: Some(HvacMode::Heat),
            ..Default::default()
        };
        assert!(matches!(
            to_command(&conflict, None),
            Err(ValidationError::Conflict(_))
        ));
        let cmd = to_command(&Intent::power(true), Some(&state(false, 3))).unwrap();
        assert_eq!(cmd.power, Some(true));
        assert_eq!(cmd.mode, None);
    }
}
