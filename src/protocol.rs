// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

//! Frame layout and payload codec.
//!
//! # Wire format
//!
//! ```text
//! STX [CRYPT] escape(xor(body)) ETX
//! body = kind:u8 | seq:u8 | len:u16 BE | payload[len] | crc16:u16 BE
//! ```
//!
//! The CRC (CRC-16/ARC) covers `kind | seq | len | payload`. Bodies are
//! XORed with the device-key keystream (see [`DaikinCrypt`]) and every
//! STX, ETX or DLE byte that results is DLE-escaped. `Nak` frames are the
//! only frames sent in clear, so a client holding the wrong key can still
//! read the rejection.
//!
//! # Payloads
//!
//! State and commands are JSON objects under a `port1` key:
//!
//! ```text
//! {"port1":{"power":1,"mode":3,"temperature":24,"fan":17,"v_swing":0,
//!           "econo":0,"powerchill":0,"coanda":0,
//!           "sensors":{"room_temp":26.5},"fw_ver":"1.2.3"}}
//! ```
//!
//! Identity replies carry `{"apn":"DAIKIN1A2B3C","mac":"..","fw_ver":".."}`.
//! `Nak` carries a single error-code byte.

use serde::{Deserialize, Serialize};

use crate::constants::{
    BODY_OVERHEAD, CRYPT, DLE, ETX, FanCode, MAX_BUFFERED_BYTES, MAX_PAYLOAD_LEN, MAX_TEMPERATURE,
    MIN_TEMPERATURE, ModeCode, NakCode, PresetCode, STX,
};
use crate::crypto::{DaikinCrypt, compute_crc, escape, unescape};
use crate::device::{DeviceInfo, DeviceKey};
use crate::error::{DecodeError, ValidationError};

/// Frame kind byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Client → unit: start of session, asks for identity.
    Identify = 0x01,
    /// Client → unit: asks for the current state.
    StatusRequest = 0x02,
    /// Client → unit: apply a [`Command`].
    Operate = 0x03,
    Identity = 0x81,
    Status = 0x82,
    /// Unit → client: command accepted, payload is the resulting state.
    OperateAck = 0x83,
    Nak = 0xEE,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Identify),
            0x02 => Some(Self::StatusRequest),
            0x03 => Some(Self::Operate),
            0x81 => Some(Self::Identity),
            0x82 => Some(Self::Status),
            0x83 => Some(Self::OperateAck),
            0xEE => Some(Self::Nak),
            _ => None,
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Identify,
    StatusRequest,
    Operate(Command),
    Identity(DeviceInfo),
    Status(StatusReport),
    OperateAck(StatusReport),
    Nak(NakCode),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Identify => FrameKind::Identify,
            Frame::StatusRequest => FrameKind::StatusRequest,
            Frame::Operate(_) => FrameKind::Operate,
            Frame::Identity(_) => FrameKind::Identity,
            Frame::Status(_) => FrameKind::Status,
            Frame::OperateAck(_) => FrameKind::OperateAck,
            Frame::Nak(_) => FrameKind::Nak,
        }
    }
}

/// A state change to send to the unit. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Command {
    pub power: Option<bool>,
    /// Never [`ModeCode::Off`]; switching off is `power: Some(false)`.
    pub mode: Option<ModeCode>,
    pub temperature: Option<u8>,
    pub fan: Option<FanCode>,
    pub v_swing: Option<bool>,
    pub preset: Option<PresetCode>,
}

impl Command {
    pub fn power_off() -> Self {
        Self {
            power: Some(false),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_none()
            && self.mode.is_none()
            && self.temperature.is_none()
            && self.fan.is_none()
            && self.v_swing.is_none()
            && self.preset.is_none()
    }

    /// Reject values the unit cannot represent.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyIntent);
        }
        if let Some(t) = self.temperature {
            let value = f64::from(t);
            if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&value) {
                return Err(ValidationError::TemperatureOutOfRange {
                    value,
                    min: MIN_TEMPERATURE,
                    max: MAX_TEMPERATURE,
                });
            }
        }
        if self.preset == Some(PresetCode::Coanda) {
            return Err(ValidationError::UnsupportedPreset);
        }
        if self.mode == Some(ModeCode::Off) {
            return Err(ValidationError::Conflict("off is sent as power off"));
        }
        if self.power == Some(false) && self.mode.is_some() {
            return Err(ValidationError::Conflict("power off combined with a mode"));
        }
        Ok(())
    }

    fn to_wire(&self) -> CommandWire {
        let (econo, powerchill) = match self.preset {
            Some(PresetCode::Econo) => (Some(1), Some(0)),
            Some(PresetCode::PowerChill) => (Some(0), Some(1)),
            Some(_) => (Some(0), Some(0)),
            None => (None, None),
        };
        CommandWire {
            power: self.power.map(u8::from),
            mode: self.mode.map(|m| m as u8),
            temperature: self.temperature,
            fan: self.fan.map(|f| f as u8),
            v_swing: self.v_swing.map(u8::from),
            econo,
            powerchill,
        }
    }

    fn from_wire(wire: CommandWire) -> Result<Self, DecodeError> {
        let power = wire.power.map(|v| flag("power", v)).transpose()?;
        let mode = wire
            .mode
            .map(|v| {
                ModeCode::from_u8(v)
                    .filter(|m| *m != ModeCode::Off)
                    .ok_or_else(|| out_of_range("mode", v))
            })
            .transpose()?;
        if let Some(t) = wire.temperature {
            let value = f64::from(t);
            if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&value) {
                return Err(out_of_range("temperature", t));
            }
        }
        let fan = wire
            .fan
            .map(|v| FanCode::from_u8(v).ok_or_else(|| out_of_range("fan", v)))
            .transpose()?;
        let v_swing = wire.v_swing.map(|v| flag("v_swing", v)).transpose()?;
        let econo = wire.econo.map(|v| flag("econo", v)).transpose()?;
        let powerchill = wire.powerchill.map(|v| flag("powerchill", v)).transpose()?;
        let preset = match (econo, powerchill) {
            (None, None) => None,
            (Some(true), Some(true)) => {
                return Err(DecodeError::FieldOutOfRange {
                    field: "econo",
                    value: "set together with powerchill".to_string(),
                });
            }
            (Some(true), _) => Some(PresetCode::Econo),
            (_, Some(true)) => Some(PresetCode::PowerChill),
            _ => Some(PresetCode::None),
        };

        let command = Self {
            power,
            mode,
            temperature: wire.temperature,
            fan,
            v_swing,
            preset,
        };
        command
            .validate()
            .map_err(|e| DecodeError::Payload(e.to_string()))?;
        Ok(command)
    }
}

/// State reported by the unit.
///
/// `mode` and `fan` keep the raw code so an unrecognised value survives
/// decoding; interpretation happens in [`crate::climate`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub power: bool,
    pub mode: u8,
    pub temperature: f64,
    pub fan: u8,
    pub v_swing: bool,
    pub econo: bool,
    pub powerchill: bool,
    pub coanda: bool,
    pub room_temp: Option<f64>,
    pub fw_ver: Option<String>,
}

impl StatusReport {
    pub fn mode_code(&self) -> Option<ModeCode> {
        ModeCode::from_u8(self.mode)
    }

    pub fn fan_code(&self) -> Option<FanCode> {
        FanCode::from_u8(self.fan)
    }

    /// The active preset. `econo` wins over `powerchill`, which wins over `coanda`.
    pub fn preset(&self) -> PresetCode {
        if self.econo {
            PresetCode::Econo
        } else if self.powerchill {
            PresetCode::PowerChill
        } else if self.coanda {
            PresetCode::Coanda
        } else {
            PresetCode::None
        }
    }

    fn to_wire(&self) -> StatusWire {
        StatusWire {
            power: u8::from(self.power),
            mode: self.mode,
            temperature: self.temperature,
            fan: self.fan,
            v_swing: u8::from(self.v_swing),
            econo: u8::from(self.econo),
            powerchill: u8::from(self.powerchill),
            coanda: u8::from(self.coanda),
            sensors: self.room_temp.map(|t| SensorsWire { room_temp: Some(t) }),
            fw_ver: self.fw_ver.clone(),
        }
    }

    fn from_wire(wire: StatusWire) -> Result<Self, DecodeError> {
        if !wire.temperature.is_finite() {
            return Err(out_of_range("temperature", wire.temperature));
        }
        Ok(Self {
            power: flag("power", wire.power)?,
            mode: wire.mode,
            temperature: wire.temperature,
            fan: wire.fan,
            v_swing: flag("v_swing", wire.v_swing)?,
            econo: flag("econo", wire.econo)?,
            powerchill: flag("powerchill", wire.powerchill)?,
            coanda: flag("coanda", wire.coanda)?,
            room_temp: wire.sensors.and_then(|s| s.room_temp),
            fw_ver: wire.fw_ver,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct Port<T> {
    port1: T,
}

#[derive(Serialize, Deserialize)]
struct CommandWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    power: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    temperature: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fan: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    v_swing: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    econo: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    powerchill: Option<u8>,
}

#[derive(Serialize, Deserialize)]
struct StatusWire {
    power: u8,
    mode: u8,
    temperature: f64,
    fan: u8,
    #[serde(default)]
    v_swing: u8,
    #[serde(default)]
    econo: u8,
    #[serde(default)]
    powerchill: u8,
    #[serde(default)]
    coanda: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sensors: Option<SensorsWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fw_ver: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct SensorsWire {
    #[serde(default)]
    room_temp: Option<f64>,
}

fn flag(field: &'static str, v: u8) -> Result<bool, DecodeError> {
    match v {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(out_of_range(field, other)),
    }
}

fn out_of_range(field: &'static str, value: impl ToString) -> DecodeError {
    DecodeError::FieldOutOfRange {
        field,
        value: value.to_string(),
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(payload).map_err(|e| DecodeError::Payload(e.to_string()))
}

fn to_json<T: Serialize>(value: &T) -> Vec<u8> {
    // Serializing these plain structs cannot fail.
    serde_json::to_vec(value).unwrap_or_default()
}

/// A frame together with the sequence number it carried.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub seq: u8,
    pub frame: Frame,
}

/// Encodes and decodes frames with one device key.
#[derive(Clone)]
pub struct FrameCodec {
    crypt: DaikinCrypt,
}

impl FrameCodec {
    pub fn new(key: &DeviceKey) -> Self {
        Self {
            crypt: DaikinCrypt::new(key),
        }
    }

    /// Serialize `frame` with sequence number `seq`.
    ///
    /// Deterministic: the same frame and sequence always produce the same bytes.
    pub fn encode(&self, frame: &Frame, seq: u8) -> Result<Vec<u8>, ValidationError> {
        let payload = match frame {
            Frame::Identify | Frame::StatusRequest => Vec::new(),
            Frame::Operate(command) => {
                command.validate()?;
                to_json(&Port {
                    port1: command.to_wire(),
                })
            }
            Frame::Identity(info) => to_json(info),
            Frame::Status(report) | Frame::OperateAck(report) => to_json(&Port {
                port1: report.to_wire(),
            }),
            Frame::Nak(code) => vec![code.as_u8()],
        };
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ValidationError::PayloadTooLarge(payload.len()));
        }
        let encrypted = !matches!(frame, Frame::Nak(_));
        Ok(self.seal(frame.kind() as u8, seq, &payload, encrypted))
    }

    fn seal(&self, kind: u8, seq: u8, payload: &[u8], encrypted: bool) -> Vec<u8> {
        let mut body = Vec::with_capacity(payload.len() + BODY_OVERHEAD);
        body.push(kind);
        body.push(seq);
        body.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        body.extend_from_slice(payload);
        let crc = compute_crc(&body);
        body.extend_from_slice(&crc.to_be_bytes());

        let mut wire = Vec::with_capacity(body.len() * 2 + 3);
        wire.push(STX);
        if encrypted {
            wire.push(CRYPT);
            wire.extend_from_slice(&self.crypt.encrypt(&body));
        } else {
            wire.extend_from_slice(&escape(&body));
        }
        wire.push(ETX);
        wire
    }

    /// Parse one complete frame (STX through ETX inclusive).
    pub fn decode(&self, wire: &[u8]) -> Result<Decoded, DecodeError> {
        if wire.len() < 2 {
            return Err(DecodeError::Truncated { len: wire.len() });
        }
        if wire[0] != STX || wire[wire.len() - 1] != ETX {
            return Err(DecodeError::MissingDelimiter);
        }
        let encrypted = wire[1] == CRYPT;
        let inner = if encrypted {
            &wire[2..wire.len() - 1]
        } else {
            &wire[1..wire.len() - 1]
        };
        let body = if encrypted {
            self.crypt.decrypt(inner)?
        } else {
            unescape(inner)?
        };

        if body.len() < BODY_OVERHEAD {
            return Err(DecodeError::Truncated { len: body.len() });
        }
        let actual_len = body.len() - BODY_OVERHEAD;
        if actual_len > MAX_PAYLOAD_LEN {
            return Err(DecodeError::Oversized { len: actual_len });
        }

        let (signed, crc_bytes) = body.split_at(body.len() - 2);
        let expected = compute_crc(signed);
        let actual = u16::from_be_bytes([crc_bytes[0], crc_bytes[1]]);
        if expected != actual {
            return Err(DecodeError::ChecksumMismatch { expected, actual });
        }

        let declared = u16::from_be_bytes([body[2], body[3]]) as usize;
        if declared != actual_len {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: actual_len,
            });
        }

        let kind = FrameKind::from_u8(body[0]).ok_or(DecodeError::UnknownFrameType(body[0]))?;
        if encrypted == (kind == FrameKind::Nak) {
            return Err(DecodeError::Payload(format!(
                "{:?} frame with unexpected encryption flag",
                kind
            )));
        }

        let seq = body[1];
        let payload = &body[4..4 + declared];
        let frame = match kind {
            FrameKind::Identify | FrameKind::StatusRequest if !payload.is_empty() => {
                return Err(DecodeError::Payload(format!(
                    "{:?} frame carries {} payload bytes",
                    kind,
                    payload.len()
                )));
            }
            FrameKind::Identify => Frame::Identify,
            FrameKind::StatusRequest => Frame::StatusRequest,
            FrameKind::Operate => {
                let wire: Port<CommandWire> = parse_json(payload)?;
                Frame::Operate(Command::from_wire(wire.port1)?)
            }
            FrameKind::Identity => Frame::Identity(parse_json(payload)?),
            FrameKind::Status => {
                let wire: Port<StatusWire> = parse_json(payload)?;
                Frame::Status(StatusReport::from_wire(wire.port1)?)
            }
            FrameKind::OperateAck => {
                let wire: Port<StatusWire> = parse_json(payload)?;
                Frame::OperateAck(StatusReport::from_wire(wire.port1)?)
            }
            FrameKind::Nak => match payload {
                [code] => Frame::Nak(NakCode::from_u8(*code)),
                _ => {
                    return Err(DecodeError::LengthMismatch {
                        declared: 1,
                        actual: payload.len(),
                    });
                }
            },
        };
        Ok(Decoded { seq, frame })
    }
}

/// Splits a TCP byte stream into complete frames.
///
/// Bytes before an STX are discarded as noise. An unescaped STX inside a
/// partial frame restarts framing at that byte.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// Fails with [`DecodeError::Oversized`] (and drops the buffer) when more
    /// than [`MAX_BUFFERED_BYTES`] accumulate without a terminator.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        'resync: loop {
            match self.buf.iter().position(|&b| b == STX) {
                Some(0) => {}
                Some(n) => {
                    self.buf.drain(..n);
                }
                None => {
                    self.buf.clear();
                    return Ok(None);
                }
            }

            let mut i = 1;
            while i < self.buf.len() {
                match self.buf[i] {
                    DLE => i += 2,
                    ETX => return Ok(Some(self.buf.drain(..=i).collect())),
                    STX => {
                        self.buf.drain(..i);
                        continue 'resync;
                    }
                    _ => i += 1,
                }
            }

            if self.buf.len() > MAX_BUFFERED_BYTES {
                let len = self.buf.len();
                self.buf.clear();
                return Err(DecodeError::Oversized { len });
            }
            return Ok(None);
        }
    }
}
