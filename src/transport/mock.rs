// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

//! Scripted in-memory units for coordinator tests.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::constants::PresetCode;
use crate::device::{DeviceInfo, DeviceKey, Endpoint};
use crate::error::{AuthReason, ConnectReason, DaikinError, DecodeError, Result, TransportReason};
use crate::protocol::{Command, StatusReport};
use crate::transport::{Connector, DeviceSession};

pub(crate) const MOCK_KEY: &str = "c2VjcmV0LWtleS0xMjM0NTY=";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    Timeout,
    Refused,
    Disconnected,
    BadKey,
    /// Reply whose checksum does not match
    Malformed,
}

impl Fault {
    fn to_error(self) -> DaikinError {
        match self {
            Fault::Timeout => DaikinError::transport(TransportReason::Timeout, "scripted timeout"),
            Fault::Refused => DaikinError::connect(ConnectReason::Refused),
            Fault::Disconnected => {
                DaikinError::transport(TransportReason::Disconnected, "scripted disconnect")
            }
            Fault::BadKey => DaikinError::Auth {
                reason: AuthReason::InvalidKey,
            },
            Fault::Malformed => DaikinError::Decode(DecodeError::ChecksumMismatch {
                expected: 0x1234,
                actual: 0x4321,
            }),
        }
    }
}

pub(crate) struct MockState {
    /// Reported MAC per reachable address
    pub units: HashMap<IpAddr, String>,
    /// Keys the units accept
    pub accepted_key: String,
    pub report: StatusReport,
    pub connect_faults: VecDeque<Fault>,
    pub poll_faults: VecDeque<Fault>,
    /// Taken by the next poll, which then waits for a notification
    pub poll_gate: Option<Arc<Notify>>,
    pub poll_waiting: bool,
    pub connects: usize,
    pub polls: usize,
    pub sends: Vec<Command>,
    pub live_sessions: usize,
    pub max_live_sessions: usize,
}

pub(crate) fn cooling_report() -> StatusReport {
    StatusReport {
        power: true,
        mode: 3,
        temperature: 24.0,
        fan: 17,
        v_swing: false,
        econo: false,
        powerchill: false,
        coanda: false,
        room_temp: Some(26.0),
        fw_ver: Some("1.0.4".to_string()),
    }
}

#[derive(Clone)]
pub(crate) struct MockConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockConnector {
    pub fn new(ip: IpAddr, mac: &str) -> Self {
        let mut units = HashMap::new();
        units.insert(ip, mac.to_string());
        Self {
            state: Arc::new(Mutex::new(MockState {
                units,
                accepted_key: MOCK_KEY.to_string(),
                report: cooling_report(),
                connect_faults: VecDeque::new(),
                poll_faults: VecDeque::new(),
                poll_gate: None,
                poll_waiting: false,
                connects: 0,
                polls: 0,
                sends: Vec::new(),
                live_sessions: 0,
                max_live_sessions: 0,
            })),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }
}

impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, endpoint: &Endpoint, key: &DeviceKey, _timeout: Duration) -> Result<MockSession> {
        let mut st = self.state.lock().unwrap();
        st.connects += 1;
        if let Some(fault) = st.connect_faults.pop_front() {
            return Err(fault.to_error());
        }
        let Some(mac) = st.units.get(&endpoint.ip).cloned() else {
            return Err(DaikinError::connect(ConnectReason::Unreachable));
        };
        if key.expose() != st.accepted_key {
            return Err(DaikinError::Auth {
                reason: AuthReason::InvalidKey,
            });
        }
        st.live_sessions += 1;
        st.max_live_sessions = st.max_live_sessions.max(st.live_sessions);
        Ok(MockSession {
            info: DeviceInfo {
                apn: "DAIKIN1A2B3C".to_string(),
                mac,
                fw_ver: st.report.fw_ver.clone(),
            },
            state: self.state.clone(),
            closed: false,
        })
    }
}

pub(crate) struct MockSession {
    info: DeviceInfo,
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

impl MockSession {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().live_sessions -= 1;
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DaikinError::transport(TransportReason::Disconnected, "session closed"));
        }
        Ok(())
    }
}

impl DeviceSession for MockSession {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn poll(&mut self) -> Result<StatusReport> {
        self.check_open()?;
        let gate = {
            let mut st = self.state.lock().unwrap();
            let gate = st.poll_gate.take();
            st.poll_waiting = gate.is_some();
            gate
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut st = self.state.lock().unwrap();
        st.poll_waiting = false;
        st.polls += 1;
        if let Some(fault) = st.poll_faults.pop_front() {
            return Err(fault.to_error());
        }
        Ok(st.report.clone())
    }

    async fn send(&mut self, command: &Command) -> Result<StatusReport> {
        self.check_open()?;
        let mut st = self.state.lock().unwrap();
        st.sends.push(command.clone());
        let report = &mut st.report;
        if let Some(power) = command.power {
            report.power = power;
        }
        if let Some(mode) = command.mode {
            report.mode = mode as u8;
        }
        if let Some(t) = command.temperature {
            report.temperature = f64::from(t);
        }
        if let Some(fan) = command.fan {
            report.fan = fan as u8;
        }
        if let Some(swing) = command.v_swing {
            report.v_swing = swing;
        }
        if let Some(preset) = command.preset {
            report.econo = preset == PresetCode::Econo;
            report.powerchill = preset == PresetCode::PowerChill;
        }
        Ok(st.report.clone())
    }

    async fn close(&mut self) {
        self.release();
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.release();
    }
}
