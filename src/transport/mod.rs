// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

pub mod command;
pub mod direct;
pub mod discovery;
#[cfg(test)]
pub(crate) mod mock;

use std::future::Future;
use std::time::Duration;

use crate::device::{DeviceInfo, DeviceKey, Endpoint};
use crate::error::Result;
use crate::protocol::{Command, StatusReport};

/// An authenticated session with one unit.
///
/// Methods take `&mut self`, so a session never has more than one request
/// in flight.
pub trait DeviceSession: Send + Sync + 'static {
    /// Identity the unit reported during the handshake.
    fn info(&self) -> &DeviceInfo;

    /// Request the current state.
    fn poll(&mut self) -> impl Future<Output = Result<StatusReport>> + Send;

    /// Apply a command; resolves to the state echoed in the acknowledgement.
    fn send(&mut self, command: &Command) -> impl Future<Output = Result<StatusReport>> + Send;

    /// Close the connection. Calling it again is a no-op, and later requests
    /// fail as disconnected.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens sessions. Implemented by [`direct::TcpConnector`] for real units.
pub trait Connector: Send + Sync + 'static {
    type Session: DeviceSession;

    fn connect(
        &self,
        endpoint: &Endpoint,
        key: &DeviceKey,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Session>> + Send;
}
