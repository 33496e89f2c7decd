// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::io::ErrorKind;

use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_REQUEST_TIMEOUT, NakCode};
use crate::device::{DeviceInfo, DeviceKey, Endpoint};
use crate::error::{AuthReason, ConnectReason, DaikinError, DecodeError, Result, TransportReason};
use crate::protocol::{Command, Frame, FrameCodec, StatusReport};
use crate::transport::command::RequestEngine;
use crate::transport::{Connector, DeviceSession};

/// Opens [`TcpSession`]s to units on the LAN.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    request_timeout: Duration,
}

impl TcpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    type Session = TcpSession;

    async fn connect(&self, endpoint: &Endpoint, key: &DeviceKey, timeout: Duration) -> Result<TcpSession> {
        TcpSession::connect(endpoint, key, timeout, self.request_timeout).await
    }
}

/// Direct TCP session with one unit.
pub struct TcpSession {
    engine: RequestEngine,
    info: DeviceInfo,
    endpoint: Endpoint,
}

impl TcpSession {
    /// Connect and authenticate.
    ///
    /// Sequence: TCP connect → `Identify` → `Identity`. The reply only decodes
    /// with a valid checksum when both sides hold the same key, so a checksum
    /// failure or a `Nak(bad key)` means the key was rejected.
    pub async fn connect(
        endpoint: &Endpoint,
        key: &DeviceKey,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        info!("Connecting to device at {}", endpoint);

        let stream = match timeout(connect_timeout, TcpStream::connect(endpoint.socket_addr())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!("TCP connect to {} failed: {}", endpoint, e);
                let reason = match e.kind() {
                    ErrorKind::ConnectionRefused => ConnectReason::Refused,
                    ErrorKind::TimedOut => ConnectReason::Timeout,
                    _ => ConnectReason::Unreachable,
                };
                return Err(DaikinError::connect(reason));
            }
            Err(_) => {
                warn!("TCP connect to {} timed out", endpoint);
                return Err(DaikinError::connect(ConnectReason::Timeout));
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        debug!("TCP socket connected");

        let mut engine = RequestEngine::new(stream, FrameCodec::new(key), connect_timeout);
        let info = match engine.request(&Frame::Identify).await {
            Ok(Frame::Identity(info)) => info,
            Ok(Frame::Nak(NakCode::BadKey))
            | Err(DaikinError::Decode(DecodeError::ChecksumMismatch { .. })) => {
                warn!("Device at {} rejected the key", endpoint);
                engine.shutdown().await;
                return Err(DaikinError::Auth {
                    reason: AuthReason::InvalidKey,
                });
            }
            Ok(Frame::Nak(NakCode::Busy)) => {
                engine.shutdown().await;
                return Err(DaikinError::connect(ConnectReason::Refused));
            }
            Ok(other) => {
                engine.shutdown().await;
                return Err(DaikinError::transport(
                    TransportReason::ProtocolViolation,
                    format!("unexpected {:?} reply to Identify", other.kind()),
                ));
            }
            Err(DaikinError::Transport {
                reason: TransportReason::Timeout,
                ..
            }) => {
                engine.shutdown().await;
                return Err(DaikinError::connect(ConnectReason::Timeout));
            }
            Err(DaikinError::Transport {
                reason: TransportReason::Disconnected,
                ..
            }) => {
                engine.shutdown().await;
                return Err(DaikinError::connect(ConnectReason::Unreachable));
            }
            Err(e) => {
                engine.shutdown().await;
                return Err(e);
            }
        };
        engine.set_timeout(request_timeout);

        info!(
            "Session established with {} ({}, firmware {})",
            info.apn,
            endpoint,
            info.fw_ver.as_deref().unwrap_or("unknown")
        );
        Ok(Self {
            engine,
            info,
            endpoint: *endpoint,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn exchange(&mut self, frame: &Frame) -> Result<StatusReport> {
        match self.engine.request(frame).await? {
            Frame::Status(report) if matches!(frame, Frame::StatusRequest) => Ok(report),
            Frame::OperateAck(report) if matches!(frame, Frame::Operate(_)) => Ok(report),
            Frame::Nak(NakCode::BadKey) => Err(DaikinError::Auth {
                reason: AuthReason::InvalidKey,
            }),
            Frame::Nak(code) => Err(DaikinError::transport(
                TransportReason::ProtocolViolation,
                format!("device replied Nak: {}", code.description()),
            )),
            other => Err(DaikinError::transport(
                TransportReason::ProtocolViolation,
                format!("unexpected {:?} reply to {:?}", other.kind(), frame.kind()),
            )),
        }
    }
}

impl DeviceSession for TcpSession {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    async fn poll(&mut self) -> Result<StatusReport> {
        self.exchange(&Frame::StatusRequest).await
    }

    async fn send(&mut self, command: &Command) -> Result<StatusReport> {
        debug!("Sending command to {}: {:?}", self.endpoint, command);
        self.exchange(&Frame::Operate(command.clone())).await
    }

    async fn close(&mut self) {
        if !self.engine.is_closed() {
            debug!("Closing session with {}", self.endpoint);
        }
        self.engine.shutdown().await;
    }
}
