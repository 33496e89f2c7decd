// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

//! Full-stack scenarios against an in-process unit speaking the wire
//! protocol over real TCP.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use daikin_br::constants::NakCode;
use daikin_br::protocol::{Command, Frame, FrameBuffer, FrameCodec, StatusReport};
use daikin_br::setup::SetupFlow;
use daikin_br::transport::direct::TcpConnector;
use daikin_br::transport::discovery::NoDiscovery;
use daikin_br::{
    Coordinator, CoordinatorEvent, CoordinatorOptions, CoordinatorState, DeviceInfo, DeviceKey,
    HvacMode, Intent,
};

const KEY: &str = "c2VjcmV0LWtleS0xMjM0NTY=";
const OTHER_KEY: &str = "b3RoZXIta2V5LTEyMzQ1Njc4";

/// A simulated unit. Holds its settings across connections.
struct FakeUnit {
    key: DeviceKey,
    report: Mutex<StatusReport>,
    /// When set, requests are read and dropped without a reply
    silent: AtomicBool,
    connections: AtomicUsize,
}

impl FakeUnit {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            key: DeviceKey::parse(KEY).unwrap(),
            report: Mutex::new(StatusReport {
                power: true,
                mode: 3,
                temperature: 24.0,
                fan: 17,
                v_swing: false,
                econo: false,
                powerchill: false,
                coanda: false,
                room_temp: Some(27.5),
                fw_ver: Some("2.1.0".to_string()),
            }),
            silent: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
        })
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            apn: "DAIKIN1A2B3C".to_string(),
            mac: "AA:BB:CC:1A:2B:3C".to_string(),
            fw_ver: Some("2.1.0".to_string()),
        }
    }

    fn operate(&self, command: &Command) -> StatusReport {
        let mut report = self.report.lock().unwrap();
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
        report.clone()
    }

    fn reply(&self, frame: Frame) -> Frame {
        match frame {
            Frame::Identify => Frame::Identity(self.info()),
            Frame::StatusRequest => Frame::Status(self.report.lock().unwrap().clone()),
            Frame::Operate(command) => Frame::OperateAck(self.operate(&command)),
            _ => Frame::Nak(NakCode::BadRequest),
        }
    }

    /// Listen on an ephemeral localhost port.
    async fn listen(self: &Arc<Self>) -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let unit = self.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                unit.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(unit.clone().serve(socket));
            }
        });
        addr
    }

    async fn serve(self: Arc<Self>, mut socket: TcpStream) {
        let codec = FrameCodec::new(&self.key);
        let mut buffer = FrameBuffer::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buffer.extend(&chunk[..n]);
            while let Ok(Some(raw)) = buffer.next_frame() {
                if self.silent.load(Ordering::SeqCst) {
                    continue;
                }
                let (seq, reply) = match codec.decode(&raw) {
                    Ok(decoded) => (decoded.seq, self.reply(decoded.frame)),
                    // the first request of a session carries sequence 1
                    Err(_) => (1, Frame::Nak(NakCode::BadKey)),
                };
                let Ok(wire) = codec.encode(&reply, seq) else {
                    return;
                };
                if socket.write_all(&wire).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn fast_options() -> CoordinatorOptions {
    CoordinatorOptions::builder()
        .connect_timeout(Duration::from_millis(300))
        .request_timeout(Duration::from_millis(300))
        .discovery_timeout(Duration::from_millis(50))
        .build()
}

#[tokio::test]
async fn setup_then_cool_then_heat() {
    let unit = FakeUnit::new();
    let addr = unit.listen().await;

    let identity = SetupFlow::new(TcpConnector::default(), NoDiscovery)
        .validate_and_connect(&addr.to_string(), KEY)
        .await
        .unwrap();
    assert_eq!(identity.unique_id, "aabbcc1a2b3c");
    assert_eq!(identity.hostname, "DAIKIN1A2B3C");
    assert_eq!(identity.firmware.as_deref(), Some("2.1.0"));

    let options = fast_options();
    let coordinator = Coordinator::new(
        identity,
        DeviceKey::parse(KEY).unwrap(),
        TcpConnector::new(options.request_timeout),
        NoDiscovery,
        options,
    );

    let first = coordinator.refresh().await.unwrap();
    assert_eq!(first.climate.hvac_mode, HvacMode::Cool);
    assert_eq!(first.climate.target_temperature, 24.0);
    assert_eq!(first.climate.current_temperature, Some(27.5));
    assert!(coordinator.is_available());

    let heated = coordinator
        .apply(&Intent::hvac_mode(HvacMode::Heat))
        .await
        .unwrap();
    assert_eq!(heated.climate.hvac_mode, HvacMode::Heat);
    assert_eq!(heated.climate.target_temperature, 24.0);
    assert_eq!(unit.report.lock().unwrap().mode, 4);
    assert_eq!(
        coordinator.snapshot().unwrap().climate.hvac_mode,
        HvacMode::Heat
    );

    coordinator.shutdown().await;
    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
}

#[tokio::test]
async fn setup_with_wrong_key_is_invalid_auth() {
    let unit = FakeUnit::new();
    let addr = unit.listen().await;

    let err = SetupFlow::new(TcpConnector::default(), NoDiscovery)
        .validate_and_connect(&addr.to_string(), OTHER_KEY)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_auth");
}

#[tokio::test]
async fn three_timeouts_then_recovery() {
    let unit = FakeUnit::new();
    let addr = unit.listen().await;

    let identity = SetupFlow::new(TcpConnector::default(), NoDiscovery)
        .validate_and_connect(&addr.to_string(), KEY)
        .await
        .unwrap();
    let options = fast_options();
    let coordinator = Coordinator::new(
        identity,
        DeviceKey::parse(KEY).unwrap(),
        TcpConnector::new(options.request_timeout),
        NoDiscovery,
        options,
    );
    let mut events = coordinator.subscribe();

    coordinator.refresh().await.unwrap();
    assert!(coordinator.is_available());

    unit.silent.store(true, Ordering::SeqCst);
    for attempt in 1..=3 {
        assert!(coordinator.refresh().await.is_err(), "attempt {attempt}");
        assert_eq!(coordinator.status().consecutive_failures, attempt);
        assert_eq!(coordinator.is_available(), attempt < 3);
    }
    assert_eq!(coordinator.state(), CoordinatorState::Unavailable);

    unit.silent.store(false, Ordering::SeqCst);
    let recovered = coordinator.refresh().await.unwrap();
    assert_eq!(recovered.climate.hvac_mode, HvacMode::Cool);
    assert!(coordinator.is_available());
    assert_eq!(coordinator.status().consecutive_failures, 0);

    let mut flips = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let CoordinatorEvent::AvailabilityChanged { available } = event {
            flips.push(available);
        }
    }
    assert_eq!(flips, vec![false, true]);

    coordinator.shutdown().await;
}
