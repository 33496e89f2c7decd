// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tracing::{debug, error, info, warn};

use crate::climate::{ClimateState, Intent, to_command, to_presented_state};
use crate::config::CoordinatorOptions;
use crate::constants::DEVICE_PORT;
use crate::device::{DeviceIdentity, DeviceKey, Endpoint};
use crate::error::{AuthReason, DaikinError, Result, TransportReason};
use crate::event::{CoordinatorEvent, EventReceiver, EventSender, event_channel};
use crate::protocol::StatusReport;
use crate::transport::discovery::Resolver;
use crate::transport::{Connector, DeviceSession};

/// Lifecycle of a coordinator.
///
/// ```text
/// Idle → Connecting → Polling ⇄ Degraded → Unavailable → Connecting …
///                  ↘ AuthRejected | IdentityMismatch   (until reconfigured)
/// any → ShuttingDown → Stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Connecting,
    Polling,
    Degraded,
    Unavailable,
    AuthRejected,
    IdentityMismatch,
    ShuttingDown,
    Stopped,
}

impl CoordinatorState {
    /// States that only `reconfigure` leaves.
    pub fn needs_reconfigure(&self) -> bool {
        matches!(self, Self::AuthRejected | Self::IdentityMismatch)
    }

    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Polling => "polling",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
            Self::AuthRejected => "auth_rejected",
            Self::IdentityMismatch => "identity_mismatch",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last good state of the unit. Replaced as a whole, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    #[serde(skip)]
    pub report: StatusReport,
    pub climate: ClimateState,
    pub updated_at: DateTime<Utc>,
}

/// Poll-cycle bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStatus {
    pub state: CoordinatorState,
    pub available: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Unique id reported by the wrong unit after an identity mismatch
    pub mismatched_id: Option<String>,
}

impl Default for CoordinatorStatus {
    fn default() -> Self {
        Self {
            state: CoordinatorState::Idle,
            available: false,
            consecutive_failures: 0,
            last_error: None,
            mismatched_id: None,
        }
    }
}

struct Shared<C: Connector, R: Resolver> {
    identity: RwLock<DeviceIdentity>,
    key: RwLock<DeviceKey>,
    connector: C,
    resolver: R,
    options: CoordinatorOptions,
    /// The single serialisation point for polls and commands
    session: Mutex<Option<C::Session>>,
    snapshot: watch::Sender<Option<Arc<DeviceSnapshot>>>,
    status: watch::Sender<CoordinatorStatus>,
    event_tx: EventSender,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the session, the polling schedule and the cached state of one unit.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use daikin_br::{Coordinator, CoordinatorOptions, DeviceKey, HvacMode, Intent};
/// use daikin_br::transport::direct::TcpConnector;
/// use daikin_br::transport::discovery::MdnsResolver;
///
/// # async fn run(identity: daikin_br::DeviceIdentity) -> anyhow::Result<()> {
/// let key = DeviceKey::parse("c2VjcmV0LWtleS0xMjM0NTY=")?;
/// let coordinator = Arc::new(Coordinator::new(
///     identity,
///     key,
///     TcpConnector::default(),
///     MdnsResolver::default(),
///     CoordinatorOptions::default(),
/// ));
/// coordinator.start().await?;
/// coordinator.apply(&Intent::hvac_mode(HvacMode::Cool)).await?;
/// coordinator.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Coordinator<C: Connector, R: Resolver> {
    shared: Arc<Shared<C, R>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Connector, R: Resolver> Coordinator<C, R> {
    pub fn new(
        identity: DeviceIdentity,
        key: DeviceKey,
        connector: C,
        resolver: R,
        options: CoordinatorOptions,
    ) -> Self {
        let (event_tx, _) = event_channel(options.event_capacity);
        let (snapshot, _) = watch::channel(None);
        let (status, _) = watch::channel(CoordinatorStatus::default());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                identity: RwLock::new(identity),
                key: RwLock::new(key),
                connector,
                resolver,
                options,
                session: Mutex::new(None),
                snapshot,
                status,
                event_tx,
                shutdown_tx,
            }),
            scheduler: Mutex::new(None),
        }
    }

    /// Start the polling schedule. The first poll runs immediately.
    pub async fn start(&self) -> Result<()> {
        if self.state().is_stopping() {
            return Err(DaikinError::Stopped);
        }
        let mut scheduler = self.scheduler.lock().await;
        if scheduler.is_some() {
            return Ok(());
        }

        let shared = self.shared.clone();
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        let poll_interval = shared.options.poll_interval;
        info!(
            "Starting coordinator for {} (poll every {:?})",
            shared.identity.read().await.hostname,
            poll_interval
        );

        *scheduler = Some(tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        let state = shared.status.borrow().state;
                        if state.needs_reconfigure() || state.is_stopping() {
                            continue;
                        }
                        tokio::select! {
                            _ = shutdown_rx.changed() => break,
                            _ = shared.scheduled_poll() => {}
                        }
                    }
                }
            }
            debug!("Poll scheduler stopped");
        }));
        Ok(())
    }

    /// Poll now, waiting for an in-flight command if there is one.
    pub async fn refresh(&self) -> Result<Arc<DeviceSnapshot>> {
        let state = self.state();
        if state.is_stopping() {
            return Err(DaikinError::Stopped);
        }
        self.shared.refuse_if_rejected().await?;
        let mut slot = self.shared.lock_session().await?;
        self.shared.poll_locked(&mut slot).await
    }

    /// Validate `intent`, send it, and publish the acknowledged state.
    ///
    /// Nothing is sent when validation fails. After the unit acknowledges,
    /// an extra poll runs right away instead of waiting for the next tick.
    pub async fn apply(&self, intent: &Intent) -> Result<Arc<DeviceSnapshot>> {
        let current = self.snapshot().map(|s| s.climate.clone());
        let command = to_command(intent, current.as_ref())?;

        if self.state().is_stopping() {
            return Err(DaikinError::Stopped);
        }
        self.shared.refuse_if_rejected().await?;

        let shared = &self.shared;
        let mut slot = shared.lock_session().await?;
        debug!("Applying {:?}", command);
        let sent: Result<StatusReport> = async {
            let session = shared.ensure_session(&mut slot).await?;
            session.send(&command).await
        }
        .await;

        let echoed = match sent {
            Ok(report) => shared.commit(report),
            Err(e) => {
                shared.record_failure(&mut slot, &e).await;
                return Err(e);
            }
        };
        if shared.is_stopping() {
            return Ok(echoed);
        }

        match shared.poll_locked(&mut slot).await {
            Ok(polled) => Ok(polled),
            Err(e) => {
                debug!("Follow-up poll failed: {}", e);
                Ok(echoed)
            }
        }
    }

    /// Install a new key and/or address, clear a rejected state and poll.
    pub async fn reconfigure(
        &self,
        key: Option<DeviceKey>,
        ip: Option<IpAddr>,
    ) -> Result<Arc<DeviceSnapshot>> {
        if self.state().is_stopping() {
            return Err(DaikinError::Stopped);
        }
        let shared = &self.shared;
        let mut slot = shared.lock_session().await?;
        if let Some(mut session) = slot.take() {
            session.close().await;
        }
        if let Some(key) = key {
            *shared.key.write().await = key;
        }
        if let Some(ip) = ip {
            let mut identity = shared.identity.write().await;
            let port = identity.endpoint.map_or(DEVICE_PORT, |e| e.port);
            identity.endpoint = Some(Endpoint::with_port(ip, port));
        }
        info!("Coordinator reconfigured");
        shared.update_status(|s| {
            s.state = CoordinatorState::Idle;
            s.consecutive_failures = 0;
            s.last_error = None;
            s.mismatched_id = None;
        });
        shared.poll_locked(&mut slot).await
    }

    /// Stop polling, close the session and release every task.
    pub async fn shutdown(&self) {
        if self.state() == CoordinatorState::Stopped {
            return;
        }
        let shared = &self.shared;
        shared.update_status(|s| s.state = CoordinatorState::ShuttingDown);
        shared.shutdown_tx.send_replace(true);

        if let Some(handle) = self.scheduler.lock().await.take() {
            handle.abort();
            if let Err(e) = handle.await
                && !e.is_cancelled()
            {
                warn!("Poll scheduler ended abnormally: {}", e);
            }
        }
        if let Some(mut session) = shared.session.lock().await.take() {
            session.close().await;
        }

        shared.update_status(|s| {
            s.state = CoordinatorState::Stopped;
            s.available = false;
        });
        let _ = shared.event_tx.send(CoordinatorEvent::Stopped);
        info!("Coordinator stopped");
    }

    pub fn state(&self) -> CoordinatorState {
        self.shared.status.borrow().state
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.shared.status.borrow().clone()
    }

    pub fn is_available(&self) -> bool {
        self.shared.status.borrow().available
    }

    pub fn snapshot(&self) -> Option<Arc<DeviceSnapshot>> {
        self.shared.snapshot.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Option<Arc<DeviceSnapshot>>> {
        self.shared.snapshot.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.shared.status.subscribe()
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.event_tx.subscribe()
    }

    pub async fn identity(&self) -> DeviceIdentity {
        self.shared.identity.read().await.clone()
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.shared.options
    }
}

impl<C: Connector, R: Resolver> Shared<C, R> {
    fn is_stopping(&self) -> bool {
        self.status.borrow().state.is_stopping()
    }

    /// Wait for the session lock, bounded by one connect plus one request.
    /// Gives up with `Stopped` as soon as shutdown begins.
    async fn lock_session(&self) -> Result<MutexGuard<'_, Option<C::Session>>> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Err(DaikinError::Stopped);
        }
        let guard = tokio::select! {
            _ = shutdown_rx.changed() => return Err(DaikinError::Stopped),
            locked = timeout(self.options.command_wait(), self.session.lock()) => {
                locked.map_err(|_| {
                    DaikinError::transport(TransportReason::Timeout, "waiting for in-flight request")
                })?
            }
        };
        if self.is_stopping() {
            return Err(DaikinError::Stopped);
        }
        Ok(guard)
    }

    async fn scheduled_poll(&self) {
        let Ok(mut slot) = self.session.try_lock() else {
            debug!("Skipping scheduled poll: request in flight");
            return;
        };
        if let Err(e) = self.poll_locked(&mut slot).await {
            debug!("Scheduled poll failed: {}", e);
        }
    }

    async fn refuse_if_rejected(&self) -> Result<()> {
        let status = self.status.borrow().clone();
        match status.state {
            CoordinatorState::AuthRejected => Err(DaikinError::Auth {
                reason: AuthReason::InvalidKey,
            }),
            CoordinatorState::IdentityMismatch => Err(DaikinError::UniqueIdMismatch {
                expected: self.identity.read().await.unique_id.clone(),
                actual: status.mismatched_id.unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    async fn poll_locked(&self, slot: &mut Option<C::Session>) -> Result<Arc<DeviceSnapshot>> {
        let polled: Result<StatusReport> = async {
            let session = self.ensure_session(slot).await?;
            session.poll().await
        }
        .await;
        match polled {
            Ok(report) => Ok(self.commit(report)),
            Err(e) => {
                self.record_failure(slot, &e).await;
                Err(e)
            }
        }
    }

    async fn ensure_session<'a>(
        &self,
        slot: &'a mut Option<C::Session>,
    ) -> Result<&'a mut C::Session> {
        if slot.is_none() {
            if self.is_stopping() {
                return Err(DaikinError::Stopped);
            }
            *slot = Some(self.open_session().await?);
        }
        slot.as_mut().ok_or(DaikinError::Stopped)
    }

    /// Connect, re-resolving the hostname if the last address fails, and
    /// check the unit's identity. A new address is adopted only after the
    /// identity check passes.
    async fn open_session(&self) -> Result<C::Session> {
        self.update_status(|s| s.state = CoordinatorState::Connecting);

        let key = self.key.read().await.clone();
        let (hostname, expected, current) = {
            let identity = self.identity.read().await;
            (
                identity.hostname.clone(),
                identity.unique_id.clone(),
                identity.endpoint,
            )
        };
        let connect_timeout = self.options.connect_timeout;

        let first = match current {
            Some(endpoint) => self
                .connector
                .connect(&endpoint, &key, connect_timeout)
                .await
                .map(|session| (endpoint, session)),
            None => Err(DaikinError::NotFound {
                hostname: hostname.clone(),
            }),
        };

        let (endpoint, mut session) = match first {
            Ok(pair) => pair,
            Err(e @ (DaikinError::Connect { .. } | DaikinError::NotFound { .. })) => {
                let ip = match self
                    .resolver
                    .resolve(&hostname, self.options.discovery_timeout)
                    .await
                {
                    Ok(ip) => ip,
                    Err(resolve_err) => {
                        debug!("Discovery for {} failed: {}", hostname, resolve_err);
                        return Err(e);
                    }
                };
                let port = current.map_or(DEVICE_PORT, |c| c.port);
                let candidate = Endpoint::with_port(ip, port);
                if Some(candidate) == current {
                    return Err(e);
                }
                info!("{} answers discovery at {}, trying it", hostname, candidate);
                let session = self.connector.connect(&candidate, &key, connect_timeout).await?;
                (candidate, session)
            }
            Err(e) => return Err(e),
        };

        let actual = session.info().unique_id();
        if actual != expected {
            error!(
                "Unit at {} reports unique id {} but {} was set up; refusing it",
                endpoint, actual, expected
            );
            session.close().await;
            return Err(DaikinError::UniqueIdMismatch { expected, actual });
        }

        {
            let mut identity = self.identity.write().await;
            if let Some(fw) = &session.info().fw_ver {
                identity.firmware = Some(fw.clone());
            }
            if identity.endpoint != Some(endpoint) {
                let old = identity.endpoint.replace(endpoint);
                if let Some(old) = old {
                    info!("Endpoint for {} changed: {} -> {}", hostname, old, endpoint);
                    let _ = self.event_tx.send(CoordinatorEvent::EndpointUpdated {
                        old,
                        new: endpoint,
                    });
                }
            }
        }

        if self.is_stopping() {
            session.close().await;
            return Err(DaikinError::Stopped);
        }
        let _ = self.event_tx.send(CoordinatorEvent::Connected { endpoint });
        Ok(session)
    }

    /// Publish a new snapshot and reset the failure count.
    fn commit(&self, report: StatusReport) -> Arc<DeviceSnapshot> {
        let snapshot = Arc::new(DeviceSnapshot {
            climate: to_presented_state(&report),
            report,
            updated_at: Utc::now(),
        });
        self.snapshot.send_replace(Some(snapshot.clone()));
        self.update_status(|s| {
            s.state = CoordinatorState::Polling;
            s.available = true;
            s.consecutive_failures = 0;
            s.last_error = None;
        });
        let _ = self
            .event_tx
            .send(CoordinatorEvent::StateUpdated(snapshot.clone()));
        snapshot
    }

    /// Drop the session and classify the failure.
    async fn record_failure(&self, slot: &mut Option<C::Session>, err: &DaikinError) {
        if let Some(mut session) = slot.take() {
            session.close().await;
            let _ = self.event_tx.send(CoordinatorEvent::Disconnected {
                reason: err.to_string(),
            });
        }

        match err {
            DaikinError::Stopped => {}
            DaikinError::Auth { .. } => {
                error!("Device key rejected; polling suspended until reconfigured");
                self.update_status(|s| {
                    s.state = CoordinatorState::AuthRejected;
                    s.available = false;
                    s.last_error = Some(err.to_string());
                });
                let _ = self.event_tx.send(CoordinatorEvent::AuthFailed);
            }
            DaikinError::UniqueIdMismatch { expected, actual } => {
                self.update_status(|s| {
                    s.state = CoordinatorState::IdentityMismatch;
                    s.available = false;
                    s.last_error = Some(err.to_string());
                    s.mismatched_id = Some(actual.clone());
                });
                let _ = self.event_tx.send(CoordinatorEvent::UniqueIdMismatch {
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
            e if e.is_transient() => {
                let threshold = self.options.escalation_threshold;
                self.update_status(|s| {
                    s.consecutive_failures += 1;
                    s.last_error = Some(e.to_string());
                    if s.consecutive_failures >= threshold {
                        s.state = CoordinatorState::Unavailable;
                        s.available = false;
                    } else {
                        s.state = CoordinatorState::Degraded;
                    }
                });
                let failures = self.status.borrow().consecutive_failures;
                warn!("Poll failed ({}/{}): {}", failures, threshold, e);
            }
            e => {
                warn!("Request failed: {}", e);
                self.update_status(|s| s.last_error = Some(e.to_string()));
            }
        }
    }

    /// Mutate the status and announce state and availability transitions.
    ///
    /// Once shutdown has begun the only transition allowed is to `Stopped`.
    fn update_status(&self, f: impl FnOnce(&mut CoordinatorStatus)) {
        let mut change = None;
        self.status.send_modify(|s| {
            let before = (s.state, s.available);
            f(s);
            if before.0.is_stopping() && s.state != CoordinatorState::Stopped {
                s.state = before.0;
                s.available = before.1;
            }
            change = Some((before, (s.state, s.available)));
        });
        let Some(((old_state, was_available), (new_state, available))) = change else {
            return;
        };
        if old_state != new_state {
            debug!("Coordinator state {} -> {}", old_state, new_state);
            let _ = self.event_tx.send(CoordinatorEvent::StateChanged {
                old: old_state,
                new: new_state,
            });
        }
        if was_available != available {
            if available {
                info!("Device available");
            } else {
                warn!("Device unavailable");
            }
            let _ = self
                .event_tx
                .send(CoordinatorEvent::AvailabilityChanged { available });
        }
    }
}

impl<C: Connector, R: Resolver> Drop for Coordinator<C, R> {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.get_mut().take() {
            handle.abort();
        }
    }
}
