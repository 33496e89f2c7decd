// MIT License - Copyright (c) 2021 TJForc
// Daikin BR LAN client

use std::sync::Arc;

use crate::coordinator::{CoordinatorState, DeviceSnapshot};
use crate::device::Endpoint;

/// All events emitted by a coordinator.
///
/// Users subscribe via `coordinator.subscribe()` to receive a
/// `tokio::sync::broadcast::Receiver<CoordinatorEvent>`.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Session established and identity verified
    Connected { endpoint: Endpoint },
    /// Session closed after a failure
    Disconnected { reason: String },
    /// A new snapshot was committed
    StateUpdated(Arc<DeviceSnapshot>),
    /// Availability flipped; sent once per transition
    AvailabilityChanged { available: bool },
    /// The unit answered on a different address, which is now in use
    EndpointUpdated { old: Endpoint, new: Endpoint },
    StateChanged {
        old: CoordinatorState,
        new: CoordinatorState,
    },
    /// The unit rejected the device key; polling is suspended
    AuthFailed,
    /// A different unit answered under the configured hostname
    UniqueIdMismatch { expected: String, actual: String },
    Stopped,
}

/// Type alias for the broadcast sender.
pub type EventSender = tokio::sync::broadcast::Sender<CoordinatorEvent>;

/// Type alias for the broadcast receiver.
pub type EventReceiver = tokio::sync::broadcast::Receiver<CoordinatorEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(capacity)
}
