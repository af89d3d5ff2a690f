//! Peripheral discovery and GATT-style transport boundary.
//!
//! The platform BLE stack sits behind two traits: [`Central`] for scanning
//! and connecting, [`GattConnection`] for one established connection.
//! Callback-style platform events (notifications, write completions,
//! disconnections) are delivered on a per-connection channel so the owner
//! can process them on a single task.
//!
//! Implementations:
//! - [`sim::SimCentral`] — in-process simulated arms for tests and demos

pub mod sim;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use lenslink_core::{PeripheralInfo, TransportError};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// MTU every BLE connection starts with before negotiation.
pub const DEFAULT_MTU: u16 = 23;

// MARK: - Scanning

/// One received advertisement.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peripheral: PeripheralInfo,
    /// Service identifiers listed in the advertisement.
    pub services: Vec<Uuid>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    Advertisement(Advertisement),
    /// The platform aborted the scan; it has to be restarted explicitly.
    Failed { reason: String },
}

// MARK: - Connection events

/// A GATT service and the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    pub fn has_characteristic(&self, uuid: &Uuid) -> bool {
        self.characteristics.contains(uuid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Data pushed by the peripheral on a subscribed characteristic.
    Notification { characteristic: Uuid, data: Bytes },
    /// Link-layer confirmation of the most recent write.
    WriteCompleted { success: bool },
    Disconnected { reason: Option<String> },
}

/// A live connection plus the receiving end of its event channel.
pub struct ConnectedPeripheral {
    pub connection: Arc<dyn GattConnection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

// MARK: - Central trait

/// Scanner / connector role of the host.
#[async_trait]
pub trait Central: Send + Sync {
    /// Start a scan restricted to peripherals advertising `service`.
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Subscribe to scan results. Subscribe before calling `start_scan`.
    fn scan_events(&self) -> broadcast::Receiver<ScanEvent>;

    async fn connect(&self, peripheral: &PeripheralInfo) -> Result<ConnectedPeripheral, TransportError>;
}

// MARK: - GattConnection trait

/// One established connection to a peripheral.
///
/// `write` returns once the request is handed to the stack; completion and
/// acknowledgment arrive later as [`ConnectionEvent`]s.
#[async_trait]
pub trait GattConnection: Send + Sync {
    fn peripheral(&self) -> &PeripheralInfo;

    /// Negotiate the maximum transmission size. Returns the granted value.
    async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError>;

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError>;

    /// Enable notifications on `characteristic`.
    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError>;

    async fn write(&self, characteristic: Uuid, data: Bytes) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
