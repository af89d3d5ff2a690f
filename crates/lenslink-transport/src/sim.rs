//! In-process simulated central and arms.
//!
//! A [`SimCentral`] plays the host's BLE stack; every [`SimArm`] added to it
//! behaves like one lens arm: it advertises the display service, records the
//! packets written to it and answers each write according to its
//! [`AckBehavior`]. Used for tests and for the demo binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use lenslink_core::codec::{ACK_FAILURE, ACK_SUCCESS};
use lenslink_core::{PeripheralId, PeripheralInfo, TransportError, NOTIFY_CHAR_UUID, SERVICE_UUID, WRITE_CHAR_UUID};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::{
    Advertisement, Central, ConnectedPeripheral, ConnectionEvent, GattConnection, GattService, ScanEvent, DEFAULT_MTU,
};

/// How a simulated arm answers writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBehavior {
    /// Notify the success byte after each write.
    AckByte,
    /// Notify the failure byte after each write.
    NakByte,
    /// Report link-layer write completion only.
    WriteCompletion,
    /// Report a failed link-layer write completion.
    CompletionFailure,
    /// Accept the write and never answer.
    Silent,
    /// Reject the write at the transport level.
    FailWrites,
}

// MARK: - SimCentral

struct SimAir {
    scan_tx: broadcast::Sender<ScanEvent>,
    arms: Mutex<HashMap<PeripheralId, SimArm>>,
    scan_filter: Mutex<Option<Uuid>>,
    next_id: AtomicU64,
}

/// Simulated host-side BLE stack.
#[derive(Clone)]
pub struct SimCentral {
    air: Arc<SimAir>,
}

impl SimCentral {
    pub fn new() -> Self {
        let (scan_tx, _) = broadcast::channel(256);
        Self {
            air: Arc::new(SimAir {
                scan_tx,
                arms: Mutex::new(HashMap::new()),
                scan_filter: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Adds an arm advertising the display service under `name`.
    pub fn add_arm(&self, name: &str) -> SimArm {
        let n = self.air.next_id.fetch_add(1, Ordering::Relaxed);
        let arm = SimArm::new(PeripheralInfo::new(format!("sim-{n:04}"), name));
        lock(&self.air.arms).insert(arm.info().id.clone(), arm.clone());
        arm
    }

    /// Emits one advertisement for `arm` if a matching scan is running.
    /// Returns whether it was emitted.
    pub fn advertise(&self, arm: &SimArm) -> bool {
        let adv = Advertisement {
            peripheral: arm.info(),
            services: arm.advertised_services(),
            rssi: Some(-55),
        };
        self.advertise_raw(adv)
    }

    pub fn advertise_raw(&self, adv: Advertisement) -> bool {
        let Some(filter) = *lock(&self.air.scan_filter) else {
            return false;
        };
        if !adv.services.contains(&filter) {
            return false;
        }
        self.air.scan_tx.send(ScanEvent::Advertisement(adv)).is_ok()
    }

    /// Simulates the platform aborting the scan.
    pub fn fail_scan(&self, reason: &str) {
        *lock(&self.air.scan_filter) = None;
        let _ = self.air.scan_tx.send(ScanEvent::Failed {
            reason: reason.to_owned(),
        });
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.air.scan_filter).is_some()
    }
}

impl Default for SimCentral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Central for SimCentral {
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError> {
        *lock(&self.air.scan_filter) = Some(service);
        debug!("[Sim] scan started (service={})", service);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        *lock(&self.air.scan_filter) = None;
        debug!("[Sim] scan stopped");
        Ok(())
    }

    fn scan_events(&self) -> broadcast::Receiver<ScanEvent> {
        self.air.scan_tx.subscribe()
    }

    async fn connect(&self, peripheral: &PeripheralInfo) -> Result<ConnectedPeripheral, TransportError> {
        let arm = lock(&self.air.arms)
            .get(&peripheral.id)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed {
                reason: format!("no peripheral {}", peripheral.id),
            })?;
        arm.accept()
    }
}

// MARK: - SimArm

struct ArmState {
    behavior: AckBehavior,
    services: Vec<GattService>,
    deny_permission: bool,
    max_mtu: u16,
    /// Delivered packets with their arrival time.
    writes: Vec<(Instant, Bytes)>,
    write_attempts: usize,
    subscribed: bool,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    connected: Option<Arc<AtomicBool>>,
}

/// One simulated lens arm. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimArm {
    info: PeripheralInfo,
    state: Arc<Mutex<ArmState>>,
}

impl SimArm {
    fn new(info: PeripheralInfo) -> Self {
        let service = GattService {
            uuid: SERVICE_UUID,
            characteristics: vec![WRITE_CHAR_UUID, NOTIFY_CHAR_UUID],
        };
        Self {
            info,
            state: Arc::new(Mutex::new(ArmState {
                behavior: AckBehavior::AckByte,
                services: vec![service],
                deny_permission: false,
                max_mtu: 251,
                writes: Vec::new(),
                write_attempts: 0,
                subscribed: false,
                events: None,
                connected: None,
            })),
        }
    }

    pub fn info(&self) -> PeripheralInfo {
        self.info.clone()
    }

    pub fn set_behavior(&self, behavior: AckBehavior) {
        lock(&self.state).behavior = behavior;
    }

    /// Makes the next connection attempt fail with a permission error.
    pub fn deny_permission(&self) {
        lock(&self.state).deny_permission = true;
    }

    /// Hides the display service from service discovery.
    pub fn remove_service(&self) {
        lock(&self.state).services.clear();
    }

    pub fn set_max_mtu(&self, mtu: u16) {
        lock(&self.state).max_mtu = mtu;
    }

    /// Packets that reached the arm, in arrival order.
    pub fn writes(&self) -> Vec<Bytes> {
        lock(&self.state).writes.iter().map(|(_, data)| data.clone()).collect()
    }

    /// Same as [`writes`](Self::writes), with the (Tokio clock) arrival time
    /// of each packet.
    pub fn timed_writes(&self) -> Vec<(Instant, Bytes)> {
        lock(&self.state).writes.clone()
    }

    /// Every write issued against the arm, including rejected ones.
    pub fn write_attempts(&self) -> usize {
        lock(&self.state).write_attempts
    }

    pub fn clear_writes(&self) {
        let mut state = lock(&self.state);
        state.writes.clear();
        state.write_attempts = 0;
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state)
            .connected
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Pushes a notification to the host. Returns false when nobody listens.
    pub fn notify(&self, data: impl Into<Bytes>) -> bool {
        let state = lock(&self.state);
        if !state.subscribed {
            return false;
        }
        match &state.events {
            Some(tx) => tx
                .send(ConnectionEvent::Notification {
                    characteristic: NOTIFY_CHAR_UUID,
                    data: data.into(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Simulates the arm going out of range.
    pub fn drop_connection(&self) {
        let mut state = lock(&self.state);
        if let Some(flag) = state.connected.take() {
            flag.store(false, Ordering::SeqCst);
        }
        state.subscribed = false;
        if let Some(tx) = state.events.take() {
            let _ = tx.send(ConnectionEvent::Disconnected {
                reason: Some("out of range".to_owned()),
            });
        }
    }

    fn advertised_services(&self) -> Vec<Uuid> {
        // The arm keeps advertising the service even when discovery hides it.
        vec![SERVICE_UUID]
    }

    fn accept(&self) -> Result<ConnectedPeripheral, TransportError> {
        let mut state = lock(&self.state);
        if state.deny_permission {
            return Err(TransportError::PermissionDenied {
                permission: "bluetooth_connect".to_owned(),
            });
        }
        if let Some(old) = state.connected.take() {
            old.store(false, Ordering::SeqCst);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(true));
        state.events = Some(tx);
        state.connected = Some(Arc::clone(&connected));
        state.subscribed = false;

        let connection = SimConnection {
            arm: self.clone(),
            connected,
            mtu: AtomicU16::new(DEFAULT_MTU),
        };
        debug!("[Sim] {} connected", self.info.name);
        Ok(ConnectedPeripheral {
            connection: Arc::new(connection),
            events: rx,
        })
    }
}

// MARK: - SimConnection

struct SimConnection {
    arm: SimArm,
    connected: Arc<AtomicBool>,
    mtu: AtomicU16,
}

impl SimConnection {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

#[async_trait]
impl GattConnection for SimConnection {
    fn peripheral(&self) -> &PeripheralInfo {
        &self.arm.info
    }

    async fn request_mtu(&self, mtu: u16) -> Result<u16, TransportError> {
        self.ensure_connected()?;
        let granted = mtu.min(lock(&self.arm.state).max_mtu);
        self.mtu.store(granted, Ordering::SeqCst);
        Ok(granted)
    }

    async fn discover_services(&self) -> Result<Vec<GattService>, TransportError> {
        self.ensure_connected()?;
        Ok(lock(&self.arm.state).services.clone())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mut state = lock(&self.arm.state);
        let known = state
            .services
            .iter()
            .any(|s| s.has_characteristic(&characteristic));
        if !known {
            return Err(TransportError::CharacteristicNotFound {
                characteristic: characteristic.to_string(),
            });
        }
        state.subscribed = true;
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: Bytes) -> Result<(), TransportError> {
        self.ensure_connected()?;
        let mtu = self.mtu.load(Ordering::SeqCst) as usize;
        if data.len() > mtu {
            return Err(TransportError::MtuExceeded { size: data.len(), mtu });
        }
        if characteristic != WRITE_CHAR_UUID {
            return Err(TransportError::CharacteristicNotFound {
                characteristic: characteristic.to_string(),
            });
        }

        let mut state = lock(&self.arm.state);
        state.write_attempts += 1;
        if state.behavior == AckBehavior::FailWrites {
            return Err(TransportError::WriteFailed {
                reason: "simulated write rejection".to_owned(),
            });
        }
        state.writes.push((Instant::now(), data));

        let reply = match state.behavior {
            AckBehavior::AckByte if state.subscribed => Some(ConnectionEvent::Notification {
                characteristic: NOTIFY_CHAR_UUID,
                data: Bytes::from_static(&[ACK_SUCCESS]),
            }),
            AckBehavior::NakByte if state.subscribed => Some(ConnectionEvent::Notification {
                characteristic: NOTIFY_CHAR_UUID,
                data: Bytes::from_static(&[ACK_FAILURE]),
            }),
            AckBehavior::WriteCompletion => Some(ConnectionEvent::WriteCompleted { success: true }),
            AckBehavior::CompletionFailure => Some(ConnectionEvent::WriteCompleted { success: false }),
            _ => None,
        };
        if let (Some(reply), Some(tx)) = (reply, &state.events) {
            let _ = tx.send(reply);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut state = lock(&self.arm.state);
        let ours = state
            .connected
            .as_ref()
            .is_some_and(|flag| Arc::ptr_eq(flag, &self.connected));
        if ours {
            state.connected = None;
            state.events = None;
            state.subscribed = false;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
