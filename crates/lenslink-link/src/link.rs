use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lenslink_core::codec::{build_handshake, classify_inbound, AckStatus, Inbound};
use lenslink_core::{
    Arm, InboundData, LinkState, PeripheralInfo, ProtocolConfig, TransportError, NOTIFY_CHAR_UUID,
    SERVICE_UUID, WRITE_CHAR_UUID,
};
use lenslink_transport::{Central, ConnectedPeripheral, ConnectionEvent};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::heartbeat::spawn_heartbeat;
use crate::writer::{LinkWriter, WriteParams};
use crate::LinkError;

/// Events serialized into the driver task.
#[derive(Debug)]
enum DriverEvent {
    Shutdown,
    TransportDisconnected { reason: Option<String> },
}

// MARK: - Link

/// Connection to one arm. Created when the arm is chosen, destroyed on
/// disconnect or reconnect; it never reconnects by itself.
pub struct Link {
    arm: Arm,
    peripheral: PeripheralInfo,
    state_rx: watch::Receiver<LinkState>,
    writer: Arc<LinkWriter>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
}

impl Link {
    /// Creates the link and starts connecting immediately. Non-acknowledgment
    /// notifications are published on `inbound` tagged with `arm`.
    pub fn spawn(
        arm: Arm,
        central: Arc<dyn Central>,
        peripheral: PeripheralInfo,
        config: &ProtocolConfig,
        inbound: broadcast::Sender<InboundData>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let writer = Arc::new(LinkWriter::new(arm, WriteParams::from(config)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            arm,
            central,
            peripheral: peripheral.clone(),
            state_tx,
            writer: Arc::clone(&writer),
            events_tx: events_tx.clone(),
            inbound,
            target_mtu: config.target_mtu,
            settle: config.handshake_settle(),
            heartbeat_every: config.heartbeat_interval(),
        };
        tokio::spawn(driver.run(events_rx));

        Self {
            arm,
            peripheral,
            state_rx,
            writer,
            events_tx,
        }
    }

    pub fn arm(&self) -> Arm {
        self.arm
    }

    pub fn peripheral(&self) -> &PeripheralInfo {
        &self.peripheral
    }

    pub fn state(&self) -> LinkState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Largest packet this link accepts. The BLE default until the MTU was
    /// negotiated.
    pub fn mtu(&self) -> u16 {
        self.writer.mtu()
    }

    /// Waits until the handshake completed, or the link failed.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), LinkError> {
        let mut rx = self.state_rx.clone();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.is_ready() || matches!(s, LinkState::Error { .. })),
        )
        .await;

        match waited {
            Err(_) => Err(LinkError::Transport(TransportError::Timeout {
                ms: timeout.as_millis() as u64,
            })),
            Ok(Err(_)) => Err(LinkError::TornDown),
            Ok(Ok(state)) => match &*state {
                LinkState::Error { reason } => Err(LinkError::Failed {
                    reason: reason.clone(),
                }),
                _ => Ok(()),
            },
        }
    }

    /// Acknowledged write with bounded retry. Callers must not overlap
    /// writes on the same link; overlapping calls are queued.
    pub async fn write(&self, data: Bytes) -> bool {
        self.writer.write(data).await
    }

    /// Tears the link down and waits for the driver to finish. In-flight
    /// writes fail without further attempts.
    pub async fn disconnect(&self) {
        self.writer.close();
        let _ = self.events_tx.send(DriverEvent::Shutdown);
        // The state sender lives exactly as long as the driver.
        let mut rx = self.state_rx.clone();
        while rx.changed().await.is_ok() {}
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.writer.close();
        let _ = self.events_tx.send(DriverEvent::Shutdown);
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("arm", &self.arm)
            .field("peripheral", &self.peripheral)
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

// MARK: - Driver

/// Sole writer of the link state.
struct Driver {
    arm: Arm,
    central: Arc<dyn Central>,
    peripheral: PeripheralInfo,
    state_tx: watch::Sender<LinkState>,
    writer: Arc<LinkWriter>,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    inbound: broadcast::Sender<InboundData>,
    target_mtu: u16,
    settle: Duration,
    heartbeat_every: Duration,
}

impl Driver {
    async fn run(self, mut events: mpsc::UnboundedReceiver<DriverEvent>) {
        let tag = self.arm.tag();
        self.set_state(LinkState::Connecting);
        info!("Link[{}] connecting to '{}' ({})", tag, self.peripheral.name, self.peripheral.id);

        let established = tokio::select! {
            res = self.establish() => res,
            ev = events.recv() => Err(match ev {
                Some(DriverEvent::TransportDisconnected { .. }) => LinkError::Transport(TransportError::Disconnected),
                Some(DriverEvent::Shutdown) | None => LinkError::TornDown,
            }),
        };

        if let Err(e) = established {
            self.teardown().await;
            match e {
                LinkError::TornDown | LinkError::Transport(TransportError::Disconnected) => {
                    info!("Link[{}] setup interrupted: {}", tag, e);
                    self.set_state(LinkState::Disconnected);
                }
                other => {
                    warn!("Link[{}] setup failed: {}", tag, other);
                    self.set_state(LinkState::Error {
                        reason: other.to_string(),
                    });
                }
            }
            return;
        }

        self.set_state(LinkState::Ready);
        info!("Link[{}] ready", tag);
        let heartbeat = spawn_heartbeat(self.arm, Arc::clone(&self.writer), self.heartbeat_every);

        match events.recv().await {
            Some(DriverEvent::TransportDisconnected { reason }) => {
                warn!(
                    "Link[{}] connection lost: {}",
                    tag,
                    reason.as_deref().unwrap_or("no reason given")
                );
            }
            Some(DriverEvent::Shutdown) | None => {
                info!("Link[{}] disconnect requested", tag);
            }
        }

        heartbeat.abort();
        self.teardown().await;
        self.set_state(LinkState::Disconnected);
    }

    async fn establish(&self) -> Result<(), LinkError> {
        let tag = self.arm.tag();
        let ConnectedPeripheral { connection, events } = self.central.connect(&self.peripheral).await?;
        self.writer.attach(Arc::clone(&connection));
        self.set_state(LinkState::Connected);

        tokio::spawn(pump_events(
            self.arm,
            events,
            Arc::clone(&self.writer),
            self.inbound.clone(),
            self.events_tx.clone(),
        ));

        match connection.request_mtu(self.target_mtu).await {
            Ok(mtu) => {
                debug!("Link[{}] MTU negotiated: {}", tag, mtu);
                self.writer.set_mtu(mtu);
            }
            Err(e) => warn!("Link[{}] MTU negotiation failed ({}) — keeping default", tag, e),
        }

        let services = connection.discover_services().await?;
        let usable = services.iter().any(|s| {
            s.uuid == SERVICE_UUID
                && s.has_characteristic(&WRITE_CHAR_UUID)
                && s.has_characteristic(&NOTIFY_CHAR_UUID)
        });
        if !usable {
            return Err(LinkError::ServiceMissing {
                peripheral: self.peripheral.name.clone(),
            });
        }

        connection.subscribe(NOTIFY_CHAR_UUID).await?;
        tokio::time::sleep(self.settle).await;

        if !self.writer.write(build_handshake()).await {
            return Err(LinkError::HandshakeFailed);
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.writer.close();
        if let Some(connection) = self.writer.connection() {
            if connection.is_connected() {
                if let Err(e) = connection.disconnect().await {
                    debug!("Link[{}] disconnect error: {}", self.arm.tag(), e);
                }
            }
        }
    }

    fn set_state(&self, state: LinkState) {
        debug!("Link[{}] state → {:?}", self.arm.tag(), state);
        self.state_tx.send_replace(state);
    }
}

// MARK: - Event pump

/// Routes transport callbacks of one connection, in arrival order.
async fn pump_events(
    arm: Arm,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    writer: Arc<LinkWriter>,
    inbound: broadcast::Sender<InboundData>,
    driver: mpsc::UnboundedSender<DriverEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Notification { data, .. } => match classify_inbound(&data) {
                Inbound::Ack(status) => writer.record_ack(status),
                Inbound::Data => {
                    debug!("Link[{}] inbound {} bytes", arm.tag(), data.len());
                    let _ = inbound.send(InboundData { arm, data });
                }
            },
            ConnectionEvent::WriteCompleted { success } => {
                writer.record_ack(if success { AckStatus::Success } else { AckStatus::Failure });
            }
            ConnectionEvent::Disconnected { reason } => {
                writer.close();
                let _ = driver.send(DriverEvent::TransportDisconnected { reason });
                return;
            }
        }
    }
    let _ = driver.send(DriverEvent::TransportDisconnected { reason: None });
}
