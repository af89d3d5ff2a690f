//! Acknowledged writes with bounded retry.
//!
//! The acknowledgment channel is a single slot: the latest completion or
//! acknowledgment byte overwrites whatever was there. The protocol carries no
//! correlation id, so a late acknowledgment of an earlier write can satisfy
//! the current one.

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use lenslink_core::codec::AckStatus;
use lenslink_core::{Arm, ProtocolConfig, TransportError, WRITE_CHAR_UUID};
use lenslink_transport::{GattConnection, DEFAULT_MTU};
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WriteParams {
    pub max_attempts: u32,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl From<&ProtocolConfig> for WriteParams {
    fn from(cfg: &ProtocolConfig) -> Self {
        Self {
            max_attempts: cfg.max_write_attempts.max(1),
            timeout: cfg.write_timeout(),
            retry_delay: cfg.retry_delay(),
        }
    }
}

/// Write path of one link, shared by content writers and the heartbeat.
pub(crate) struct LinkWriter {
    arm: Arm,
    params: WriteParams,
    connection: OnceLock<Arc<dyn GattConnection>>,
    ack_tx: watch::Sender<Option<AckStatus>>,
    closed: AtomicBool,
    /// Largest packet the connection accepts, as negotiated.
    mtu: AtomicU16,
    /// Writes are never pipelined within a link.
    write_lock: Mutex<()>,
}

impl LinkWriter {
    pub fn new(arm: Arm, params: WriteParams) -> Self {
        let (ack_tx, _) = watch::channel(None);
        Self {
            arm,
            params,
            connection: OnceLock::new(),
            ack_tx,
            closed: AtomicBool::new(false),
            mtu: AtomicU16::new(DEFAULT_MTU),
            write_lock: Mutex::new(()),
        }
    }

    pub fn attach(&self, connection: Arc<dyn GattConnection>) {
        let _ = self.connection.set(connection);
    }

    pub fn connection(&self) -> Option<&Arc<dyn GattConnection>> {
        self.connection.get()
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.mtu.store(mtu, Ordering::SeqCst);
    }

    pub fn mtu(&self) -> u16 {
        self.mtu.load(Ordering::SeqCst)
    }

    /// Stores the latest acknowledgment, replacing any unread one.
    pub fn record_ack(&self, status: AckStatus) {
        self.ack_tx.send_replace(Some(status));
    }

    /// Makes pending and future writes fail without further attempts.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes `data` and waits for it to be acknowledged, retrying up to the
    /// configured attempt count. Returns `false` once attempts are exhausted
    /// or the link is gone.
    pub async fn write(&self, data: Bytes) -> bool {
        let _serial = self.write_lock.lock().await;
        let Some(connection) = self.connection.get() else {
            warn!("Link[{}] write before connection established", self.arm.tag());
            return false;
        };
        let cmd = data.first().copied().unwrap_or_default();

        // Retrying cannot shrink the packet.
        let mtu = self.mtu();
        if data.len() > usize::from(mtu) {
            warn!(
                "Link[{}] cmd=0x{:02X} is {} bytes, exceeds MTU {} — not sent",
                self.arm.tag(),
                cmd,
                data.len(),
                mtu
            );
            return false;
        }

        for attempt in 1..=self.params.max_attempts {
            if self.is_closed() || !connection.is_connected() {
                debug!("Link[{}] link closed — abandoning write cmd=0x{:02X}", self.arm.tag(), cmd);
                return false;
            }

            let mut ack_rx = self.ack_tx.subscribe();
            self.ack_tx.send_replace(None);
            ack_rx.borrow_and_update();

            match connection.write(WRITE_CHAR_UUID, data.clone()).await {
                Ok(()) => {
                    match tokio::time::timeout(self.params.timeout, next_ack(&mut ack_rx)).await {
                        Ok(Some(AckStatus::Success)) => {
                            if attempt > 1 {
                                debug!(
                                    "Link[{}] cmd=0x{:02X} acknowledged on attempt {}",
                                    self.arm.tag(), cmd, attempt
                                );
                            }
                            return true;
                        }
                        Ok(Some(AckStatus::Failure)) => {
                            debug!(
                                "Link[{}] cmd=0x{:02X} rejected (attempt {}/{})",
                                self.arm.tag(), cmd, attempt, self.params.max_attempts
                            );
                        }
                        Ok(None) => return false,
                        Err(_) => {
                            debug!(
                                "Link[{}] cmd=0x{:02X} timed out after {:?} (attempt {}/{})",
                                self.arm.tag(), cmd, self.params.timeout, attempt, self.params.max_attempts
                            );
                        }
                    }
                }
                Err(TransportError::Disconnected) => {
                    debug!("Link[{}] disconnected during write cmd=0x{:02X}", self.arm.tag(), cmd);
                    return false;
                }
                Err(e @ TransportError::MtuExceeded { .. }) => {
                    warn!("Link[{}] write rejected cmd=0x{:02X}: {}", self.arm.tag(), cmd, e);
                    return false;
                }
                Err(e) => {
                    debug!(
                        "Link[{}] write error cmd=0x{:02X} (attempt {}/{}): {}",
                        self.arm.tag(), cmd, attempt, self.params.max_attempts, e
                    );
                }
            }

            if attempt < self.params.max_attempts {
                tokio::time::sleep(self.params.retry_delay).await;
            }
        }

        warn!(
            "Link[{}] write exhausted {} attempts (cmd=0x{:02X}, {} bytes)",
            self.arm.tag(),
            self.params.max_attempts,
            cmd,
            data.len()
        );
        false
    }
}

/// Waits for the slot to be filled. `None` if the slot owner is gone.
async fn next_ack(rx: &mut watch::Receiver<Option<AckStatus>>) -> Option<AckStatus> {
    loop {
        rx.changed().await.ok()?;
        if let Some(status) = *rx.borrow_and_update() {
            return Some(status);
        }
    }
}
