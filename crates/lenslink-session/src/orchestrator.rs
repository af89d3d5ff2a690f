use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use lenslink_core::codec::TEXT_HEADER_LEN;
use lenslink_core::{Arm, DualConnectionState, InboundData, LinkState, PeripheralInfo, ProtocolConfig};
use lenslink_link::{Link, LinkError};
use lenslink_transport::Central;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::SessionError;

const INBOUND_CAPACITY: usize = 64;

struct LinkPair {
    left: Arc<Link>,
    right: Arc<Link>,
    aggregator: JoinHandle<()>,
}

/// Long-lived owner of the two arm links.
///
/// Links are independent: each has its own state machine, write path and
/// heartbeat. The pair state is only ever derived from theirs.
pub struct Orchestrator {
    central: Arc<dyn Central>,
    config: ProtocolConfig,
    links: Mutex<Option<LinkPair>>,
    state_tx: watch::Sender<DualConnectionState>,
    inbound_tx: broadcast::Sender<InboundData>,
}

impl Orchestrator {
    pub fn new(central: Arc<dyn Central>, config: ProtocolConfig) -> Self {
        let (state_tx, _) = watch::channel(DualConnectionState::Disconnected);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            central,
            config,
            links: Mutex::new(None),
            state_tx,
            inbound_tx,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Replaces any existing links with a fresh pair. Both arms connect
    /// concurrently; use [`wait_until_ready`](Self::wait_until_ready) to
    /// wait for the handshakes.
    pub async fn connect(&self, left: PeripheralInfo, right: PeripheralInfo) {
        self.disconnect_all().await;
        info!("[Orchestrator] connecting left='{}' right='{}'", left.name, right.name);

        let left = Arc::new(Link::spawn(
            Arm::Left,
            Arc::clone(&self.central),
            left,
            &self.config,
            self.inbound_tx.clone(),
        ));
        let right = Arc::new(Link::spawn(
            Arm::Right,
            Arc::clone(&self.central),
            right,
            &self.config,
            self.inbound_tx.clone(),
        ));
        let aggregator = tokio::spawn(aggregate(
            left.subscribe_state(),
            right.subscribe_state(),
            self.state_tx.clone(),
        ));

        *lock(&self.links) = Some(LinkPair { left, right, aggregator });
    }

    /// Tears both links down, whatever their state.
    pub async fn disconnect_all(&self) {
        let pair = lock(&self.links).take();
        if let Some(LinkPair { left, right, aggregator }) = pair {
            aggregator.abort();
            tokio::join!(left.disconnect(), right.disconnect());
            info!("[Orchestrator] both links torn down");
        }
        self.state_tx.send_replace(DualConnectionState::Disconnected);
    }

    /// Waits until both arms are ready. Fails as soon as either arm errors.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut rx = self.state_tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.is_ready() || matches!(s, DualConnectionState::Error { .. })),
        )
        .await;

        match waited {
            Err(_) => Err(SessionError::ConnectTimeout(timeout)),
            Ok(Err(_)) => Err(SessionError::NotConnected),
            Ok(Ok(state)) => match &*state {
                DualConnectionState::Error { reason } => Err(SessionError::Link(LinkError::Failed {
                    reason: reason.clone(),
                })),
                _ => Ok(()),
            },
        }
    }

    // ── Observation ──────────────────────────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<DualConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> DualConnectionState {
        self.state_tx.borrow().clone()
    }

    /// State of one arm, `Disconnected` when no links exist.
    pub fn link_state(&self, arm: Arm) -> LinkState {
        self.link(arm).map(|l| l.state()).unwrap_or_default()
    }

    /// Largest text payload a single packet can carry to both arms: the
    /// configured limit, lowered to what the smaller negotiated MTU leaves
    /// after the header. `None` when no links exist.
    pub fn text_payload_capacity(&self) -> Option<usize> {
        let (left, right) = self.pair()?;
        let mtu = left.mtu().min(right.mtu());
        Some(
            usize::from(mtu)
                .saturating_sub(TEXT_HEADER_LEN)
                .min(self.config.payload_limit),
        )
    }

    /// Non-acknowledgment notifications from both arms.
    pub fn inbound(&self) -> broadcast::Receiver<InboundData> {
        self.inbound_tx.subscribe()
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Sends `data` to the left arm, then to the right. The right arm is only
    /// written once the left acknowledged; a left failure returns `false`
    /// without touching the right arm.
    pub async fn send_both(&self, data: Bytes) -> bool {
        let Some((left, right)) = self.pair() else {
            warn!("[Orchestrator] send_both without links");
            return false;
        };
        let cmd = data.first().copied().unwrap_or_default();

        if !left.write(data.clone()).await {
            warn!("[Orchestrator] left write failed (cmd=0x{:02X}) — right arm skipped", cmd);
            return false;
        }
        tokio::time::sleep(self.config.inter_arm_delay()).await;

        if !right.write(data).await {
            warn!("[Orchestrator] right write failed (cmd=0x{:02X}) — arms diverged", cmd);
            return false;
        }
        debug!("[Orchestrator] cmd=0x{:02X} delivered to both arms", cmd);
        true
    }

    pub async fn send_to(&self, arm: Arm, data: Bytes) -> bool {
        match self.link(arm) {
            Some(link) => link.write(data).await,
            None => {
                warn!("[Orchestrator] no {} link to send to", arm);
                false
            }
        }
    }

    pub async fn send_to_left(&self, data: Bytes) -> bool {
        self.send_to(Arm::Left, data).await
    }

    pub async fn send_to_right(&self, data: Bytes) -> bool {
        self.send_to(Arm::Right, data).await
    }

    fn pair(&self) -> Option<(Arc<Link>, Arc<Link>)> {
        lock(&self.links)
            .as_ref()
            .map(|p| (Arc::clone(&p.left), Arc::clone(&p.right)))
    }

    fn link(&self, arm: Arm) -> Option<Arc<Link>> {
        let links = lock(&self.links);
        let pair = links.as_ref()?;
        Some(match arm {
            Arm::Left => Arc::clone(&pair.left),
            Arm::Right => Arc::clone(&pair.right),
        })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(pair) = lock(&self.links).take() {
            pair.aggregator.abort();
        }
    }
}

/// Recomputes the pair state whenever either arm publishes. Never writes
/// link state. Keeps following the other arm after one link finished.
async fn aggregate(
    mut left: watch::Receiver<LinkState>,
    mut right: watch::Receiver<LinkState>,
    out: watch::Sender<DualConnectionState>,
) {
    let mut left_open = true;
    let mut right_open = true;

    while left_open || right_open {
        let l = left.borrow_and_update().clone();
        let r = right.borrow_and_update().clone();
        let next = DualConnectionState::from_pair(&l, &r);
        out.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("[Orchestrator] pair state {:?} → {:?}", current, next);
            *current = next;
            true
        });

        tokio::select! {
            changed = left.changed(), if left_open => left_open = changed.is_ok(),
            changed = right.changed(), if right_open => right_open = changed.is_ok(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lenslink_core::codec::build_mic_enable;
    use lenslink_transport::sim::{AckBehavior, SimArm, SimCentral};

    struct Rig {
        orchestrator: Orchestrator,
        left: SimArm,
        right: SimArm,
    }

    async fn ready_pair() -> Rig {
        let central = SimCentral::new();
        let left = central.add_arm("G1_7_L_");
        let right = central.add_arm("G1_7_R_");
        let orchestrator = Orchestrator::new(Arc::new(central), ProtocolConfig::default());

        orchestrator.connect(left.info(), right.info()).await;
        orchestrator
            .wait_until_ready(Duration::from_secs(5))
            .await
            .expect("pair ready");
        left.clear_writes();
        right.clear_writes();
        Rig { orchestrator, left, right }
    }

    #[tokio::test(start_paused = true)]
    async fn pair_becomes_ready() {
        let rig = ready_pair().await;
        assert_eq!(rig.orchestrator.state(), DualConnectionState::Ready);
        assert_eq!(rig.orchestrator.link_state(Arm::Left), LinkState::Ready);
        assert_eq!(rig.orchestrator.link_state(Arm::Right), LinkState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn send_both_writes_left_then_right() {
        let rig = ready_pair().await;
        let packet = build_mic_enable(true);

        assert!(rig.orchestrator.send_both(packet.clone()).await);
        assert_eq!(rig.left.writes(), vec![packet.clone()]);
        assert_eq!(rig.right.writes(), vec![packet]);
    }

    #[tokio::test(start_paused = true)]
    async fn right_write_waits_inter_arm_delay() {
        let rig = ready_pair().await;

        assert!(rig.orchestrator.send_both(build_mic_enable(true)).await);
        let (left_at, _) = rig.left.timed_writes()[0].clone();
        let (right_at, _) = rig.right.timed_writes()[0].clone();
        assert!(right_at.duration_since(left_at) >= Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn payload_capacity_follows_smaller_mtu() {
        let central = SimCentral::new();
        let left = central.add_arm("G1_7_L_");
        let right = central.add_arm("G1_7_R_");
        right.set_max_mtu(100);
        let orchestrator = Orchestrator::new(Arc::new(central), ProtocolConfig::default());
        assert_eq!(orchestrator.text_payload_capacity(), None);

        orchestrator.connect(left.info(), right.info()).await;
        orchestrator.wait_until_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(orchestrator.text_payload_capacity(), Some(100 - TEXT_HEADER_LEN));
    }

    #[tokio::test(start_paused = true)]
    async fn payload_capacity_never_exceeds_configured_limit() {
        let rig = ready_pair().await;
        assert_eq!(rig.orchestrator.text_payload_capacity(), Some(191));
    }

    #[tokio::test(start_paused = true)]
    async fn left_failure_never_touches_right() {
        let rig = ready_pair().await;
        rig.left.set_behavior(AckBehavior::NakByte);

        assert!(!rig.orchestrator.send_both(build_mic_enable(true)).await);
        assert_eq!(rig.left.write_attempts(), 10);
        assert_eq!(rig.right.write_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn right_failure_reports_false_after_left_succeeded() {
        let rig = ready_pair().await;
        rig.right.set_behavior(AckBehavior::NakByte);

        assert!(!rig.orchestrator.send_both(build_mic_enable(false)).await);
        assert_eq!(rig.left.writes().len(), 1);
        assert_eq!(rig.right.write_attempts(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn single_arm_send() {
        let rig = ready_pair().await;
        assert!(rig.orchestrator.send_to_right(build_mic_enable(true)).await);
        assert!(rig.left.writes().is_empty());
        assert_eq!(rig.right.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_arm_error_fails_the_pair() {
        let central = SimCentral::new();
        let left = central.add_arm("G1_7_L_");
        let right = central.add_arm("G1_7_R_");
        right.remove_service();
        let orchestrator = Orchestrator::new(Arc::new(central), ProtocolConfig::default());

        orchestrator.connect(left.info(), right.info()).await;
        let err = orchestrator.wait_until_ready(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SessionError::Link(LinkError::Failed { ref reason }) if reason.starts_with("right:")));
    }

    #[tokio::test(start_paused = true)]
    async fn arm_drop_degrades_pair_state() {
        let rig = ready_pair().await;
        let mut state = rig.orchestrator.connection_state();

        rig.right.drop_connection();
        let now = state.wait_for(|s| !s.is_ready()).await.unwrap().clone();
        assert_eq!(now, DualConnectionState::Connected);
        assert_eq!(rig.orchestrator.link_state(Arm::Left), LinkState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_data_carries_arm() {
        let rig = ready_pair().await;
        let mut inbound = rig.orchestrator.inbound();

        rig.right.notify(vec![0xF5, 0x01]);
        let data = inbound.recv().await.unwrap();
        assert_eq!(data.arm, Arm::Right);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_all_resets_state() {
        let rig = ready_pair().await;
        rig.orchestrator.disconnect_all().await;

        assert_eq!(rig.orchestrator.state(), DualConnectionState::Disconnected);
        assert!(!rig.left.is_connected());
        assert!(!rig.right.is_connected());
        assert!(!rig.orchestrator.send_both(build_mic_enable(true)).await);
    }
}
