use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lenslink_core::codec::{build_mic_enable, DisplayMode};
use lenslink_core::{
    DualConnectionState, GlassesState, InboundData, Page, PeripheralInfo, ProtocolConfig, TextChunk,
    TextFramer,
};
use lenslink_discovery::{DiscoveryError, ScanState, Scanner};
use lenslink_transport::Central;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::orchestrator::Orchestrator;
use crate::SessionError;

/// The page currently shown on both lenses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedPage {
    pub index: usize,
    pub total: usize,
    pub page: Page,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayOutcome {
    /// Both packets reached both arms.
    Shown,
    /// A newer request replaced this one before it was sent.
    Superseded,
    /// The text produced no pages; nothing was sent.
    Empty,
    /// At least one arm missed a packet.
    NotDelivered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    Resynced,
    /// Resending did not reach both arms; only a reconnect can recover.
    ReconnectRequired,
}

/// Text currently loaded for display.
#[derive(Debug)]
struct TextCursor {
    pages: Vec<Page>,
    current: Option<usize>,
    mode: DisplayMode,
    /// Sequence byte of the next page; each page uses two.
    seq: u8,
}

struct Shared {
    config: ProtocolConfig,
    framer: TextFramer,
    scanner: Scanner,
    orchestrator: Orchestrator,
    state_tx: watch::Sender<GlassesState>,
    page_tx: watch::Sender<Option<DisplayedPage>>,
    out_of_sync: watch::Sender<bool>,
    pair: Mutex<Option<(PeripheralInfo, PeripheralInfo)>>,
    cursor: tokio::sync::Mutex<TextCursor>,
    /// Bumped by every text request; a pending request only proceeds while
    /// it is still the newest.
    generation: AtomicU64,
    monitor: JoinHandle<()>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

// MARK: - GlassesSession

/// Everything a presentation layer needs to drive a pair of glasses.
/// Cheap to clone; clones share the same device.
#[derive(Clone)]
pub struct GlassesSession {
    shared: Arc<Shared>,
}

impl GlassesSession {
    /// Must be called within a Tokio runtime.
    pub fn new(central: Arc<dyn Central>, config: ProtocolConfig) -> Self {
        let framer = TextFramer::monospace(config.display.clone(), config.payload_limit);
        Self::with_framer(central, config, framer)
    }

    /// Session paginating with a custom framer (e.g. real font metrics).
    pub fn with_framer(central: Arc<dyn Central>, config: ProtocolConfig, framer: TextFramer) -> Self {
        let scanner = Scanner::new(Arc::clone(&central));
        let orchestrator = Orchestrator::new(central, config.clone());
        let (state_tx, _) = watch::channel(GlassesState::Disconnected);
        let (page_tx, _) = watch::channel(None);
        let (out_of_sync, _) = watch::channel(false);

        let monitor = tokio::spawn(monitor_state(
            scanner.state(),
            orchestrator.connection_state(),
            out_of_sync.subscribe(),
            state_tx.clone(),
        ));

        Self {
            shared: Arc::new(Shared {
                config,
                framer,
                scanner,
                orchestrator,
                state_tx,
                page_tx,
                out_of_sync,
                pair: Mutex::new(None),
                cursor: tokio::sync::Mutex::new(TextCursor {
                    pages: Vec::new(),
                    current: None,
                    mode: DisplayMode::Complete,
                    seq: 0,
                }),
                generation: AtomicU64::new(0),
                monitor,
            }),
        }
    }

    // ── Streams ──────────────────────────────────────────────────────────────

    pub fn glasses_state(&self) -> watch::Receiver<GlassesState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> GlassesState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn current_page(&self) -> watch::Receiver<Option<DisplayedPage>> {
        self.shared.page_tx.subscribe()
    }

    pub fn scan_state(&self) -> watch::Receiver<ScanState> {
        self.shared.scanner.state()
    }

    pub fn inbound(&self) -> broadcast::Receiver<InboundData> {
        self.shared.orchestrator.inbound()
    }

    // ── Connection ───────────────────────────────────────────────────────────

    pub async fn start_scan(&self) -> Result<(), SessionError> {
        self.shared.scanner.start_scan().await?;
        Ok(())
    }

    pub async fn stop_scan(&self) {
        self.shared.scanner.stop_scan().await;
    }

    /// Connects to the pair found by the scan, waiting for a running scan to
    /// find both arms if necessary.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let scan = self.shared.scanner.snapshot();
        let (left, right) = match scan.pair() {
            Some(pair) => pair,
            None if scan.scanning => self
                .shared
                .scanner
                .wait_for_pair(self.shared.config.scan_timeout())
                .await
                .map_err(|e| match e {
                    DiscoveryError::Timeout(_) => SessionError::NoPairFound,
                    other => SessionError::Discovery(other),
                })?,
            None => return Err(SessionError::NoPairFound),
        };
        self.shared.scanner.stop_scan().await;
        self.connect_to(left, right).await
    }

    /// Connects to an explicit pair and waits until both arms are ready.
    pub async fn connect_to(&self, left: PeripheralInfo, right: PeripheralInfo) -> Result<(), SessionError> {
        *lock(&self.shared.pair) = Some((left.clone(), right.clone()));
        self.shared.out_of_sync.send_replace(false);

        let orchestrator = &self.shared.orchestrator;
        orchestrator.connect(left, right).await;
        orchestrator
            .wait_until_ready(self.shared.config.connect_timeout())
            .await?;
        info!("[Session] glasses ready");
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.orchestrator.disconnect_all().await;
        self.shared.out_of_sync.send_replace(false);
        info!("[Session] disconnected");
    }

    /// Tears both links down and connects again to the last pair.
    pub async fn reconnect(&self) -> Result<(), SessionError> {
        let pair = lock(&self.shared.pair).clone();
        let Some((left, right)) = pair else {
            return Err(SessionError::NoPairFound);
        };
        info!("[Session] reconnecting to '{}' / '{}'", left.name, right.name);
        self.shared.orchestrator.disconnect_all().await;
        self.connect_to(left, right).await
    }

    // ── Display ──────────────────────────────────────────────────────────────

    /// Paginates `text` and shows its last page. With a non-zero `debounce`,
    /// the request waits that long and is dropped if a newer one arrived.
    pub async fn display_text(&self, text: &str, debounce: Duration) -> Result<DisplayOutcome, SessionError> {
        let generation = self.next_generation();
        if !debounce.is_zero() {
            tokio::time::sleep(debounce).await;
            if !self.is_current(generation) {
                debug!("[Session] display request superseded during debounce");
                return Ok(DisplayOutcome::Superseded);
            }
        }
        self.show_text(text, true, generation).await
    }

    /// Shows page `index` of the loaded text.
    pub async fn show_page(&self, index: usize) -> Result<DisplayOutcome, SessionError> {
        self.ensure_ready()?;
        let mut cursor = self.shared.cursor.lock().await;
        let total = cursor.pages.len();
        if index >= total {
            return Err(SessionError::PageOutOfRange { index, total });
        }
        Ok(self.send_page(&mut cursor, index, DisplayMode::Manual).await)
    }

    /// Resends the page last sent, to bring diverged arms back in step.
    pub async fn resync(&self) -> Result<ResyncOutcome, SessionError> {
        let mut cursor = self.shared.cursor.lock().await;
        let Some(index) = cursor.current else {
            return Err(SessionError::NothingToResync);
        };
        if !self.shared.orchestrator.state().is_ready() {
            warn!("[Session] resync impossible — links not ready");
            return Ok(ResyncOutcome::ReconnectRequired);
        }

        let mode = cursor.mode;
        match self.send_page(&mut cursor, index, mode).await {
            DisplayOutcome::Shown => {
                info!("[Session] resynced page {}", index);
                Ok(ResyncOutcome::Resynced)
            }
            _ => Ok(ResyncOutcome::ReconnectRequired),
        }
    }

    /// Consumes generated text, showing the newest page as it grows. Chunks
    /// already queued are merged before each update. Returns the full text.
    pub async fn run_text_stream(&self, mut chunks: mpsc::Receiver<TextChunk>) -> Result<String, SessionError> {
        let mut text = String::new();
        let mut finished = false;

        while let Some(chunk) = chunks.recv().await {
            text.push_str(&chunk.text);
            finished = chunk.done;
            while !finished {
                match chunks.try_recv() {
                    Ok(next) => {
                        text.push_str(&next.text);
                        finished = next.done;
                    }
                    Err(_) => break,
                }
            }

            let generation = self.next_generation();
            if self.show_text(&text, finished, generation).await? == DisplayOutcome::NotDelivered {
                warn!("[Session] stream update not delivered — continuing");
            }
            if finished {
                break;
            }
        }

        if !finished && !text.is_empty() {
            debug!("[Session] text stream closed without final chunk");
            let generation = self.next_generation();
            self.show_text(&text, true, generation).await?;
        }
        Ok(text)
    }

    // ── Microphone ───────────────────────────────────────────────────────────

    /// Switches the microphone of the configured arm. Returns whether the
    /// arm acknowledged.
    pub async fn set_mic_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        let arm = self.shared.config.mic_arm;
        if !self.shared.orchestrator.link_state(arm).is_ready() {
            return Err(SessionError::NotConnected);
        }
        let acked = self.shared.orchestrator.send_to(arm, build_mic_enable(enabled)).await;
        if acked {
            info!("[Session] microphone {} on {} arm", if enabled { "on" } else { "off" }, arm);
        } else {
            warn!("[Session] microphone command not acknowledged by {} arm", arm);
        }
        Ok(acked)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn next_generation(&self) -> u64 {
        self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == generation
    }

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.shared.orchestrator.state().is_ready() {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    async fn show_text(&self, text: &str, complete: bool, generation: u64) -> Result<DisplayOutcome, SessionError> {
        self.ensure_ready()?;
        let pages = self.shared.framer.paginate(text);
        if pages.is_empty() {
            return Ok(DisplayOutcome::Empty);
        }

        let mut cursor = self.shared.cursor.lock().await;
        if !self.is_current(generation) {
            return Ok(DisplayOutcome::Superseded);
        }
        let last = pages.len() - 1;
        cursor.pages = pages;
        let mode = if complete { DisplayMode::Complete } else { DisplayMode::Showing };
        Ok(self.send_page(&mut cursor, last, mode).await)
    }

    /// Sends one page as its two packets, each to both arms, and records the
    /// outcome.
    async fn send_page(&self, cursor: &mut TextCursor, index: usize, mode: DisplayMode) -> DisplayOutcome {
        let shared = &self.shared;
        let total = cursor.pages.len();
        let page = cursor.pages[index].clone();
        let seq = cursor.seq;
        cursor.seq = seq.wrapping_add(2);
        cursor.current = Some(index);
        cursor.mode = mode;

        let capacity = shared.orchestrator.text_payload_capacity().unwrap_or(usize::MAX);
        let [first, second] = shared
            .framer
            .capped(capacity)
            .build_packets_with_mode(&page, index, total, seq, mode);
        let was_ready = shared.orchestrator.state().is_ready();

        let delivered = shared.orchestrator.send_both(first).await && {
            tokio::time::sleep(shared.config.inter_packet_gap()).await;
            shared.orchestrator.send_both(second).await
        };

        if delivered {
            debug!("[Session] page {}/{} shown (seq={})", index + 1, total, seq);
            shared.page_tx.send_replace(Some(DisplayedPage { index, total, page }));
            shared.out_of_sync.send_replace(false);
            DisplayOutcome::Shown
        } else {
            if was_ready {
                warn!("[Session] page {}/{} not delivered to both arms — out of sync", index + 1, total);
                shared.out_of_sync.send_replace(true);
            }
            DisplayOutcome::NotDelivered
        }
    }
}

/// Derives the UI state from scan progress, pair state and the sync flag.
fn derive_state(scan: &ScanState, pair: &DualConnectionState, out_of_sync: bool) -> GlassesState {
    match pair {
        DualConnectionState::Ready if out_of_sync => GlassesState::OutOfSync,
        DualConnectionState::Disconnected if scan.scanning => GlassesState::Scanning,
        DualConnectionState::Disconnected => match &scan.error {
            Some(reason) => GlassesState::Error {
                reason: format!("scan: {reason}"),
            },
            None => GlassesState::Disconnected,
        },
        other => GlassesState::from(other),
    }
}

async fn monitor_state(
    mut scan: watch::Receiver<ScanState>,
    mut pair: watch::Receiver<DualConnectionState>,
    mut out_of_sync: watch::Receiver<bool>,
    out: watch::Sender<GlassesState>,
) {
    loop {
        let scan_now = scan.borrow_and_update().clone();
        let pair_now = pair.borrow_and_update().clone();
        let sync_now = *out_of_sync.borrow_and_update();
        let next = derive_state(&scan_now, &pair_now, sync_now);
        out.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            info!("[Session] {} → {}", current.label(), next.label());
            *current = next;
            true
        });

        let open = tokio::select! {
            r = scan.changed() => r.is_ok(),
            r = pair.changed() => r.is_ok(),
            r = out_of_sync.changed() => r.is_ok(),
        };
        if !open {
            break;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use lenslink_core::codec::CMD_TEXT;
    use lenslink_transport::sim::{AckBehavior, SimArm, SimCentral};

    struct Rig {
        central: SimCentral,
        session: GlassesSession,
        left: SimArm,
        right: SimArm,
    }

    fn rig() -> Rig {
        let central = SimCentral::new();
        let left = central.add_arm("G1_42_L_");
        let right = central.add_arm("G1_42_R_");
        let session = GlassesSession::new(Arc::new(central.clone()), ProtocolConfig::default());
        Rig { central, session, left, right }
    }

    async fn connected() -> Rig {
        let rig = rig();
        rig.session
            .connect_to(rig.left.info(), rig.right.info())
            .await
            .expect("connected");
        rig.left.clear_writes();
        rig.right.clear_writes();
        rig
    }

    async fn wait_state(session: &GlassesSession, want: GlassesState) {
        let mut rx = session.glasses_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("state reached in time")
            .expect("state stream open");
    }

    fn text_packets(arm: &SimArm) -> Vec<Bytes> {
        arm.writes().into_iter().filter(|p| p[0] == CMD_TEXT).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn scan_then_connect() {
        let rig = rig();
        rig.session.start_scan().await.unwrap();
        wait_state(&rig.session, GlassesState::Scanning).await;

        rig.central.advertise(&rig.left);
        rig.central.advertise(&rig.right);
        rig.session.connect().await.expect("connect via scan");

        wait_state(&rig.session, GlassesState::Ready).await;
        assert!(!rig.central.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_without_pair_fails() {
        let rig = rig();
        let err = rig.session.connect().await.unwrap_err();
        assert!(matches!(err, SessionError::NoPairFound));
    }

    #[tokio::test(start_paused = true)]
    async fn display_requires_connection() {
        let rig = rig();
        let err = rig.session.display_text("hello", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn display_text_shows_last_page_on_both_arms() {
        let rig = connected().await;
        let text = (1..=12).map(|n| format!("line {n}")).collect::<Vec<_>>().join("\n");

        let outcome = rig.session.display_text(&text, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, DisplayOutcome::Shown);

        let left = text_packets(&rig.left);
        assert_eq!(left, text_packets(&rig.right));
        assert_eq!(left.len(), 2);
        // seq, total, index, mode, offset, page, max page
        assert_eq!(&left[0][1..9], &[0, 2, 0, 0x40, 0, 0, 2, 2]);
        assert_eq!(&left[0][9..], b"line 11\nline 12");
        assert_eq!(left[1][1], 1);
        assert!(left[1][9..].is_empty());

        let shown = rig.session.current_page().borrow().clone().expect("page shown");
        assert_eq!((shown.index, shown.total), (2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn second_packet_waits_inter_packet_gap() {
        let rig = connected().await;
        rig.session.display_text("hello", Duration::ZERO).await.unwrap();

        let timed = |arm: &SimArm| -> Vec<tokio::time::Instant> {
            arm.timed_writes()
                .into_iter()
                .filter(|(_, p)| p[0] == CMD_TEXT)
                .map(|(at, _)| at)
                .collect()
        };
        let (left, right) = (timed(&rig.left), timed(&rig.right));
        assert_eq!((left.len(), right.len()), (2, 2));
        assert!(right[0].duration_since(left[0]) >= Duration::from_millis(20));
        assert!(left[1].duration_since(right[0]) >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn text_is_cut_to_negotiated_mtu() {
        let rig = rig();
        rig.left.set_max_mtu(100);
        rig.right.set_max_mtu(100);
        rig.session
            .connect_to(rig.left.info(), rig.right.info())
            .await
            .expect("connected");

        let text = "abcdefghij ".repeat(12);
        let outcome = rig.session.display_text(&text, Duration::ZERO).await.unwrap();
        assert_eq!(outcome, DisplayOutcome::Shown);

        let packets = text_packets(&rig.left);
        assert_eq!(packets, text_packets(&rig.right));
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].len(), 100);
        assert!(packets.iter().all(|p| p.len() <= 100));
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_advances_by_two_per_page() {
        let rig = connected().await;
        rig.session.display_text("first", Duration::ZERO).await.unwrap();
        rig.session.display_text("second", Duration::ZERO).await.unwrap();

        let seqs: Vec<u8> = text_packets(&rig.left).iter().map(|p| p[1]).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_supersedes_debounced_one() {
        let rig = connected().await;
        let debounce = Duration::from_millis(200);

        let (first, second) = tokio::join!(
            rig.session.display_text("draft", debounce),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                rig.session.display_text("final", debounce).await
            }
        );
        assert_eq!(first.unwrap(), DisplayOutcome::Superseded);
        assert_eq!(second.unwrap(), DisplayOutcome::Shown);

        let packets = text_packets(&rig.left);
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0][9..], b"final");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_sends_nothing() {
        let rig = connected().await;
        let outcome = rig.session.display_text("", Duration::ZERO).await.unwrap();
        assert_eq!(outcome, DisplayOutcome::Empty);
        assert!(rig.left.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn left_failure_marks_out_of_sync_and_resync_recovers() {
        let rig = connected().await;
        rig.left.set_behavior(AckBehavior::NakByte);

        let outcome = rig.session.display_text("hello", Duration::ZERO).await.unwrap();
        assert_eq!(outcome, DisplayOutcome::NotDelivered);
        assert_eq!(rig.right.write_attempts(), 0);
        wait_state(&rig.session, GlassesState::OutOfSync).await;

        rig.left.set_behavior(AckBehavior::AckByte);
        assert_eq!(rig.session.resync().await.unwrap(), ResyncOutcome::Resynced);
        wait_state(&rig.session, GlassesState::Ready).await;
        assert_eq!(text_packets(&rig.right).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resync_requires_reconnect() {
        let rig = connected().await;
        rig.right.set_behavior(AckBehavior::NakByte);

        rig.session.display_text("hello", Duration::ZERO).await.unwrap();
        wait_state(&rig.session, GlassesState::OutOfSync).await;
        assert_eq!(rig.session.resync().await.unwrap(), ResyncOutcome::ReconnectRequired);

        rig.right.set_behavior(AckBehavior::AckByte);
        rig.session.reconnect().await.expect("reconnected");
        wait_state(&rig.session, GlassesState::Ready).await;
    }

    #[tokio::test(start_paused = true)]
    async fn resync_needs_a_page() {
        let rig = connected().await;
        assert!(matches!(rig.session.resync().await, Err(SessionError::NothingToResync)));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_paging() {
        let rig = connected().await;
        let text = (1..=7).map(|n| format!("row {n}")).collect::<Vec<_>>().join("\n");
        rig.session.display_text(&text, Duration::ZERO).await.unwrap();
        rig.left.clear_writes();

        assert_eq!(rig.session.show_page(0).await.unwrap(), DisplayOutcome::Shown);
        let packets = text_packets(&rig.left);
        assert_eq!(packets[0][4], 0x50);
        assert_eq!(packets[0][7], 0);
        assert!(matches!(
            rig.session.show_page(5).await,
            Err(SessionError::PageOutOfRange { index: 5, total: 2 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn mic_goes_to_configured_arm_only() {
        let rig = connected().await;
        assert!(rig.session.set_mic_enabled(true).await.unwrap());
        assert!(rig.left.writes().is_empty());
        assert_eq!(rig.right.writes(), vec![build_mic_enable(true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn text_stream_marks_completion_on_final_chunk() {
        let rig = connected().await;
        let (tx, rx) = mpsc::channel(8);
        let session = rig.session.clone();
        let consumer = tokio::spawn(async move { session.run_text_stream(rx).await });

        tx.send(TextChunk::partial("Hello")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(TextChunk::last(" world")).await.unwrap();

        let text = consumer.await.unwrap().unwrap();
        assert_eq!(text, "Hello world");

        let packets = text_packets(&rig.left);
        let modes: Vec<u8> = packets.iter().step_by(2).map(|p| p[4]).collect();
        assert_eq!(modes, vec![0x30, 0x40]);
        assert_eq!(&packets[2][9..], b"Hello world");
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_state() {
        let rig = connected().await;
        rig.session.disconnect().await;
        wait_state(&rig.session, GlassesState::Disconnected).await;
        assert!(!rig.left.is_connected());
    }
}
