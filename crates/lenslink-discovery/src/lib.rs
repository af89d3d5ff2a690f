//! Scan for the two arms of a pair.
//!
//! Both arms advertise the same display service; the arm is recognised from
//! the advertised name, which carries an `_L_` or `_R_` marker
//! (e.g. `G1_42_L_7A21` / `G1_42_R_7A21`).
//!
//! The first peripheral seen for each side is kept. Scanning stops on its
//! own once both sides are known; after a failure it stays stopped until
//! [`Scanner::start_scan`] is called again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lenslink_core::{Arm, PeripheralInfo, SERVICE_UUID};
use lenslink_transport::{Advertisement, Central, ScanEvent};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tells which arm an advertised name belongs to. Names carrying both
/// markers, or neither, are not arms.
pub fn classify(name: &str) -> Option<Arm> {
    let upper = name.to_ascii_uppercase();
    match (upper.contains("_L_"), upper.contains("_R_")) {
        (true, false) => Some(Arm::Left),
        (false, true) => Some(Arm::Right),
        _ => None,
    }
}

// MARK: - ScanState

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanState {
    pub scanning: bool,
    pub left: Option<PeripheralInfo>,
    pub right: Option<PeripheralInfo>,
    /// Reason of the last scan failure, cleared by the next scan.
    pub error: Option<String>,
}

impl ScanState {
    pub fn both_found(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    /// `(left, right)` once both are known.
    pub fn pair(&self) -> Option<(PeripheralInfo, PeripheralInfo)> {
        match (&self.left, &self.right) {
            (Some(l), Some(r)) => Some((l.clone(), r.clone())),
            _ => None,
        }
    }

    /// Records `peripheral` for `arm` unless that side is already taken.
    fn record(&mut self, arm: Arm, peripheral: PeripheralInfo) -> bool {
        let slot = match arm {
            Arm::Left => &mut self.left,
            Arm::Right => &mut self.right,
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(peripheral);
        true
    }
}

// MARK: - Scanner

pub struct Scanner {
    central: Arc<dyn Central>,
    service: Uuid,
    state_tx: watch::Sender<ScanState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scanner {
    pub fn new(central: Arc<dyn Central>) -> Self {
        Self::with_service(central, SERVICE_UUID)
    }

    pub fn with_service(central: Arc<dyn Central>, service: Uuid) -> Self {
        let (state_tx, _) = watch::channel(ScanState::default());
        Self {
            central,
            service,
            state_tx,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> watch::Receiver<ScanState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> ScanState {
        self.state_tx.borrow().clone()
    }

    /// Starts a fresh scan. Arms found by a previous scan are forgotten.
    /// A no-op while a scan is already running.
    pub async fn start_scan(&self) -> Result<(), DiscoveryError> {
        if self.state_tx.borrow().scanning {
            debug!("[Scan] already scanning");
            return Ok(());
        }
        self.abort_task();

        // Subscribe first so no advertisement slips between start and listen.
        let events = self.central.scan_events();
        self.state_tx.send_replace(ScanState {
            scanning: true,
            ..ScanState::default()
        });

        if let Err(e) = self.central.start_scan(self.service).await {
            warn!("[Scan] could not start: {}", e);
            self.state_tx.send_modify(|s| {
                s.scanning = false;
                s.error = Some(e.to_string());
            });
            return Err(DiscoveryError::ScanFailed(e.to_string()));
        }
        info!("[Scan] scanning for service {}", self.service);

        let handle = tokio::spawn(run_scan(
            Arc::clone(&self.central),
            self.service,
            events,
            self.state_tx.clone(),
        ));
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    /// Stops scanning, keeping whatever was found.
    pub async fn stop_scan(&self) {
        self.abort_task();
        let was_scanning = self.state_tx.borrow().scanning;
        if was_scanning {
            if let Err(e) = self.central.stop_scan().await {
                warn!("[Scan] stop failed: {}", e);
            }
            self.state_tx.send_modify(|s| s.scanning = false);
            info!("[Scan] stopped");
        }
    }

    /// Stops scanning and forgets found arms and errors.
    pub async fn reset(&self) {
        self.stop_scan().await;
        self.state_tx.send_replace(ScanState::default());
    }

    /// Waits until both arms are known. Fails if the scan fails or stops
    /// first, or on timeout.
    pub async fn wait_for_pair(
        &self,
        timeout: Duration,
    ) -> Result<(PeripheralInfo, PeripheralInfo), DiscoveryError> {
        let mut rx = self.state_tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.both_found() || !s.scanning),
        )
        .await;

        let state = match waited {
            Err(_) => return Err(DiscoveryError::Timeout(timeout)),
            Ok(Err(_)) => return Err(DiscoveryError::ScanFailed("scanner dropped".to_owned())),
            Ok(Ok(state)) => state.clone(),
        };
        if let Some(pair) = state.pair() {
            return Ok(pair);
        }
        Err(DiscoveryError::ScanFailed(
            state.error.unwrap_or_else(|| "scan stopped".to_owned()),
        ))
    }

    fn abort_task(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.abort_task();
    }
}

async fn run_scan(
    central: Arc<dyn Central>,
    service: Uuid,
    mut events: broadcast::Receiver<ScanEvent>,
    state_tx: watch::Sender<ScanState>,
) {
    loop {
        match events.recv().await {
            Ok(ScanEvent::Advertisement(adv)) => {
                if on_advertisement(&adv, service, &state_tx) {
                    if let Err(e) = central.stop_scan().await {
                        warn!("[Scan] stop failed: {}", e);
                    }
                    state_tx.send_modify(|s| s.scanning = false);
                    info!("[Scan] both arms found — scan stopped");
                    return;
                }
            }
            Ok(ScanEvent::Failed { reason }) => {
                warn!("[Scan] failed: {}", reason);
                state_tx.send_modify(|s| {
                    s.scanning = false;
                    s.error = Some(reason);
                });
                return;
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("[Scan] dropped {} advertisements", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                state_tx.send_modify(|s| s.scanning = false);
                return;
            }
        }
    }
}

/// Returns true once both arms are known.
fn on_advertisement(adv: &Advertisement, service: Uuid, state_tx: &watch::Sender<ScanState>) -> bool {
    if !adv.services.contains(&service) {
        return false;
    }
    let Some(arm) = classify(&adv.peripheral.name) else {
        debug!("[Scan] ignoring '{}'", adv.peripheral.name);
        return false;
    };

    let mut both = false;
    state_tx.send_if_modified(|s| {
        let added = s.record(arm, adv.peripheral.clone());
        if added {
            info!(
                "[Scan] found {} arm '{}' ({}, rssi={:?})",
                arm, adv.peripheral.name, adv.peripheral.id, adv.rssi
            );
        }
        both = s.both_found();
        added
    });
    both
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// MARK: - DiscoveryError

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Arm pair not found within {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;
    use lenslink_transport::sim::SimCentral;

    fn scanner(central: &SimCentral) -> Scanner {
        Scanner::new(Arc::new(central.clone()))
    }

    #[test]
    fn names_are_classified_case_insensitively() {
        assert_eq!(classify("G1_42_L_7A21"), Some(Arm::Left));
        assert_eq!(classify("g1_42_r_7a21"), Some(Arm::Right));
        assert_eq!(classify("G1_L_R_"), None);
        assert_eq!(classify("Headphones"), None);
        assert_eq!(classify("LEFT"), None);
    }

    #[tokio::test]
    async fn pair_found_stops_scan() {
        let central = SimCentral::new();
        let left = central.add_arm("G1_42_L_");
        let right = central.add_arm("G1_42_R_");
        let scanner = scanner(&central);

        scanner.start_scan().await.unwrap();
        assert!(central.is_scanning());
        assert!(central.advertise(&left));
        assert!(central.advertise(&right));

        let (l, r) = scanner.wait_for_pair(Duration::from_secs(1)).await.unwrap();
        assert_eq!(l, left.info());
        assert_eq!(r, right.info());

        let mut state = scanner.state();
        let state = state.wait_for(|s| !s.scanning).await.unwrap().clone();
        assert!(state.both_found());
        assert!(!central.is_scanning());
    }

    #[tokio::test]
    async fn first_match_per_side_is_kept() {
        let central = SimCentral::new();
        let first = central.add_arm("G1_1_L_");
        let second = central.add_arm("G1_2_L_");
        let ambiguous = central.add_arm("G1_L_R_");
        let right = central.add_arm("G1_1_R_");
        let scanner = scanner(&central);

        scanner.start_scan().await.unwrap();
        central.advertise(&first);
        central.advertise(&second);
        central.advertise(&ambiguous);
        central.advertise(&right);

        let (l, r) = scanner.wait_for_pair(Duration::from_secs(1)).await.unwrap();
        assert_eq!(l, first.info());
        assert_eq!(r, right.info());
    }

    #[tokio::test]
    async fn one_side_keeps_scanning() {
        let central = SimCentral::new();
        let left = central.add_arm("G1_1_L_");
        let scanner = scanner(&central);

        scanner.start_scan().await.unwrap();
        central.advertise(&left);
        let mut state = scanner.state();
        let state = state.wait_for(|s| s.left.is_some()).await.unwrap().clone();

        assert!(state.scanning);
        assert!(state.right.is_none());
        assert!(central.is_scanning());
    }

    #[tokio::test]
    async fn scan_failure_is_published() {
        let central = SimCentral::new();
        let scanner = scanner(&central);

        scanner.start_scan().await.unwrap();
        central.fail_scan("adapter powered off");

        let err = scanner.wait_for_pair(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::ScanFailed(ref r) if r == "adapter powered off"));
        let state = scanner.snapshot();
        assert!(!state.scanning);
        assert_eq!(state.error.as_deref(), Some("adapter powered off"));

        // Restart clears the error.
        scanner.start_scan().await.unwrap();
        assert_eq!(scanner.snapshot().error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_pair_times_out() {
        let central = SimCentral::new();
        let scanner = scanner(&central);
        scanner.start_scan().await.unwrap();

        let err = scanner.wait_for_pair(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Timeout(_)));
        assert!(scanner.snapshot().scanning);
    }

    #[tokio::test]
    async fn stop_keeps_findings_and_reset_clears_them() {
        let central = SimCentral::new();
        let left = central.add_arm("G1_1_L_");
        let scanner = scanner(&central);

        scanner.start_scan().await.unwrap();
        central.advertise(&left);
        scanner.state().wait_for(|s| s.left.is_some()).await.unwrap();

        scanner.stop_scan().await;
        assert!(!central.is_scanning());
        let state = scanner.snapshot();
        assert!(!state.scanning);
        assert_eq!(state.left, Some(left.info()));

        scanner.reset().await;
        assert_eq!(scanner.snapshot(), ScanState::default());
    }
}
