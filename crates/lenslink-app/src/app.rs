use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use lenslink_core::{GlassesState, ProtocolConfig, TextChunk};
use lenslink_session::{DisplayOutcome, GlassesSession, ResyncOutcome};
use lenslink_transport::sim::{AckBehavior, SimCentral};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Demo session against two simulated arms.
///
/// # Configuration
/// - `LENSLINK_CONFIG` — optional path to a JSON protocol config
///   (camelCase or snake_case keys, missing keys keep their defaults)
/// - `LENSLINK_SCAN_TIMEOUT_SECS` — overrides the scan timeout
///
/// # Flow
/// 1. Scan until both arms are found, then connect and handshake
/// 2. Show a multi-page text, then stream a generated answer
/// 3. Make the left arm reject writes → out of sync → resync
/// 4. Toggle the microphone and disconnect
pub async fn run() -> Result<()> {
    let config = load_config()?;
    info!(
        "Protocol: heartbeat={}ms attempts={} mtu={} payload={}",
        config.heartbeat_interval_ms, config.max_write_attempts, config.target_mtu, config.payload_limit
    );

    // ── Simulated radio ─────────────────────────────────────────────────────
    let central = SimCentral::new();
    let left = central.add_arm("G1_DEMO_L_0A1B");
    let right = central.add_arm("G1_DEMO_R_0A1B");
    let noise = central.add_arm("Headphones");

    let session = GlassesSession::new(Arc::new(central.clone()), config);
    let _state_log = tokio::spawn(log_states(session.clone()));

    // ── Scan + connect ──────────────────────────────────────────────────────
    session.start_scan().await.context("starting scan")?;
    let radio = {
        let central = central.clone();
        let arms = [noise, left.clone(), right.clone()];
        tokio::spawn(async move {
            while central.is_scanning() {
                for arm in &arms {
                    central.advertise(arm);
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        })
    };
    session.connect().await.context("connecting to glasses")?;
    radio.abort();

    // ── Paged text ──────────────────────────────────────────────────────────
    let text = "LensLink renders text on both lenses of a pair of smart glasses. \
                Every page is split into two packets and each packet goes to the \
                left arm first, then to the right arm once the left one confirmed it.\n\n\
                Long answers are wrapped to the display width and cut into pages of \
                five lines; the newest page is shown.";
    report("paged text", session.display_text(text, Duration::ZERO).await?);
    let total = session.current_page().borrow().as_ref().map_or(0, |p| p.total);
    for index in 0..total {
        report("manual page", session.show_page(index).await?);
    }

    // ── Streamed answer ─────────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel(16);
    let producer = tokio::spawn(async move {
        let words = ["The", " weather", " in", " Lisbon", " is", " sunny,", " 24", " degrees."];
        for word in words {
            if tx.send(TextChunk::partial(word)).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        let _ = tx.send(TextChunk::last("")).await;
    });
    let answer = session.run_text_stream(rx).await?;
    let _ = producer.await;
    info!("Streamed answer: {:?}", answer);

    // ── Divergence and recovery ─────────────────────────────────────────────
    left.set_behavior(AckBehavior::NakByte);
    report("while left rejects", session.display_text("Out of step?", Duration::ZERO).await?);

    left.set_behavior(AckBehavior::AckByte);
    match session.resync().await? {
        ResyncOutcome::Resynced => info!("Resync restored both lenses"),
        ResyncOutcome::ReconnectRequired => {
            warn!("Resync failed — reconnecting");
            session.reconnect().await.context("reconnecting")?;
        }
    }

    // ── Microphone ──────────────────────────────────────────────────────────
    session.set_mic_enabled(true).await?;
    session.set_mic_enabled(false).await?;

    session.disconnect().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

/// Default config, optionally replaced by `LENSLINK_CONFIG` and adjusted by
/// environment overrides.
fn load_config() -> Result<ProtocolConfig> {
    let mut config = match std::env::var("LENSLINK_CONFIG") {
        Ok(path) => {
            info!("Loading protocol config from {}", path);
            ProtocolConfig::from_file(&path).with_context(|| format!("loading {path}"))?
        }
        Err(_) => ProtocolConfig::default(),
    };

    if let Some(secs) = std::env::var("LENSLINK_SCAN_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
    {
        config.scan_timeout_ms = secs.max(1) * 1_000;
    }
    config.validate().context("invalid protocol config")?;
    Ok(config)
}

fn report(what: &str, outcome: DisplayOutcome) {
    match outcome {
        DisplayOutcome::Shown => info!("{}: shown", what),
        DisplayOutcome::NotDelivered => warn!("{}: not delivered to both arms", what),
        other => info!("{}: {:?}", what, other),
    }
}

async fn log_states(session: GlassesSession) {
    let mut states = session.glasses_state();
    loop {
        let state = states.borrow_and_update().clone();
        match &state {
            GlassesState::Error { reason } => warn!("Glasses: {} ({})", state.label(), reason),
            _ => info!("Glasses: {}", state.label()),
        }
        if states.changed().await.is_err() {
            break;
        }
    }
}
