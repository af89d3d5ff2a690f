//! LensLink demo: drives a pair of simulated smart-glasses arms.
//!
//! ```text
//! GlassesSession ── Scanner ──► SimCentral (advertisements)
//!       │
//!       ▼
//! Orchestrator ──► Link[L] ──► left arm   (written first)
//!              └─► Link[R] ──► right arm  (after the left acknowledged)
//! ```
//!
//! Set `RUST_LOG=debug` to see every packet and acknowledgment.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    // ── Session ───────────────────────────────────────────────────────────
    info!("LensLink v{} — starting simulated session...", env!("CARGO_PKG_VERSION"));

    if let Err(e) = app::run().await {
        error!("Session aborted: {:#}", e);
        return Err(e);
    }
    info!("Session finished, both arms released.");
    Ok(())
}
