//! Drives a pair of arms as one device.
//!
//! [`Orchestrator`] owns the two [`Link`](lenslink_link::Link)s and sends to
//! them in order (left first, right only once left acknowledged).
//! [`GlassesSession`] is the façade a presentation layer talks to: scanning,
//! connecting, paginated text, resync after a diverged send, and the
//! microphone switch.

pub mod orchestrator;
pub mod session;

pub use orchestrator::Orchestrator;
pub use session::{DisplayOutcome, DisplayedPage, GlassesSession, ResyncOutcome};

use std::time::Duration;

use lenslink_discovery::DiscoveryError;
use lenslink_link::LinkError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No left/right arm pair found")]
    NoPairFound,

    #[error("Glasses not connected")]
    NotConnected,

    #[error("Glasses not ready within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Nothing has been displayed yet")]
    NothingToResync,

    #[error("Page {index} out of range ({total} pages)")]
    PageOutOfRange { index: usize, total: usize },

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),
}
