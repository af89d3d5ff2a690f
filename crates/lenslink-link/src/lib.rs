//! Connection lifecycle of a single arm.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► MTU ─► discover ─► subscribe
//!                                                                  │
//!      Disconnected / Error(reason) ◄── any failure      settle ─► handshake
//!                                                                  │
//!                                     heartbeat every 8 s ◄──── Ready
//! ```
//!
//! Every link runs three tasks: a driver owning the state machine, an event
//! pump turning transport callbacks into acknowledgments / inbound data /
//! driver events, and a heartbeat while ready.

mod heartbeat;
mod link;
mod writer;

pub use link::Link;

use lenslink_core::TransportError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Display service not exposed by {peripheral}")]
    ServiceMissing { peripheral: String },

    #[error("Handshake not acknowledged")]
    HandshakeFailed,

    #[error("Link torn down")]
    TornDown,

    #[error("Link failed: {reason}")]
    Failed { reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
