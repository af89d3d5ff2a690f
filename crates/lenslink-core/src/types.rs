use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// MARK: - GATT identifiers

/// UART-style service advertised by both arms.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic the host writes command packets to.
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Characteristic the arms notify on (acknowledgments and inbound data).
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

// MARK: - Arm

/// One of the two independent peripheral endpoints of a paired device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arm {
    Left,
    Right,
}

impl Arm {
    pub fn other(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }

    /// Single-letter tag used in log prefixes.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Left => "L",
            Self::Right => "R",
        }
    }
}

impl std::fmt::Display for Arm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

// MARK: - PeripheralInfo

/// Transport-level identifier of a discovered peripheral (MAC address,
/// platform handle or simulator id, depending on the backend).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(pub String);

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralInfo {
    pub id: PeripheralId,
    pub name: String,
}

impl PeripheralInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: PeripheralId(id.into()),
            name: name.into(),
        }
    }
}

// MARK: - LinkState

/// Lifecycle of a single arm's connection. Owned by its link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Error { reason: String },
}

impl LinkState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// True once a low-level connection exists (handshake may be pending).
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }

    /// True for states a link never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error { .. })
    }
}

// MARK: - DualConnectionState

/// Connection state of the pair, always derived from both link states.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DualConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Error { reason: String },
}

impl DualConnectionState {
    /// An error on either arm wins; otherwise the pair is only as ready as
    /// its least ready arm, and "connected" as soon as either arm is.
    ///
    /// Precedence: `Error` > both `Ready` → `Ready` > either `Connected` or
    /// `Ready` → `Connected` > either `Connecting` → `Connecting` >
    /// `Disconnected`. So `(Connecting, Disconnected)` is `Connecting`.
    pub fn from_pair(left: &LinkState, right: &LinkState) -> Self {
        match (left, right) {
            (LinkState::Error { reason }, _) => Self::Error {
                reason: format!("left: {reason}"),
            },
            (_, LinkState::Error { reason }) => Self::Error {
                reason: format!("right: {reason}"),
            },
            (LinkState::Ready, LinkState::Ready) => Self::Ready,
            (l, r) if l.is_connected() || r.is_connected() => Self::Connected,
            (LinkState::Connecting, _) | (_, LinkState::Connecting) => Self::Connecting,
            _ => Self::Disconnected,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

// MARK: - GlassesState

/// UI-facing state of the paired device.
///
/// `OutOfSync` and `Error` are kept distinct so the presentation layer can
/// offer a resync for the former and a reconnect for the latter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GlassesState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Ready,
    OutOfSync,
    Error { reason: String },
}

impl GlassesState {
    pub fn label(&self) -> &str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Scanning => "Scanning…",
            Self::Connecting => "Connecting…",
            Self::Connected => "Connected",
            Self::Ready => "Ready",
            Self::OutOfSync => "Out of sync",
            Self::Error { .. } => "Error",
        }
    }
}

impl From<&DualConnectionState> for GlassesState {
    fn from(state: &DualConnectionState) -> Self {
        match state {
            DualConnectionState::Disconnected => Self::Disconnected,
            DualConnectionState::Connecting => Self::Connecting,
            DualConnectionState::Connected => Self::Connected,
            DualConnectionState::Ready => Self::Ready,
            DualConnectionState::Error { reason } => Self::Error {
                reason: reason.clone(),
            },
        }
    }
}

// MARK: - InboundData

/// A non-acknowledgment notification received from one arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundData {
    pub arm: Arm,
    pub data: Bytes,
}

// MARK: - TextChunk

/// Incremental text produced by an upstream generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub text: String,
    pub done: bool,
}

impl TextChunk {
    pub fn partial(text: impl Into<String>) -> Self {
        Self { text: text.into(), done: false }
    }

    pub fn last(text: impl Into<String>) -> Self {
        Self { text: text.into(), done: true }
    }
}
