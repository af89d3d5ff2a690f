use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::{MAX_TEXT_PAYLOAD, TEXT_HEADER_LEN};
use crate::errors::ConfigError;
use crate::types::Arm;

/// Display geometry of one lens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Usable line width in font units.
    pub width: f32,
    #[serde(alias = "fontSize")]
    pub font_size: f32,
    #[serde(alias = "linesPerPage")]
    pub lines_per_page: usize,
    /// Lines carried by the first sub-packet of a page; the rest go in the second.
    #[serde(alias = "firstPacketLines")]
    pub first_packet_lines: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: 488.0,
            font_size: 21.0,
            lines_per_page: 5,
            first_packet_lines: 3,
        }
    }
}

/// Timing and sizing of the dual-arm protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    #[serde(alias = "heartbeatIntervalMs")]
    pub heartbeat_interval_ms: u64,
    #[serde(alias = "maxWriteAttempts")]
    pub max_write_attempts: u32,
    /// How long one write attempt waits for completion or acknowledgment.
    #[serde(alias = "writeTimeoutMs")]
    pub write_timeout_ms: u64,
    #[serde(alias = "retryDelayMs")]
    pub retry_delay_ms: u64,
    #[serde(alias = "interArmDelayMs")]
    pub inter_arm_delay_ms: u64,
    #[serde(alias = "interPacketGapMs")]
    pub inter_packet_gap_ms: u64,
    /// Pause between enabling notifications and sending the handshake.
    #[serde(alias = "handshakeSettleMs")]
    pub handshake_settle_ms: u64,
    /// How long a connect waits for both arms to become ready.
    #[serde(alias = "connectTimeoutMs")]
    pub connect_timeout_ms: u64,
    /// How long a scan-and-connect waits for both arms to be found.
    #[serde(alias = "scanTimeoutMs")]
    pub scan_timeout_ms: u64,
    #[serde(alias = "targetMtu")]
    pub target_mtu: u16,
    #[serde(alias = "payloadLimit")]
    pub payload_limit: usize,
    /// Arm that receives microphone commands.
    #[serde(alias = "micArm")]
    pub mic_arm: Arm,
    pub display: DisplayConfig,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 8_000,
            max_write_attempts: 10,
            write_timeout_ms: 1_000,
            retry_delay_ms: 100,
            inter_arm_delay_ms: 20,
            inter_packet_gap_ms: 50,
            handshake_settle_ms: 300,
            connect_timeout_ms: 15_000,
            scan_timeout_ms: 30_000,
            target_mtu: 251,
            payload_limit: MAX_TEXT_PAYLOAD,
            mic_arm: Arm::Right,
            display: DisplayConfig::default(),
        }
    }
}

impl ProtocolConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| Err(ConfigError::Invalid { reason: reason.to_owned() });

        if self.max_write_attempts == 0 {
            return invalid("max_write_attempts must be at least 1");
        }
        if self.heartbeat_interval_ms == 0 {
            return invalid("heartbeat_interval_ms must be positive");
        }
        if self.write_timeout_ms == 0 {
            return invalid("write_timeout_ms must be positive");
        }
        if self.payload_limit == 0 || self.payload_limit > MAX_TEXT_PAYLOAD {
            return invalid("payload_limit must be between 1 and 191 bytes");
        }
        if TEXT_HEADER_LEN + self.payload_limit > self.target_mtu as usize {
            return invalid("target_mtu cannot carry a full text packet");
        }
        if self.display.width <= 0.0 || self.display.font_size <= 0.0 {
            return invalid("display width and font size must be positive");
        }
        if self.display.first_packet_lines == 0
            || self.display.first_packet_lines > self.display.lines_per_page
        {
            return invalid("first_packet_lines must be within 1..=lines_per_page");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn inter_arm_delay(&self) -> Duration {
        Duration::from_millis(self.inter_arm_delay_ms)
    }

    pub fn inter_packet_gap(&self) -> Duration {
        Duration::from_millis(self.inter_packet_gap_ms)
    }

    pub fn handshake_settle(&self) -> Duration {
        Duration::from_millis(self.handshake_settle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}
