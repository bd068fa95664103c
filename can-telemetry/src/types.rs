//! Core types for the CAN telemetry library
//!
//! This module defines the frame representation shared by every component
//! (transports, listeners, scheduler, store, decoder) and the error type all
//! of them report through.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;

/// Largest identifier representable in an 11-bit (standard) frame
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Largest identifier representable in a 29-bit (extended) frame
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;
/// Payload limit for classic CAN frames
pub const CAN_MAX_DLEN: usize = 8;
/// Payload limit for CAN-FD frames
pub const CANFD_MAX_DLEN: usize = 64;

/// Transport-assigned channel identifier
///
/// Opaque to this library: some transports number their channels, others
/// name them ("vcan0", "PCAN_USBBUS1").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Channel {
    Index(i64),
    Name(String),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Index(i) => write!(f, "{}", i),
            Channel::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for Channel {
    fn from(name: &str) -> Self {
        Channel::Name(name.to_string())
    }
}

impl From<i64> for Channel {
    fn from(index: i64) -> Self {
        Channel::Index(index)
    }
}

/// One CAN bus event
///
/// `timestamp` is floating-point seconds. Frames received from a transport
/// carry epoch seconds; replayed frames carry their desired delivery time.
///
/// On input only `arbitration_id` is required: a missing `timestamp` is 0 and
/// a missing `dlc` is taken from the payload length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "FrameRecord")]
pub struct Frame {
    pub timestamp: f64,
    pub arbitration_id: u32,
    pub is_extended_id: bool,
    pub channel: Option<Channel>,
    pub dlc: u8,
    /// Raw payload bytes (empty for remote frames)
    pub data: Vec<u8>,
    pub is_error_frame: bool,
    pub is_remote_frame: bool,
    pub is_fd: bool,
    pub bitrate_switch: bool,
    pub error_state_indicator: bool,
}

/// Lenient input shape of [`Frame`]
#[derive(Deserialize)]
struct FrameRecord {
    #[serde(default)]
    timestamp: f64,
    arbitration_id: u32,
    #[serde(default)]
    is_extended_id: bool,
    #[serde(default)]
    channel: Option<Channel>,
    #[serde(default)]
    dlc: Option<u8>,
    #[serde(default)]
    data: Option<Vec<u8>>,
    #[serde(default)]
    is_error_frame: bool,
    #[serde(default)]
    is_remote_frame: bool,
    #[serde(default)]
    is_fd: bool,
    #[serde(default)]
    bitrate_switch: bool,
    #[serde(default)]
    error_state_indicator: bool,
}

impl From<FrameRecord> for Frame {
    fn from(record: FrameRecord) -> Self {
        let data = record.data.unwrap_or_default();
        let dlc = record
            .dlc
            .unwrap_or_else(|| data.len().min(u8::MAX as usize) as u8);
        Self {
            timestamp: record.timestamp,
            arbitration_id: record.arbitration_id,
            is_extended_id: record.is_extended_id,
            channel: record.channel,
            dlc,
            data,
            is_error_frame: record.is_error_frame,
            is_remote_frame: record.is_remote_frame,
            is_fd: record.is_fd,
            bitrate_switch: record.bitrate_switch,
            error_state_indicator: record.error_state_indicator,
        }
    }
}

impl Frame {
    /// Create a standard (11-bit) data frame; the DLC follows the payload length
    pub fn new(arbitration_id: u32, data: &[u8]) -> Self {
        Self {
            timestamp: 0.0,
            arbitration_id,
            is_extended_id: false,
            channel: None,
            dlc: data.len().min(u8::MAX as usize) as u8,
            data: data.to_vec(),
            is_error_frame: false,
            is_remote_frame: false,
            is_fd: false,
            bitrate_switch: false,
            error_state_indicator: false,
        }
    }

    /// Create an extended (29-bit) data frame
    pub fn new_extended(arbitration_id: u32, data: &[u8]) -> Self {
        Self {
            is_extended_id: true,
            ..Self::new(arbitration_id, data)
        }
    }

    /// Create a CAN-FD data frame
    pub fn new_fd(arbitration_id: u32, data: &[u8], bitrate_switch: bool) -> Self {
        Self {
            is_fd: true,
            bitrate_switch,
            ..Self::new(arbitration_id, data)
        }
    }

    /// Create a remote transmission request for `dlc` bytes
    pub fn remote(arbitration_id: u32, dlc: u8) -> Self {
        Self {
            dlc,
            data: Vec::new(),
            is_remote_frame: true,
            ..Self::new(arbitration_id, &[])
        }
    }

    /// Create an error frame
    pub fn error(arbitration_id: u32, data: &[u8]) -> Self {
        Self {
            is_error_frame: true,
            ..Self::new(arbitration_id, data)
        }
    }

    /// Builder method: set the timestamp in seconds
    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Builder method: set the channel
    pub fn with_channel(mut self, channel: impl Into<Channel>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Payload limit implied by the frame kind
    pub fn max_data_len(&self) -> usize {
        if self.is_fd {
            CANFD_MAX_DLEN
        } else {
            CAN_MAX_DLEN
        }
    }

    /// Check the frame against the CAN framing rules
    pub fn validate(&self) -> Result<()> {
        if !self.timestamp.is_finite() {
            return Err(TelemetryError::InvalidFrame(format!(
                "timestamp {} is not a finite number of seconds",
                self.timestamp
            )));
        }

        let id_limit = if self.is_extended_id {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        if self.arbitration_id > id_limit {
            return Err(TelemetryError::InvalidFrame(format!(
                "arbitration id 0x{:X} exceeds {} range",
                self.arbitration_id,
                if self.is_extended_id { "29-bit" } else { "11-bit" }
            )));
        }

        let limit = self.max_data_len();
        if self.dlc as usize > limit {
            return Err(TelemetryError::InvalidFrame(format!(
                "dlc {} exceeds frame limit of {} bytes",
                self.dlc, limit
            )));
        }
        if self.data.len() > limit {
            return Err(TelemetryError::InvalidFrame(format!(
                "{} data bytes exceed frame limit of {} bytes",
                self.data.len(),
                limit
            )));
        }

        if self.is_remote_frame {
            if self.is_fd {
                return Err(TelemetryError::InvalidFrame(
                    "CAN-FD frames cannot be remote frames".to_string(),
                ));
            }
            if !self.data.is_empty() {
                return Err(TelemetryError::InvalidFrame(
                    "remote frames carry no data".to_string(),
                ));
            }
        } else if self.data.len() != self.dlc as usize {
            return Err(TelemetryError::InvalidFrame(format!(
                "dlc {} does not match {} data bytes",
                self.dlc,
                self.data.len()
            )));
        }

        if !self.is_fd && (self.bitrate_switch || self.error_state_indicator) {
            return Err(TelemetryError::InvalidFrame(
                "bitrate_switch/error_state_indicator require a CAN-FD frame".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp: {:>15.6}    ", self.timestamp)?;
        if self.is_extended_id {
            write!(f, "ID: {:08x}    X ", self.arbitration_id)?;
        } else {
            write!(f, "ID: {:04x}    S ", self.arbitration_id)?;
        }
        write!(
            f,
            "{}{}{}",
            if self.is_error_frame { "E" } else { "-" },
            if self.is_remote_frame { "R" } else { "-" },
            if self.is_fd { "F" } else { "-" },
        )?;
        write!(f, "    DL: {:2}", self.dlc)?;
        if !self.data.is_empty() {
            let bytes: Vec<String> = self.data.iter().map(|b| hex::encode([*b])).collect();
            write!(f, "    {}", bytes.join(" "))?;
        }
        if let Some(channel) = &self.channel {
            write!(f, "    Channel: {}", channel)?;
        }
        Ok(())
    }
}

/// Current wall-clock time as floating-point epoch seconds
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Lifecycle of a bus connection or manager
///
/// Transitions only forward: `Disconnected -> Connected -> Closed`. A closed
/// instance cannot be restarted; construct a new one instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Disconnected,
    Connected,
    Closed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Disconnected => write!(f, "Disconnected"),
            LifecycleState::Connected => write!(f, "Connected"),
            LifecycleState::Closed => write!(f, "Closed"),
        }
    }
}

/// Errors reported by the telemetry library
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Failed to open transport {transport}: {reason}")]
    TransportInit { transport: String, reason: String },

    #[error("Transport {transport} lost: {reason}")]
    TransportLost { transport: String, reason: String },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Listener {listener} faulted: {message}")]
    ListenerFault { listener: String, message: String },

    #[error("Failed to parse DBC file: {0}")]
    DbcParse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for TelemetryError {
    fn from(e: rusqlite::Error) -> Self {
        TelemetryError::Query(e.to_string())
    }
}

/// Signal decoding failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("Message not found: CAN ID 0x{0:X}")]
    UnknownMessage(u32),

    #[error("Message {name} (0x{id:X}) expects {expected} bytes, got {actual}")]
    LengthMismatch {
        id: u32,
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Signal value types produced by the decoder
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    /// Signed integer value
    Integer(i64),
    /// Floating-point value (after scaling/offset)
    Float(f64),
    /// Boolean value (single unscaled bit)
    Boolean(bool),
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Integer(v) => write!(f, "{}", v),
            SignalValue::Float(v) => write!(f, "{:.3}", v),
            SignalValue::Boolean(v) => write!(f, "{}", if *v { "true" } else { "false" }),
        }
    }
}

impl SignalValue {
    /// Convert signal value to f64 (for plotting and comparisons)
    pub fn as_f64(&self) -> f64 {
        match self {
            SignalValue::Integer(v) => *v as f64,
            SignalValue::Float(v) => *v,
            SignalValue::Boolean(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// A decoded signal with its physical value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedSignal {
    /// Signal name from the DBC
    pub name: String,
    /// Physical value
    pub value: SignalValue,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Label from the signal's value table, if the raw value has one
    pub value_description: Option<String>,
    /// Raw value before scaling
    pub raw_value: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_constructors() {
        let frame = Frame::new(0x123, &[1, 2, 3]);
        assert_eq!(frame.dlc, 3);
        assert!(!frame.is_extended_id);
        assert!(frame.validate().is_ok());

        let remote = Frame::remote(0x123, 4);
        assert_eq!(remote.dlc, 4);
        assert!(remote.data.is_empty());
        assert!(remote.validate().is_ok());

        let ext = Frame::new_extended(0x18FF_50E5, &[0; 8]);
        assert!(ext.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_ids() {
        assert!(Frame::new(0x800, &[]).validate().is_err());
        assert!(Frame::new_extended(0x2000_0000, &[]).validate().is_err());
        assert!(Frame::new_extended(0x800, &[]).validate().is_ok());
    }

    #[test]
    fn test_validate_payload_limits() {
        assert!(Frame::new(0x100, &[0; 9]).validate().is_err());
        assert!(Frame::new_fd(0x100, &[0; 64], true).validate().is_ok());
        assert!(Frame::new_fd(0x100, &[0; 65], false).validate().is_err());

        let mut frame = Frame::new(0x100, &[1, 2]);
        frame.dlc = 5;
        assert!(frame.validate().is_err());

        let mut remote = Frame::remote(0x100, 2);
        remote.data = vec![1];
        assert!(remote.validate().is_err());

        let mut brs = Frame::new(0x100, &[1]);
        brs.bitrate_switch = true;
        assert!(brs.validate().is_err());
    }

    #[test]
    fn test_frame_json_field_names() {
        let frame = Frame::new(0x123, &[0xDE, 0xAD])
            .with_timestamp(1.5)
            .with_channel("vcan0");
        let json = serde_json::to_value(&frame).unwrap();

        assert_eq!(json["arbitration_id"], 0x123);
        assert_eq!(json["data"], serde_json::json!([222, 173]));
        assert_eq!(json["channel"], "vcan0");
        assert_eq!(json["is_extended_id"], false);
        assert_eq!(json["bitrate_switch"], false);
    }

    #[test]
    fn test_frame_json_null_data_is_empty() {
        let json = r#"{"timestamp": 0.0, "arbitration_id": 1, "dlc": 2,
                       "data": null, "is_remote_frame": true}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert!(frame.data.is_empty());
        assert!(frame.is_remote_frame);
        assert_eq!(frame.channel, None);
    }

    #[test]
    fn test_frame_json_minimal_input() {
        let json = r#"{"arbitration_id": 256, "data": [1, 2, 3]}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.timestamp, 0.0);
        assert_eq!(frame.dlc, 3);
        assert!(frame.validate().is_ok());

        let remote = r#"{"arbitration_id": 1, "dlc": 4, "is_remote_frame": true}"#;
        let frame: Frame = serde_json::from_str(remote).unwrap();
        assert_eq!(frame.dlc, 4);
        assert!(frame.data.is_empty());

        assert!(serde_json::from_str::<Frame>(r#"{"dlc": 0}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_timestamp() {
        assert!(Frame::new(0x1, &[]).with_timestamp(f64::NAN).validate().is_err());
        assert!(Frame::new(0x1, &[]).with_timestamp(f64::INFINITY).validate().is_err());
        assert!(Frame::new(0x1, &[]).with_timestamp(1.0e19).validate().is_ok());
    }

    #[test]
    fn test_frame_display() {
        let frame = Frame::new(0x1A, &[0x01, 0xFF]).with_timestamp(2.0);
        let text = frame.to_string();
        assert!(text.contains("ID: 001a"));
        assert!(text.contains("01 ff"));
    }

    #[test]
    fn test_signal_value_display() {
        assert_eq!(format!("{}", SignalValue::Integer(42)), "42");
        assert_eq!(format!("{}", SignalValue::Float(1.23456)), "1.235");
        assert_eq!(format!("{}", SignalValue::Boolean(true)), "true");
        assert_eq!(SignalValue::Boolean(true).as_f64(), 1.0);
    }
}
