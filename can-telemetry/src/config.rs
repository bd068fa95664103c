//! Telemetry configuration snapshot
//!
//! [`TelemetryConfig`] is the JSON document an application is started from:
//! which DBC to decode with, which bus interface to open, transport filters,
//! where log output goes and, for the simulated interface, the frames to
//! replay.

use crate::transport::HardwareFilter;
use crate::types::{Frame, Result, TelemetryError};
use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Bus interface selected by a configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CanInterface {
    /// Replay `sim_messages` on a virtual bus
    Sim,
    /// In-process virtual bus
    Virtual,
    /// PEAK USB adapter (SocketCAN `peak_usb` driver)
    Peak,
}

/// Symbolic name of each interface, as written in configuration files
const INTERFACE_NAMES: [(CanInterface, &str); 3] = [
    (CanInterface::Sim, "SIM"),
    (CanInterface::Virtual, "VIRTUAL"),
    (CanInterface::Peak, "PEAK"),
];

impl CanInterface {
    pub fn name(self) -> &'static str {
        INTERFACE_NAMES
            .iter()
            .find(|(interface, _)| *interface == self)
            .map(|(_, name)| *name)
            .unwrap_or("UNKNOWN")
    }

    pub fn from_name(name: &str) -> Result<Self> {
        INTERFACE_NAMES
            .iter()
            .find(|(_, known)| *known == name)
            .map(|(interface, _)| *interface)
            .ok_or_else(|| {
                TelemetryError::Config(format!(
                    "unknown interface '{}' (expected one of {})",
                    name,
                    INTERFACE_NAMES
                        .iter()
                        .map(|(_, n)| *n)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

impl TryFrom<String> for CanInterface {
    type Error = TelemetryError;

    fn try_from(name: String) -> Result<Self> {
        Self::from_name(&name)
    }
}

impl From<CanInterface> for String {
    fn from(interface: CanInterface) -> Self {
        interface.name().to_string()
    }
}

impl fmt::Display for CanInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for CanInterface {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s)
    }
}

/// Configuration snapshot for a telemetry session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// DBC file used for decoding and filter derivation
    pub dbc_file_path: PathBuf,

    #[serde(default = "default_interface")]
    pub interface: CanInterface,

    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,

    #[serde(default)]
    pub hardware_filters: Vec<HardwareFilter>,

    /// Prefix for every output file; defaults to a local-time stamp
    #[serde(
        default = "default_base_log_file_path",
        deserialize_with = "deserialize_base_path"
    )]
    pub base_log_file_path: String,

    #[serde(default)]
    pub csv_logging: bool,

    #[serde(default)]
    pub ascii_logging: bool,

    /// Frames replayed by the `SIM` interface, in the given order
    #[serde(default)]
    pub sim_messages: Vec<Frame>,
}

fn default_interface() -> CanInterface {
    CanInterface::Virtual
}

fn default_bit_rate() -> u32 {
    500_000
}

fn default_base_log_file_path() -> String {
    format!("{}_log", Local::now().format("%Y-%m-%d %H-%M-%S"))
}

fn deserialize_base_path<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_base_log_file_path))
}

impl TelemetryConfig {
    /// Configuration with every optional field at its default
    pub fn new(dbc_file_path: impl Into<PathBuf>) -> Self {
        Self {
            dbc_file_path: dbc_file_path.into(),
            interface: default_interface(),
            bit_rate: default_bit_rate(),
            hardware_filters: Vec::new(),
            base_log_file_path: default_base_log_file_path(),
            csv_logging: false,
            ascii_logging: false,
            sim_messages: Vec::new(),
        }
    }

    /// Builder method: select the bus interface
    pub fn with_interface(mut self, interface: CanInterface) -> Self {
        self.interface = interface;
        self
    }

    /// Builder method: set the bit rate
    pub fn with_bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    /// Builder method: set transport acceptance filters
    pub fn with_hardware_filters(mut self, filters: Vec<HardwareFilter>) -> Self {
        self.hardware_filters = filters;
        self
    }

    /// Builder method: set the output file prefix
    pub fn with_base_log_file_path(mut self, base: impl Into<String>) -> Self {
        self.base_log_file_path = base.into();
        self
    }

    /// Builder method: enable or disable CSV logging
    pub fn with_csv_logging(mut self, enabled: bool) -> Self {
        self.csv_logging = enabled;
        self
    }

    /// Builder method: enable or disable candump-style ASCII logging
    pub fn with_ascii_logging(mut self, enabled: bool) -> Self {
        self.ascii_logging = enabled;
        self
    }

    /// Builder method: frames replayed by the `SIM` interface
    pub fn with_sim_messages(mut self, frames: Vec<Frame>) -> Self {
        self.sim_messages = frames;
        self
    }

    pub fn sqlite_log_file_path(&self) -> PathBuf {
        PathBuf::from(format!("{}_sqlite.db", self.base_log_file_path))
    }

    pub fn csv_log_file_path(&self) -> PathBuf {
        PathBuf::from(format!("{}_csv.csv", self.base_log_file_path))
    }

    pub fn ascii_log_file_path(&self) -> PathBuf {
        PathBuf::from(format!("{}_ascii.log", self.base_log_file_path))
    }

    /// Check every simulated frame against the CAN framing rules
    pub fn validate(&self) -> Result<()> {
        for (index, frame) in self.sim_messages.iter().enumerate() {
            frame.validate().map_err(|e| {
                TelemetryError::Config(format!("sim_messages[{}]: {}", index, e))
            })?;
        }
        if self.bit_rate == 0 {
            return Err(TelemetryError::Config("bit_rate must be positive".to_string()));
        }
        Ok(())
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self, pretty: bool) -> Result<String> {
        let json = if pretty {
            serde_json::to_string_pretty(self)?
        } else {
            serde_json::to_string(self)?
        };
        Ok(json)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration: {:?}", path);
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>, pretty: bool) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_json(pretty)?)?;
        log::info!("Configuration written to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Channel;
    use tempfile::TempDir;

    fn sample() -> TelemetryConfig {
        TelemetryConfig::new("battery.dbc")
            .with_interface(CanInterface::Sim)
            .with_bit_rate(250_000)
            .with_hardware_filters(vec![HardwareFilter::new(0x100, 0x7F0)])
            .with_base_log_file_path("out/session")
            .with_csv_logging(true)
            .with_ascii_logging(true)
            .with_sim_messages(vec![
                Frame::new(0x100, &[1, 2, 3]).with_timestamp(10.0),
                Frame::remote(0x101, 2).with_timestamp(11.0),
                Frame::new_extended(0x18FF_50E5, &[]).with_timestamp(12.0),
                Frame {
                    error_state_indicator: true,
                    ..Frame::new_fd(0x123, &[0xAA; 12], true)
                }
                .with_timestamp(1_700_000_000.123_456)
                .with_channel(3i64),
                Frame::error(0x080, &[0, 4, 0, 0])
                    .with_timestamp(13.5)
                    .with_channel("vcan0"),
            ])
    }

    #[test]
    fn test_json_round_trip() {
        let config = sample();
        for pretty in [false, true] {
            let json = config.to_json(pretty).unwrap();
            let loaded = TelemetryConfig::from_json(&json).unwrap();
            assert_eq!(loaded, config);

            assert_eq!(loaded.dbc_file_path, config.dbc_file_path);
            assert_eq!(loaded.interface, CanInterface::Sim);
            assert_eq!(loaded.bit_rate, 250_000);
            assert_eq!(loaded.hardware_filters, config.hardware_filters);
            assert_eq!(loaded.base_log_file_path, "out/session");
            assert!(loaded.csv_logging && loaded.ascii_logging);

            let fd = &loaded.sim_messages[3];
            assert!(fd.is_fd && fd.bitrate_switch && fd.error_state_indicator);
            assert_eq!(fd.dlc, 12);
            assert_eq!(fd.data, vec![0xAA; 12]);
            assert_eq!(fd.timestamp, 1_700_000_000.123_456);
            assert_eq!(fd.channel, Some(Channel::Index(3)));

            let error = &loaded.sim_messages[4];
            assert!(error.is_error_frame && !error.is_remote_frame);
            assert_eq!(error.arbitration_id, 0x080);
            assert_eq!(error.channel, Some(Channel::Name("vcan0".to_string())));

            let remote = &loaded.sim_messages[1];
            assert!(remote.is_remote_frame);
            assert_eq!((remote.dlc, remote.data.len()), (2, 0));
            assert!(loaded.sim_messages[2].is_extended_id);
        }
    }

    #[test]
    fn test_interface_serialized_by_name() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["interface"], "SIM");

        for (interface, name) in INTERFACE_NAMES {
            assert_eq!(CanInterface::from_name(name).unwrap(), interface);
            assert_eq!(interface.to_string(), name);
        }
    }

    #[test]
    fn test_unknown_interface_rejected() {
        let json = r#"{"dbc_file_path": "a.dbc", "interface": "KVASER"}"#;
        assert!(TelemetryConfig::from_json(json).is_err());
        let json = r#"{"dbc_file_path": "a.dbc", "interface": 2}"#;
        assert!(TelemetryConfig::from_json(json).is_err());
    }

    #[test]
    fn test_defaults_applied() {
        let config = TelemetryConfig::from_json(r#"{"dbc_file_path": "a.dbc"}"#).unwrap();
        assert_eq!(config.interface, CanInterface::Virtual);
        assert_eq!(config.bit_rate, 500_000);
        assert!(config.hardware_filters.is_empty());
        assert!(!config.csv_logging);
        assert!(!config.ascii_logging);
        assert!(config.sim_messages.is_empty());
        assert!(config.base_log_file_path.ends_with("_log"));

        let null_base = r#"{"dbc_file_path": "a.dbc", "base_log_file_path": null}"#;
        let config = TelemetryConfig::from_json(null_base).unwrap();
        assert!(config.base_log_file_path.ends_with("_log"));
    }

    #[test]
    fn test_invalid_sim_frame_rejected() {
        let json = r#"{
            "dbc_file_path": "a.dbc",
            "interface": "SIM",
            "sim_messages": [
                {"timestamp": 0.0, "arbitration_id": 4096, "dlc": 0, "data": []}
            ]
        }"#;
        assert!(matches!(
            TelemetryConfig::from_json(json),
            Err(TelemetryError::Config(_))
        ));
    }

    #[test]
    fn test_derived_paths() {
        let config = sample();
        assert_eq!(config.sqlite_log_file_path(), PathBuf::from("out/session_sqlite.db"));
        assert_eq!(config.csv_log_file_path(), PathBuf::from("out/session_csv.csv"));
        assert_eq!(config.ascii_log_file_path(), PathBuf::from("out/session_ascii.log"));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = sample();
        config.to_json_file(&path, true).unwrap();
        assert_eq!(TelemetryConfig::from_json_file(&path).unwrap(), config);
        assert!(TelemetryConfig::from_json_file(dir.path().join("missing.json")).is_err());
    }
}
