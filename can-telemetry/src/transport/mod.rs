//! Bus transports
//!
//! A transport is the exclusive owner of one connection to a CAN bus. The set
//! of transports is closed: [`Transport`] enumerates them and the concrete
//! variant is chosen from a [`TransportConfig`] at construction time.
//!
//! - `Virtual`: in-process broadcast bus keyed by channel name, always available
//! - `SocketCan`: Linux SocketCAN (PEAK USB adapters via `peak_usb`), behind
//!   the `socketcan` cargo feature

use crate::types::{Frame, Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod virtual_bus;
#[cfg(feature = "socketcan")]
mod socketcan_bus;

pub use virtual_bus::VirtualTransport;
#[cfg(feature = "socketcan")]
pub use socketcan_bus::SocketCanTransport;

/// Capability interface shared by every transport variant
pub trait CanTransport {
    /// Open the underlying bus handle
    fn connect(&mut self) -> Result<()>;

    /// True while the handle is open and usable
    fn is_valid(&self) -> bool;

    /// Receive one frame, blocking for at most `timeout`
    ///
    /// `Ok(None)` means the timeout elapsed without traffic. An error means the
    /// transport is no longer usable.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>>;

    /// Transmit one frame
    fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Install acceptance filters; an empty slice accepts every frame
    fn set_filters(&mut self, filters: &[HardwareFilter]) -> Result<()>;

    /// Release the handle; further calls to `recv`/`send` fail
    fn shutdown(&mut self);
}

/// Acceptance filter: a frame passes when `id & can_mask == can_id & can_mask`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareFilter {
    pub can_id: u32,
    pub can_mask: u32,
    /// When present, the frame's extended flag must match as well
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<bool>,
}

impl HardwareFilter {
    pub fn new(can_id: u32, can_mask: u32) -> Self {
        Self {
            can_id,
            can_mask,
            extended: None,
        }
    }

    /// Filter accepting exactly one identifier
    pub fn exact(can_id: u32, extended: bool) -> Self {
        let can_mask = if extended {
            crate::types::MAX_EXTENDED_ID
        } else {
            crate::types::MAX_STANDARD_ID
        };
        Self {
            can_id,
            can_mask,
            extended: Some(extended),
        }
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        if let Some(extended) = self.extended {
            if extended != frame.is_extended_id {
                return false;
            }
        }
        frame.arbitration_id & self.can_mask == self.can_id & self.can_mask
    }
}

/// True if `frame` passes at least one filter (or the list is empty)
pub fn filters_accept(filters: &[HardwareFilter], frame: &Frame) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(frame))
}

/// Which concrete transport to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process bus shared by every transport opened on the same channel
    Virtual { channel: String },
    /// SocketCAN network interface (e.g. "can0", "vcan0")
    SocketCan { interface: String },
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Virtual { channel } => write!(f, "virtual:{}", channel),
            TransportKind::SocketCan { interface } => write!(f, "socketcan:{}", interface),
        }
    }
}

/// Everything needed to open a transport
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub kind: TransportKind,
    /// Nominal bit rate; informational for virtual buses
    pub bit_rate: u32,
    pub filters: Vec<HardwareFilter>,
}

impl TransportConfig {
    /// Virtual bus on `channel` at the default 500 kbit/s
    pub fn virtual_channel(channel: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::Virtual {
                channel: channel.into(),
            },
            bit_rate: 500_000,
            filters: Vec::new(),
        }
    }

    /// SocketCAN interface at the default 500 kbit/s
    pub fn socketcan(interface: impl Into<String>) -> Self {
        Self {
            kind: TransportKind::SocketCan {
                interface: interface.into(),
            },
            bit_rate: 500_000,
            filters: Vec::new(),
        }
    }

    /// Builder method: set the bit rate
    pub fn with_bit_rate(mut self, bit_rate: u32) -> Self {
        self.bit_rate = bit_rate;
        self
    }

    /// Builder method: set acceptance filters
    pub fn with_filters(mut self, filters: Vec<HardwareFilter>) -> Self {
        self.filters = filters;
        self
    }
}

/// The closed set of transport variants
pub enum Transport {
    Virtual(VirtualTransport),
    #[cfg(feature = "socketcan")]
    SocketCan(SocketCanTransport),
}

impl Transport {
    /// Build the variant selected by `config`, connect it and install filters
    ///
    /// Fails with [`TelemetryError::TransportInit`]; no retry is attempted.
    pub fn open(config: &TransportConfig) -> Result<Self> {
        log::info!(
            "Opening transport {} at {} bit/s with {} filter(s)",
            config.kind,
            config.bit_rate,
            config.filters.len()
        );

        let mut transport = match &config.kind {
            TransportKind::Virtual { channel } => {
                Transport::Virtual(VirtualTransport::new(channel.clone()))
            }
            #[cfg(feature = "socketcan")]
            TransportKind::SocketCan { interface } => {
                Transport::SocketCan(SocketCanTransport::new(interface.clone()))
            }
            #[cfg(not(feature = "socketcan"))]
            TransportKind::SocketCan { .. } => {
                return Err(TelemetryError::TransportInit {
                    transport: config.kind.to_string(),
                    reason: "SocketCAN support not compiled in (enable the `socketcan` feature)"
                        .to_string(),
                });
            }
        };

        transport.connect()?;
        if let Err(e) = transport.set_filters(&config.filters) {
            transport.shutdown();
            return Err(e);
        }
        Ok(transport)
    }
}

impl CanTransport for Transport {
    fn connect(&mut self) -> Result<()> {
        match self {
            Transport::Virtual(t) => t.connect(),
            #[cfg(feature = "socketcan")]
            Transport::SocketCan(t) => t.connect(),
        }
    }

    fn is_valid(&self) -> bool {
        match self {
            Transport::Virtual(t) => t.is_valid(),
            #[cfg(feature = "socketcan")]
            Transport::SocketCan(t) => t.is_valid(),
        }
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        match self {
            Transport::Virtual(t) => t.recv(timeout),
            #[cfg(feature = "socketcan")]
            Transport::SocketCan(t) => t.recv(timeout),
        }
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        match self {
            Transport::Virtual(t) => t.send(frame),
            #[cfg(feature = "socketcan")]
            Transport::SocketCan(t) => t.send(frame),
        }
    }

    fn set_filters(&mut self, filters: &[HardwareFilter]) -> Result<()> {
        match self {
            Transport::Virtual(t) => t.set_filters(filters),
            #[cfg(feature = "socketcan")]
            Transport::SocketCan(t) => t.set_filters(filters),
        }
    }

    fn shutdown(&mut self) {
        match self {
            Transport::Virtual(t) => t.shutdown(),
            #[cfg(feature = "socketcan")]
            Transport::SocketCan(t) => t.shutdown(),
        }
    }
}
