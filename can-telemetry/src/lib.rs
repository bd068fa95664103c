//! CAN Telemetry Library
//!
//! Captures traffic from a CAN bus (a live transport or a time-scheduled
//! replay), fans every frame out to registered listeners, persists frames to
//! a queryable SQLite log and decodes payloads into named signals using a DBC
//! file.
//!
//! # Architecture
//!
//! - [`BusConnection`] reads a transport on a dedicated thread
//! - [`FrameScheduler`] replays frames at their recorded timestamps
//! - [`BusManager`] composes either source with a [`ListenerRegistry`]
//! - [`FrameStore`], [`CsvLogger`] and [`AsciiLogger`] are listeners
//! - [`SignalDecoder`] and [`FilterBuilder`] work from a [`MessageDatabase`]
//! - [`TelemetryApp`] builds all of the above from a [`TelemetryConfig`]
//!
//! The library only logs through the `log` facade; installing a logger is
//! left to the application.
//!
//! # Example Usage
//!
//! ```no_run
//! use can_telemetry::{Frame, FrameQuery, FrameStore, ListenerHandle, BusManager, now_seconds};
//! use std::sync::Arc;
//!
//! let store = Arc::new(FrameStore::open("session_sqlite.db").unwrap());
//!
//! let now = now_seconds();
//! let mut manager = BusManager::simulation(vec![
//!     Frame::new(0x100, &[0xE8, 0x03]).with_timestamp(now + 2.0),
//!     Frame::new(0x200, &[0x83, 0xFF]).with_timestamp(now + 4.0),
//! ]);
//! manager.add_listener(ListenerHandle::from_arc(Arc::clone(&store)));
//! manager.start().unwrap();
//!
//! std::thread::sleep(std::time::Duration::from_secs(5));
//! manager.stop();
//!
//! for frame in store.query(&FrameQuery::new(10).allow([0x100])).unwrap() {
//!     println!("{}", frame);
//! }
//! ```

pub mod app;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod filter;
pub mod listener;
pub mod loggers;
pub mod manager;
pub mod scheduler;
pub mod signals;
pub mod store;
pub mod transport;
pub mod types;

pub use app::TelemetryApp;
pub use config::{CanInterface, TelemetryConfig};
pub use connection::{BusConnection, RECEIVE_TIMEOUT};
pub use decoder::SignalDecoder;
pub use filter::{FilterBuilder, FilterSet};
pub use listener::{Listener, ListenerHandle, ListenerRegistry};
pub use loggers::{read_csv_log, AsciiLogger, CsvLogger};
pub use manager::{BusManager, BusMode};
pub use scheduler::FrameScheduler;
pub use signals::{DatabaseStats, MessageDatabase, MessageDefinition, SignalDefinition};
pub use store::{FrameQuery, FrameStore};
pub use transport::{CanTransport, HardwareFilter, Transport, TransportConfig, TransportKind};
pub use types::{
    now_seconds, Channel, DecodeError, DecodedSignal, Frame, LifecycleState, Result,
    SignalValue, TelemetryError, MAX_EXTENDED_ID, MAX_STANDARD_ID,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        assert!(!VERSION.is_empty());
        let manager = BusManager::simulation(Vec::new());
        assert_eq!(manager.state(), LifecycleState::Disconnected);
        assert!(manager.registry().is_empty());
    }
}
