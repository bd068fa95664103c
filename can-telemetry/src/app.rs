//! Telemetry application
//!
//! [`TelemetryApp`] wires a [`TelemetryConfig`] into a running session: it
//! selects the bus mode from the configured interface, registers the SQLite
//! store and the optional file loggers as listeners, and answers stored-frame
//! queries and decode requests for downstream tools.

use crate::config::{CanInterface, TelemetryConfig};
use crate::connection::RECEIVE_TIMEOUT;
use crate::decoder::SignalDecoder;
use crate::filter::{FilterBuilder, FilterSet};
use crate::listener::{ListenerHandle, ListenerRegistry};
use crate::loggers::{AsciiLogger, CsvLogger};
use crate::manager::{BusManager, BusMode};
use crate::store::FrameStore;
use crate::transport::TransportConfig;
use crate::types::{Frame, LifecycleState, Result, SignalValue, TelemetryError};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Virtual channel used by the `SIM` and `VIRTUAL` interfaces
pub const DEFAULT_VIRTUAL_CHANNEL: &str = "virtual";
/// SocketCAN interface a PEAK adapter is expected on
pub const DEFAULT_PEAK_INTERFACE: &str = "can0";

/// Listeners owned by a running session
#[derive(Default)]
struct SessionOutputs {
    store: Option<Arc<FrameStore>>,
    csv: Option<Arc<CsvLogger>>,
    ascii: Option<Arc<AsciiLogger>>,
}

impl SessionOutputs {
    fn close(&mut self) {
        if let Some(csv) = self.csv.take() {
            if let Err(e) = csv.close() {
                log::error!("Failed to close CSV log {:?}: {}", csv.path(), e);
            }
        }
        if let Some(ascii) = self.ascii.take() {
            if let Err(e) = ascii.close() {
                log::error!("Failed to close ASCII log {:?}: {}", ascii.path(), e);
            }
        }
    }
}

pub struct TelemetryApp {
    config: TelemetryConfig,
    virtual_channel: String,
    peak_interface: String,
    receive_timeout: Duration,
    registry: Arc<ListenerRegistry>,
    manager: Option<BusManager>,
    outputs: SessionOutputs,
    decoder: OnceCell<SignalDecoder>,
    state: LifecycleState,
}

impl TelemetryApp {
    /// Create an app from a validated configuration
    pub fn new(config: TelemetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            virtual_channel: DEFAULT_VIRTUAL_CHANNEL.to_string(),
            peak_interface: DEFAULT_PEAK_INTERFACE.to_string(),
            receive_timeout: RECEIVE_TIMEOUT,
            registry: Arc::new(ListenerRegistry::new()),
            manager: None,
            outputs: SessionOutputs::default(),
            decoder: OnceCell::new(),
            state: LifecycleState::Disconnected,
        })
    }

    /// Builder method: virtual channel for the `SIM`/`VIRTUAL` interfaces
    pub fn with_virtual_channel(mut self, channel: impl Into<String>) -> Self {
        self.virtual_channel = channel.into();
        self
    }

    /// Builder method: SocketCAN interface for the `PEAK` interface
    pub fn with_peak_interface(mut self, interface: impl Into<String>) -> Self {
        self.peak_interface = interface.into();
        self
    }

    /// Builder method: receive timeout of the bus reader loop
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Bus mode the configured interface maps to
    pub fn bus_mode(&self) -> BusMode {
        let transport = |config: TransportConfig| {
            config
                .with_bit_rate(self.config.bit_rate)
                .with_filters(self.config.hardware_filters.clone())
        };
        match self.config.interface {
            CanInterface::Sim => BusMode::Simulation {
                frames: self.config.sim_messages.clone(),
                transport: Some(transport(TransportConfig::virtual_channel(
                    self.virtual_channel.as_str(),
                ))),
            },
            CanInterface::Virtual => BusMode::Live(transport(TransportConfig::virtual_channel(
                self.virtual_channel.as_str(),
            ))),
            CanInterface::Peak => BusMode::Live(transport(TransportConfig::socketcan(
                self.peak_interface.as_str(),
            ))),
        }
    }

    /// Register a listener (before or after `start()`)
    pub fn add_listener(&self, listener: ListenerHandle) {
        self.registry.add(listener);
    }

    pub fn remove_listener(&self, listener: &ListenerHandle) -> bool {
        self.registry.remove(listener)
    }

    /// Open the outputs and start the bus
    ///
    /// A hardware transport that fails to open is returned as
    /// [`TelemetryError::TransportInit`]; no virtual bus is substituted.
    pub fn start(&mut self) -> Result<()> {
        if self.state != LifecycleState::Disconnected {
            return Err(TelemetryError::InvalidState(format!(
                "telemetry app cannot start from state {}",
                self.state
            )));
        }
        log::info!(
            "Starting telemetry on {} interface (base path '{}')",
            self.config.interface,
            self.config.base_log_file_path
        );

        // Output files this attempt creates; removed again if the bus fails
        let created: Vec<PathBuf> = self
            .output_paths()
            .into_iter()
            .filter(|path| !path.exists())
            .collect();

        let mut handles = Vec::new();
        let opened = self.open_outputs(&mut handles);
        let started = opened.and_then(|mut outputs| {
            let mut manager =
                BusManager::with_registry(self.bus_mode(), Arc::clone(&self.registry))
                    .with_receive_timeout(self.receive_timeout);
            for handle in &handles {
                self.registry.add(handle.clone());
            }
            match manager.start() {
                Ok(()) => Ok((manager, outputs)),
                Err(e) => {
                    outputs.close();
                    Err(e)
                }
            }
        });

        let (manager, outputs) = match started {
            Ok(session) => session,
            Err(e) => {
                for handle in &handles {
                    self.registry.remove(handle);
                }
                // Last references to the store and loggers go here
                drop(handles);
                discard_files(&created);
                return Err(e);
            }
        };

        self.manager = Some(manager);
        self.outputs = outputs;
        self.state = LifecycleState::Connected;
        Ok(())
    }

    /// Every file a session writes: the database (with its WAL companions)
    /// and the enabled loggers
    fn output_paths(&self) -> Vec<PathBuf> {
        let sqlite = self.config.sqlite_log_file_path();
        let mut paths = vec![
            PathBuf::from(format!("{}-wal", sqlite.display())),
            PathBuf::from(format!("{}-shm", sqlite.display())),
            sqlite,
        ];
        if self.config.csv_logging {
            paths.push(self.config.csv_log_file_path());
        }
        if self.config.ascii_logging {
            paths.push(self.config.ascii_log_file_path());
        }
        paths
    }

    fn open_outputs(&self, handles: &mut Vec<ListenerHandle>) -> Result<SessionOutputs> {
        let mut outputs = SessionOutputs::default();

        let store = Arc::new(FrameStore::open(self.config.sqlite_log_file_path())?);
        handles.push(ListenerHandle::from_arc(Arc::clone(&store)));
        outputs.store = Some(store);

        if self.config.csv_logging {
            let csv = Arc::new(CsvLogger::create(self.config.csv_log_file_path())?);
            handles.push(ListenerHandle::from_arc(Arc::clone(&csv)));
            outputs.csv = Some(csv);
        }
        if self.config.ascii_logging {
            let ascii = Arc::new(AsciiLogger::create(self.config.ascii_log_file_path())?);
            handles.push(ListenerHandle::from_arc(Arc::clone(&ascii)));
            outputs.ascii = Some(ascii);
        }
        Ok(outputs)
    }

    /// Stop the bus, then flush and close the file loggers
    ///
    /// Safe to call repeatedly or before `start()`.
    pub fn stop(&mut self) {
        if self.state != LifecycleState::Connected {
            return;
        }
        if let Some(manager) = self.manager.as_mut() {
            manager.stop();
            if let Err(e) = manager.check() {
                log::warn!("Telemetry bus ended with an error: {}", e);
            }
        }
        self.outputs.close();
        self.state = LifecycleState::Closed;
        log::info!("Telemetry stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Connected
            && self.manager.as_ref().map_or(false, BusManager::is_running)
    }

    /// Status check: reports a transport lost since `start()`
    pub fn check(&self) -> Result<()> {
        match &self.manager {
            Some(manager) => manager.check(),
            None => Ok(()),
        }
    }

    /// Frames in the session database, newest first
    ///
    /// Reads through the session's own store while it is open, otherwise
    /// opens the SQLite file of the configured base path read-only.
    pub fn sqlite_read_via(
        &self,
        n: usize,
        white_list_ids: Option<&[u32]>,
        black_list_ids: Option<&[u32]>,
        is_error_frame: Option<bool>,
    ) -> Result<Vec<Frame>> {
        match &self.outputs.store {
            Some(store) => store.read_via(n, white_list_ids, black_list_ids, is_error_frame),
            None => FrameStore::open_read_only(self.config.sqlite_log_file_path())?.read_via(
                n,
                white_list_ids,
                black_list_ids,
                is_error_frame,
            ),
        }
    }

    /// Decoder for the configured DBC, loaded on first use
    pub fn decoder(&self) -> Result<&SignalDecoder> {
        self.decoder
            .get_or_try_init(|| SignalDecoder::from_dbc(&self.config.dbc_file_path))
    }

    /// Decode a frame with the configured DBC
    pub fn decode(&self, frame: &Frame) -> Result<BTreeMap<String, SignalValue>> {
        self.decoder()?.decode(frame)
    }

    /// Build a filter set from message-name substrings of the configured DBC
    pub fn build_filters(&self, name_substrings: &[&str]) -> Result<FilterSet> {
        let database = self.decoder()?.database();
        let mut filters = FilterSet::new();
        for substring in name_substrings {
            FilterBuilder::add(&mut filters, database, substring);
        }
        Ok(filters)
    }
}

fn discard_files(paths: &[PathBuf]) {
    for path in paths.iter().filter(|path| path.exists()) {
        match fs::remove_file(path) {
            Ok(()) => log::debug!("Removed {:?} after failed start", path),
            Err(e) => log::warn!("Failed to remove {:?}: {}", path, e),
        }
    }
}

impl Drop for TelemetryApp {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CanTransport, VirtualTransport};
    use crate::types::now_seconds;
    use std::fs;
    use std::thread;
    use std::time::Instant;
    use tempfile::TempDir;

    const FAST: Duration = Duration::from_millis(50);

    const DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: BMS

BO_ 256 M1_CellVoltages: 4 BMS
 SG_ Cell1 : 0|16@1+ (0.001,0) [0|5] "V" BMS
 SG_ Cell2 : 16|16@1+ (0.001,0) [0|5] "V" BMS

BO_ 512 M2_Current: 2 BMS
 SG_ PackCurrent : 0|16@1- (0.1,0) [-3276.8|3276.7] "A" BMS
"#;

    fn config(dir: &TempDir, interface: CanInterface) -> TelemetryConfig {
        let dbc = dir.path().join("bms.dbc");
        fs::write(&dbc, DBC).unwrap();
        TelemetryConfig::new(dbc)
            .with_interface(interface)
            .with_base_log_file_path(dir.path().join("session").display().to_string())
    }

    fn wait_for_rows(app: &TelemetryApp, count: usize) -> Vec<Frame> {
        let start = Instant::now();
        loop {
            let frames = app.sqlite_read_via(100, None, None, None).unwrap();
            if frames.len() >= count || start.elapsed() > Duration::from_secs(3) {
                return frames;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_interface_mapping() {
        let dir = TempDir::new().unwrap();
        let sim = TelemetryApp::new(config(&dir, CanInterface::Sim)).unwrap();
        assert!(matches!(
            sim.bus_mode(),
            BusMode::Simulation { transport: Some(_), .. }
        ));

        let peak = TelemetryApp::new(config(&dir, CanInterface::Peak)).unwrap();
        match peak.bus_mode() {
            BusMode::Live(transport) => {
                assert_eq!(transport.kind.to_string(), "socketcan:can0")
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_sim_session_persists_and_logs() {
        let dir = TempDir::new().unwrap();
        let now = now_seconds();
        let config = config(&dir, CanInterface::Sim)
            .with_csv_logging(true)
            .with_ascii_logging(true)
            .with_sim_messages(vec![
                Frame::new(0x100, &[0xE8, 0x0F, 0xD0, 0x0F]).with_timestamp(now + 0.05),
                Frame::new(0x200, &[0x83, 0xFF]).with_timestamp(now + 0.1),
            ]);
        let mut app = TelemetryApp::new(config)
            .unwrap()
            .with_virtual_channel("app-sim")
            .with_receive_timeout(FAST);
        app.start().unwrap();

        let frames = wait_for_rows(&app, 2);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].arbitration_id, 0x200);

        let only_cells = app.sqlite_read_via(10, Some(&[0x100]), None, None).unwrap();
        assert_eq!(only_cells.len(), 1);

        app.stop();
        app.stop();
        assert_eq!(app.state(), LifecycleState::Closed);

        let csv = fs::read_to_string(app.config().csv_log_file_path()).unwrap();
        assert_eq!(csv.lines().count(), 3);
        let ascii = fs::read_to_string(app.config().ascii_log_file_path()).unwrap();
        assert!(ascii.contains(" 200#83FF"));

        // The database outlives the session
        let reread = app.sqlite_read_via(10, None, Some(&[0x100]), Some(false)).unwrap();
        assert_eq!(reread.len(), 1);
        assert_eq!(reread[0].arbitration_id, 0x200);
    }

    #[test]
    fn test_virtual_session_receives_peer_frames() {
        let dir = TempDir::new().unwrap();
        let mut app = TelemetryApp::new(config(&dir, CanInterface::Virtual))
            .unwrap()
            .with_virtual_channel("app-virtual")
            .with_receive_timeout(FAST);
        app.start().unwrap();
        assert!(app.is_running());

        let mut peer = VirtualTransport::new("app-virtual");
        peer.connect().unwrap();
        peer.send(&Frame::new(0x100, &[0, 0, 0, 0])).unwrap();

        let frames = wait_for_rows(&app, 1);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].timestamp > 0.0);
        app.stop();
    }

    #[test]
    fn test_failed_peak_start_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, CanInterface::Peak)
            .with_csv_logging(true)
            .with_ascii_logging(true);
        let mut app = TelemetryApp::new(config)
            .unwrap()
            .with_peak_interface("nosuchcan3");
        assert!(matches!(
            app.start(),
            Err(TelemetryError::TransportInit { .. })
        ));
        assert_eq!(app.state(), LifecycleState::Disconnected);
        app.stop();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name != "bms.dbc")
            .collect();
        assert!(leftovers.is_empty(), "failed start left files: {:?}", leftovers);
        assert!(app.sqlite_read_via(1, None, None, None).is_err());
    }

    #[test]
    fn test_decode_and_filters_from_dbc() {
        let dir = TempDir::new().unwrap();
        let app = TelemetryApp::new(config(&dir, CanInterface::Virtual)).unwrap();

        let values = app
            .decode(&Frame::new(0x100, &[0xE8, 0x03, 0xD0, 0x07]))
            .unwrap();
        assert!((values["Cell1"].as_f64() - 1.0).abs() < 1e-9);
        assert!((values["Cell2"].as_f64() - 2.0).abs() < 1e-9);

        assert!(matches!(
            app.decode(&Frame::new(0x300, &[])),
            Err(TelemetryError::Decode(_))
        ));

        let filters = app.build_filters(&["CellVoltages"]).unwrap();
        assert_eq!(filters.ids(), [0x100].into_iter().collect());
    }

    #[test]
    fn test_missing_dbc_is_reported_on_decode() {
        let dir = TempDir::new().unwrap();
        let config = TelemetryConfig::new(dir.path().join("missing.dbc"));
        let app = TelemetryApp::new(config).unwrap();
        assert!(matches!(
            app.decode(&Frame::new(0x100, &[])),
            Err(TelemetryError::DbcParse(_))
        ));
    }
}
