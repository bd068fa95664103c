//! Bus lifecycle façade
//!
//! [`BusManager`] composes one [`ListenerRegistry`] with whichever frame
//! source its [`BusMode`] selects: a live/virtual [`BusConnection`], or a
//! [`FrameScheduler`] replaying recorded frames (optionally on top of a
//! virtual connection). The mode is fixed at construction.

use crate::connection::{BusConnection, RECEIVE_TIMEOUT};
use crate::listener::{ListenerHandle, ListenerRegistry};
use crate::scheduler::FrameScheduler;
use crate::transport::TransportConfig;
use crate::types::{Frame, LifecycleState, Result, TelemetryError};
use std::sync::Arc;
use std::time::Duration;

/// Frame source selected at construction
#[derive(Debug, Clone)]
pub enum BusMode {
    /// Read frames from a transport
    Live(TransportConfig),
    /// Replay `frames` at their timestamps; when `transport` is given, the
    /// connection is opened as well and its traffic is delivered alongside
    Simulation {
        frames: Vec<Frame>,
        transport: Option<TransportConfig>,
    },
}

pub struct BusManager {
    mode: BusMode,
    registry: Arc<ListenerRegistry>,
    receive_timeout: Duration,
    state: LifecycleState,
    connection: Option<BusConnection>,
    scheduler: Option<FrameScheduler>,
}

impl BusManager {
    pub fn new(mode: BusMode) -> Self {
        Self::with_registry(mode, Arc::new(ListenerRegistry::new()))
    }

    /// Manager fanning out through an existing registry
    pub fn with_registry(mode: BusMode, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            mode,
            registry,
            receive_timeout: RECEIVE_TIMEOUT,
            state: LifecycleState::Disconnected,
            connection: None,
            scheduler: None,
        }
    }

    /// Manager reading from a live or virtual transport
    pub fn live(config: TransportConfig) -> Self {
        Self::new(BusMode::Live(config))
    }

    /// Manager replaying `frames` without any transport
    pub fn simulation(frames: Vec<Frame>) -> Self {
        Self::new(BusMode::Simulation {
            frames,
            transport: None,
        })
    }

    /// Manager replaying `frames` on top of a started transport
    pub fn simulation_on(frames: Vec<Frame>, transport: TransportConfig) -> Self {
        Self::new(BusMode::Simulation {
            frames,
            transport: Some(transport),
        })
    }

    /// Builder method: receive timeout used by the reader loop
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn mode(&self) -> &BusMode {
        &self.mode
    }

    /// Shared registry; frames from every source are fanned out through it
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Register a listener (before or after `start()`)
    pub fn add_listener(&self, listener: ListenerHandle) {
        self.registry.add(listener);
    }

    pub fn remove_listener(&self, listener: &ListenerHandle) -> bool {
        self.registry.remove(listener)
    }

    /// Open the transport and/or begin replay, depending on the mode
    ///
    /// A transport that fails to open is reported as
    /// [`TelemetryError::TransportInit`]; no other transport is substituted.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Connected => {
                return Err(TelemetryError::InvalidState(
                    "bus manager already started".to_string(),
                ))
            }
            LifecycleState::Closed => {
                return Err(TelemetryError::InvalidState(
                    "bus manager is closed; create a new one to restart".to_string(),
                ))
            }
            LifecycleState::Disconnected => {}
        }

        match &self.mode {
            BusMode::Live(config) => {
                log::info!("Bus manager starting in live mode on {}", config.kind);
                self.connection = Some(self.open_connection(config)?);
            }
            BusMode::Simulation { frames, transport } => {
                log::info!(
                    "Bus manager starting simulation of {} frame(s)",
                    frames.len()
                );
                let connection = match transport {
                    Some(config) => Some(self.open_connection(config)?),
                    None => None,
                };
                let scheduler = FrameScheduler::new(Arc::clone(&self.registry));
                scheduler.simulate(frames.clone())?;
                self.connection = connection;
                self.scheduler = Some(scheduler);
            }
        }

        self.state = LifecycleState::Connected;
        Ok(())
    }

    fn open_connection(&self, config: &TransportConfig) -> Result<BusConnection> {
        let mut connection = BusConnection::new(config.clone(), Arc::clone(&self.registry))
            .with_receive_timeout(self.receive_timeout);
        connection.start()?;
        Ok(connection)
    }

    /// Schedule additional frames for replay (simulation mode only)
    pub fn simulate(&self, frames: Vec<Frame>) -> Result<usize> {
        match (&self.scheduler, self.state) {
            (Some(scheduler), LifecycleState::Connected) => scheduler.simulate(frames),
            _ => Err(TelemetryError::InvalidState(
                "bus manager is not running in simulation mode".to_string(),
            )),
        }
    }

    /// Tear down whichever sources are active
    ///
    /// Pending replayed frames are discarded first; a delivery already in
    /// flight may still complete. Safe to call repeatedly or before `start()`.
    pub fn stop(&mut self) {
        if self.state != LifecycleState::Connected {
            return;
        }
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop();
        }
        if let Some(connection) = self.connection.as_mut() {
            connection.stop();
        }
        self.state = LifecycleState::Closed;
        log::info!("Bus manager stopped");
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// True while started and every active source is still producing
    pub fn is_running(&self) -> bool {
        if self.state != LifecycleState::Connected {
            return false;
        }
        let connection_ok = self.connection.as_ref().map_or(true, |c| c.is_running());
        let scheduler_ok = self.scheduler.as_ref().map_or(true, |s| !s.is_stopped());
        connection_ok && scheduler_ok
    }

    /// Status check: reports a transport lost since `start()`
    pub fn check(&self) -> Result<()> {
        match &self.connection {
            Some(connection) => connection.check(),
            None => Ok(()),
        }
    }

    /// Replayed frames still waiting for their deadline
    pub fn pending_replay(&self) -> usize {
        self.scheduler.as_ref().map_or(0, |s| s.pending())
    }
}

impl Drop for BusManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CanTransport, VirtualTransport};
    use crate::types::now_seconds;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Instant;

    const FAST: Duration = Duration::from_millis(50);

    fn recorder() -> (ListenerHandle, Arc<Mutex<Vec<u32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = ListenerHandle::from_fn(move |frame: &Frame| {
            sink.lock().push(frame.arbitration_id);
        });
        (handle, seen)
    }

    fn wait_for(seen: &Mutex<Vec<u32>>, count: usize) {
        let start = Instant::now();
        while seen.lock().len() < count && start.elapsed() < Duration::from_secs(3) {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_stop_before_start_and_twice() {
        let mut manager = BusManager::live(TransportConfig::virtual_channel("mgr-stop"));
        manager.stop();
        assert_eq!(manager.state(), LifecycleState::Disconnected);

        let mut manager = manager.with_receive_timeout(FAST);
        manager.start().unwrap();
        manager.stop();
        manager.stop();
        assert_eq!(manager.state(), LifecycleState::Closed);
        assert!(!manager.is_running());
    }

    #[test]
    fn test_live_mode_delivers_to_listeners_added_after_start() {
        let mut manager =
            BusManager::live(TransportConfig::virtual_channel("mgr-live")).with_receive_timeout(FAST);
        manager.start().unwrap();
        let (handle, seen) = recorder();
        manager.add_listener(handle);

        let mut peer = VirtualTransport::new("mgr-live");
        peer.connect().unwrap();
        peer.send(&Frame::new(0x7E8, &[0x02, 0x41, 0x0C])).unwrap();

        wait_for(&seen, 1);
        assert_eq!(*seen.lock(), vec![0x7E8]);
        assert!(manager.is_running());
        manager.stop();
    }

    #[test]
    fn test_pure_simulation_replays_frames() {
        let now = now_seconds();
        let frames = vec![
            Frame::new(0x2, &[]).with_timestamp(now + 0.15),
            Frame::new(0x1, &[]).with_timestamp(now + 0.05),
        ];
        let mut manager = BusManager::simulation(frames);
        let (handle, seen) = recorder();
        manager.add_listener(handle);

        manager.start().unwrap();
        wait_for(&seen, 2);
        assert_eq!(*seen.lock(), vec![0x1, 0x2]);

        manager.simulate(vec![Frame::new(0x3, &[])]).unwrap();
        wait_for(&seen, 3);
        assert_eq!(seen.lock().len(), 3);
        manager.stop();
    }

    #[test]
    fn test_simulation_on_virtual_transport_merges_sources() {
        let now = now_seconds();
        let mut manager = BusManager::simulation_on(
            vec![Frame::new(0x10, &[]).with_timestamp(now + 0.05)],
            TransportConfig::virtual_channel("mgr-sim-virtual"),
        )
        .with_receive_timeout(FAST);
        let (handle, seen) = recorder();
        manager.add_listener(handle);
        manager.start().unwrap();

        let mut peer = VirtualTransport::new("mgr-sim-virtual");
        peer.connect().unwrap();
        peer.send(&Frame::new(0x20, &[])).unwrap();

        wait_for(&seen, 2);
        let mut ids = seen.lock().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![0x10, 0x20]);
        manager.stop();
    }

    #[test]
    fn test_stop_prevents_later_replay() {
        let now = now_seconds();
        let mut manager =
            BusManager::simulation(vec![Frame::new(0x99, &[]).with_timestamp(now + 0.3)]);
        let (handle, seen) = recorder();
        manager.add_listener(handle);
        manager.start().unwrap();
        assert_eq!(manager.pending_replay(), 1);

        manager.stop();
        thread::sleep(Duration::from_millis(500));
        assert!(seen.lock().is_empty());
        assert!(manager.simulate(vec![Frame::new(0x1, &[])]).is_err());
    }

    #[test]
    fn test_failed_hardware_is_not_replaced() {
        let mut manager = BusManager::live(TransportConfig::socketcan("nosuchcan7"));
        assert!(matches!(
            manager.start(),
            Err(TelemetryError::TransportInit { .. })
        ));
        assert_eq!(manager.state(), LifecycleState::Disconnected);
        assert!(!manager.is_running());
    }

    #[test]
    fn test_unschedulable_replay_fails_start() {
        let mut manager = BusManager::simulation_on(
            vec![Frame::new(0x1, &[]).with_timestamp(1.0e19)],
            TransportConfig::virtual_channel("mgr-far-future"),
        )
        .with_receive_timeout(FAST);
        assert!(matches!(
            manager.start(),
            Err(TelemetryError::InvalidFrame(_))
        ));
        assert_eq!(manager.state(), LifecycleState::Disconnected);
        assert!(!manager.is_running());
        assert_eq!(crate::transport::virtual_bus::peer_count("mgr-far-future"), 0);
    }

    #[test]
    fn test_simulate_rejected_in_live_mode() {
        let mut manager = BusManager::live(TransportConfig::virtual_channel("mgr-live-sim"))
            .with_receive_timeout(FAST);
        manager.start().unwrap();
        assert!(matches!(
            manager.simulate(vec![]),
            Err(TelemetryError::InvalidState(_))
        ));
        manager.stop();
    }
}
