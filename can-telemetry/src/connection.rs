//! Live bus connection
//!
//! [`BusConnection`] opens a transport on `start()` and moves it into a
//! dedicated reader thread. The reader blocks on the transport with a bounded
//! timeout, pushes every received frame into the attached
//! [`ListenerRegistry`], and rechecks its stop flag after each receive, so
//! `stop()` returns within one receive timeout.

use crate::listener::ListenerRegistry;
use crate::transport::{CanTransport, Transport, TransportConfig};
use crate::types::{LifecycleState, Result, TelemetryError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Default bound on one blocking receive in the reader loop
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a reader loop terminated on its own
#[derive(Debug, Clone)]
struct ReaderFault {
    transport: String,
    reason: String,
}

/// Owns one transport and the reader thread feeding a listener registry
pub struct BusConnection {
    config: TransportConfig,
    registry: Arc<ListenerRegistry>,
    receive_timeout: Duration,
    state: LifecycleState,
    running: Arc<AtomicBool>,
    frames_received: Arc<AtomicU64>,
    fault: Arc<Mutex<Option<ReaderFault>>>,
    reader: Option<JoinHandle<()>>,
}

impl BusConnection {
    pub fn new(config: TransportConfig, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            config,
            registry,
            receive_timeout: RECEIVE_TIMEOUT,
            state: LifecycleState::Disconnected,
            running: Arc::new(AtomicBool::new(false)),
            frames_received: Arc::new(AtomicU64::new(0)),
            fault: Arc::new(Mutex::new(None)),
            reader: None,
        }
    }

    /// Builder method: bound on each blocking receive (and so on `stop()` latency)
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Open the transport and spawn the reader thread
    ///
    /// A transport that cannot be opened is reported immediately as
    /// [`TelemetryError::TransportInit`] and the connection stays
    /// `Disconnected`.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Connected => {
                return Err(TelemetryError::InvalidState(
                    "bus connection already started".to_string(),
                ))
            }
            LifecycleState::Closed => {
                return Err(TelemetryError::InvalidState(
                    "bus connection is closed; create a new one to reconnect".to_string(),
                ))
            }
            LifecycleState::Disconnected => {}
        }

        let transport = Transport::open(&self.config)?;
        let transport_name = self.config.kind.to_string();

        self.running.store(true, Ordering::Release);
        let reader = ReaderLoop {
            transport,
            transport_name: transport_name.clone(),
            registry: Arc::clone(&self.registry),
            running: Arc::clone(&self.running),
            frames_received: Arc::clone(&self.frames_received),
            fault: Arc::clone(&self.fault),
            timeout: self.receive_timeout,
        };
        let handle = thread::Builder::new()
            .name(format!("can-reader-{}", transport_name))
            .spawn(move || reader.run());

        match handle {
            Ok(handle) => {
                self.reader = Some(handle);
                self.state = LifecycleState::Connected;
                log::info!("Bus connection started on {}", transport_name);
                Ok(())
            }
            Err(e) => {
                // The closure (and the transport inside it) is dropped with the error
                self.running.store(false, Ordering::Release);
                Err(TelemetryError::TransportInit {
                    transport: transport_name,
                    reason: format!("failed to spawn reader thread: {}", e),
                })
            }
        }
    }

    /// Signal the reader to exit, wait for it, and release the transport
    ///
    /// Idempotent: stopping a connection that was never started leaves it
    /// `Disconnected`; stopping a started one leaves it `Closed`.
    pub fn stop(&mut self) {
        if self.state != LifecycleState::Connected {
            return;
        }

        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            if handle.join().is_err() {
                log::error!("Reader thread for {} panicked", self.config.kind);
            }
        }
        self.state = LifecycleState::Closed;

        if let Some(fault) = self.fault.lock().as_ref() {
            log::warn!(
                "Bus connection on {} had already terminated: {}",
                fault.transport,
                fault.reason
            );
        }
        log::info!("Bus connection on {} stopped", self.config.kind);
    }

    /// True while started and the reader loop is still receiving
    pub fn is_running(&self) -> bool {
        self.state == LifecycleState::Connected && self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Status check: reports a transport lost mid-read, if any
    pub fn check(&self) -> Result<()> {
        match self.fault.lock().as_ref() {
            Some(fault) => Err(TelemetryError::TransportLost {
                transport: fault.transport.clone(),
                reason: fault.reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Frames received from the transport since start
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        if self.state == LifecycleState::Connected {
            log::warn!("Bus connection dropped while running - stopping");
            self.stop();
        }
    }
}

struct ReaderLoop {
    transport: Transport,
    transport_name: String,
    registry: Arc<ListenerRegistry>,
    running: Arc<AtomicBool>,
    frames_received: Arc<AtomicU64>,
    fault: Arc<Mutex<Option<ReaderFault>>>,
    timeout: Duration,
}

impl ReaderLoop {
    fn run(mut self) {
        log::debug!("Reader thread for {} started", self.transport_name);

        while self.running.load(Ordering::Acquire) {
            match self.transport.recv(self.timeout) {
                Ok(Some(frame)) => {
                    self.frames_received.fetch_add(1, Ordering::Relaxed);
                    self.registry.notify(&frame);
                }
                Ok(None) => {}
                Err(e) => {
                    log::error!("Reader for {} terminating: {}", self.transport_name, e);
                    let reason = match e {
                        TelemetryError::TransportLost { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    *self.fault.lock() = Some(ReaderFault {
                        transport: self.transport_name.clone(),
                        reason,
                    });
                    break;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        self.transport.shutdown();
        log::debug!("Reader thread for {} exiting", self.transport_name);
    }
}
