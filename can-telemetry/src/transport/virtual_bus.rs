//! In-process virtual CAN bus
//!
//! Every [`VirtualTransport`] connected to the same channel name joins one
//! broadcast domain: a frame sent by one peer is received by every other peer
//! on that channel (never echoed back to the sender). Useful for running the
//! whole pipeline without hardware and for feeding a live connection from a
//! test or a second process thread.

use super::{filters_accept, CanTransport, HardwareFilter};
use crate::types::{now_seconds, Channel, Frame, Result, TelemetryError};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct Peer {
    id: u64,
    tx: Sender<Frame>,
}

static CHANNELS: Lazy<Mutex<HashMap<String, Vec<Peer>>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Disconnect every peer on `channel`, as if the bus had been unplugged
///
/// Connected transports see [`TelemetryError::TransportLost`] on their next
/// receive once queued frames are drained. Returns the number of peers dropped.
pub fn close_channel(channel: &str) -> usize {
    let removed = CHANNELS.lock().remove(channel).map(|p| p.len()).unwrap_or(0);
    log::info!("Closed virtual channel '{}' ({} peers)", channel, removed);
    removed
}

/// Number of peers currently connected to `channel`
pub fn peer_count(channel: &str) -> usize {
    CHANNELS.lock().get(channel).map(|p| p.len()).unwrap_or(0)
}

/// One peer on a virtual channel
pub struct VirtualTransport {
    channel: String,
    peer_id: Option<u64>,
    rx: Option<Receiver<Frame>>,
    filters: Vec<HardwareFilter>,
}

impl VirtualTransport {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            peer_id: None,
            rx: None,
            filters: Vec::new(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    fn lost(&self, reason: &str) -> TelemetryError {
        TelemetryError::TransportLost {
            transport: format!("virtual:{}", self.channel),
            reason: reason.to_string(),
        }
    }
}

impl CanTransport for VirtualTransport {
    fn connect(&mut self) -> Result<()> {
        if self.peer_id.is_some() {
            return Ok(());
        }
        let id = NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::unbounded();
        CHANNELS
            .lock()
            .entry(self.channel.clone())
            .or_default()
            .push(Peer { id, tx });

        self.peer_id = Some(id);
        self.rx = Some(rx);
        log::debug!("Virtual peer {} joined channel '{}'", id, self.channel);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        match self.peer_id {
            Some(id) => CHANNELS
                .lock()
                .get(&self.channel)
                .map(|peers| peers.iter().any(|p| p.id == id))
                .unwrap_or(false),
            None => false,
        }
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        let rx = self.rx.as_ref().ok_or_else(|| self.lost("not connected"))?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(frame) => {
                    if filters_accept(&self.filters, &frame) {
                        return Ok(Some(frame));
                    }
                    log::trace!("Filtered out frame 0x{:X}", frame.arbitration_id);
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.lost("channel closed"));
                }
            }
        }
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        let own_id = self.peer_id.ok_or_else(|| self.lost("not connected"))?;
        frame.validate()?;

        let mut outgoing = frame.clone();
        if outgoing.timestamp == 0.0 {
            outgoing.timestamp = now_seconds();
        }
        if outgoing.channel.is_none() {
            outgoing.channel = Some(Channel::Name(self.channel.clone()));
        }

        let channels = CHANNELS.lock();
        let peers = channels
            .get(&self.channel)
            .ok_or_else(|| self.lost("channel closed"))?;
        for peer in peers.iter().filter(|p| p.id != own_id) {
            // A peer whose receiver is gone is removed on its own shutdown
            let _ = peer.tx.send(outgoing.clone());
        }
        Ok(())
    }

    fn set_filters(&mut self, filters: &[HardwareFilter]) -> Result<()> {
        self.filters = filters.to_vec();
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Some(id) = self.peer_id.take() {
            let mut channels = CHANNELS.lock();
            if let Some(peers) = channels.get_mut(&self.channel) {
                peers.retain(|p| p.id != id);
                if peers.is_empty() {
                    channels.remove(&self.channel);
                }
            }
            log::debug!("Virtual peer {} left channel '{}'", id, self.channel);
        }
        self.rx = None;
    }
}

impl Drop for VirtualTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
