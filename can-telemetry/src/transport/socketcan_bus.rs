//! Linux SocketCAN transport
//!
//! PEAK USB adapters are exposed by the `peak_usb` kernel driver as ordinary
//! SocketCAN network interfaces, so they are opened through this backend. The
//! bit rate is a property of the network interface (`ip link set can0 type can
//! bitrate 500000`) and is not changed from here.

use super::{CanTransport, HardwareFilter};
use crate::types::{
    now_seconds, Channel, Frame, Result, TelemetryError, MAX_EXTENDED_ID, MAX_STANDARD_ID,
};
use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as _, Id, Socket,
    SocketOptions, StandardId,
};
use std::io;
use std::time::Duration;

pub struct SocketCanTransport {
    interface: String,
    socket: Option<CanSocket>,
    read_timeout: Option<Duration>,
}

impl SocketCanTransport {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            socket: None,
            read_timeout: None,
        }
    }

    fn name(&self) -> String {
        format!("socketcan:{}", self.interface)
    }

    fn lost(&self, reason: impl ToString) -> TelemetryError {
        TelemetryError::TransportLost {
            transport: self.name(),
            reason: reason.to_string(),
        }
    }

    fn to_socket_frame(frame: &Frame) -> Option<CanFrame> {
        let id: Id = if frame.is_extended_id {
            ExtendedId::new(frame.arbitration_id)?.into()
        } else {
            StandardId::new(frame.arbitration_id as u16)?.into()
        };
        if frame.is_remote_frame {
            CanFrame::new_remote(id, frame.dlc as usize)
        } else {
            CanFrame::new(id, &frame.data)
        }
    }

    fn from_socket_frame(&self, frame: &CanFrame) -> Frame {
        let is_remote_frame = frame.is_remote_frame();
        let data = if is_remote_frame {
            Vec::new()
        } else {
            frame.data().to_vec()
        };
        let is_extended_id = frame.is_extended();
        let id_mask = if is_extended_id {
            MAX_EXTENDED_ID
        } else {
            MAX_STANDARD_ID
        };
        Frame {
            timestamp: now_seconds(),
            arbitration_id: frame.raw_id() & id_mask,
            is_extended_id,
            channel: Some(Channel::Name(self.interface.clone())),
            dlc: frame.dlc() as u8,
            data,
            is_error_frame: frame.is_error_frame(),
            is_remote_frame,
            is_fd: false,
            bitrate_switch: false,
            error_state_indicator: false,
        }
    }
}

impl CanTransport for SocketCanTransport {
    fn connect(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = CanSocket::open(&self.interface).map_err(|e| TelemetryError::TransportInit {
            transport: self.name(),
            reason: e.to_string(),
        })?;
        log::info!("Opened SocketCAN interface {}", self.interface);
        self.socket = Some(socket);
        self.read_timeout = None;
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.socket.is_some()
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>> {
        let socket = self.socket.as_ref().ok_or_else(|| self.lost("not connected"))?;
        if self.read_timeout != Some(timeout) {
            socket.set_read_timeout(timeout).map_err(|e| self.lost(e))?;
            self.read_timeout = Some(timeout);
        }

        match socket.read_frame() {
            Ok(frame) => Ok(Some(self.from_socket_frame(&frame))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(None)
            }
            Err(e) => Err(self.lost(e)),
        }
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        frame.validate()?;
        let socket = self.socket.as_ref().ok_or_else(|| self.lost("not connected"))?;
        let out = Self::to_socket_frame(frame).ok_or_else(|| {
            TelemetryError::InvalidFrame(format!("cannot encode frame 0x{:X}", frame.arbitration_id))
        })?;
        socket.write_frame(&out).map_err(|e| self.lost(e))
    }

    fn set_filters(&mut self, filters: &[HardwareFilter]) -> Result<()> {
        let socket = self.socket.as_ref().ok_or_else(|| self.lost("not connected"))?;
        if filters.is_empty() {
            return Ok(());
        }
        let can_filters: Vec<CanFilter> = filters
            .iter()
            .map(|f| {
                let mut id = f.can_id;
                let mut mask = f.can_mask;
                if let Some(extended) = f.extended {
                    mask |= libc_flags::CAN_EFF_FLAG;
                    if extended {
                        id |= libc_flags::CAN_EFF_FLAG;
                    }
                }
                CanFilter::new(id, mask)
            })
            .collect();
        socket
            .set_filters(&can_filters)
            .map_err(|e| TelemetryError::TransportInit {
                transport: self.name(),
                reason: format!("failed to install filters: {}", e),
            })
    }

    fn shutdown(&mut self) {
        if self.socket.take().is_some() {
            log::info!("Closed SocketCAN interface {}", self.interface);
        }
    }
}

mod libc_flags {
    /// Extended frame format flag in a raw SocketCAN id word
    pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
}
