use std::sync::Arc;
use std::time::Instant;

use socketcan::{tokio::CanSocket, CanFilter, EmbeddedFrame, Frame, ShouldRetry, SocketOptions};

use crate::messages::{CanFrame, CanId};
use crate::traits::{AsyncCanReceiver, AsyncCanSender, TransportError};

fn socketcan_frame_to_frame(frame: socketcan::CanFrame) -> Option<CanFrame> {
    let id = match frame.can_id() {
        socketcan::CanId::Standard(id) => CanId::masked(id.as_raw()),
        // 29-bit identifiers are not used by this stack
        socketcan::CanId::Extended(_) => return None,
    };

    match frame {
        socketcan::CanFrame::Data(frame) => match CanFrame::new(id, frame.data()) {
            Ok(msg) => Some(msg.with_timestamp(Instant::now())),
            Err(_) => None,
        },
        // RTR is unsupported; error frames are skipped and logged
        socketcan::CanFrame::Remote(_) => None,
        socketcan::CanFrame::Error(frame) => {
            log::warn!("CAN error frame received: {frame:?}");
            None
        }
    }
}

fn frame_to_socketcan_frame(frame: &CanFrame) -> Result<socketcan::CanFrame, TransportError> {
    let id = socketcan::StandardId::new(frame.id().raw()).ok_or_else(|| TransportError::Io {
        details: format!("identifier {} is not a standard ID", frame.id()),
    })?;
    socketcan::CanFrame::new(id, frame.data()).ok_or_else(|| TransportError::Io {
        details: "frame construction failed".to_string(),
    })
}

/// Receiving half of a socketcan interface
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<CanSocket>,
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = TransportError;

    async fn recv(&mut self) -> Result<CanFrame, TransportError> {
        loop {
            match self.socket.read_frame().await {
                Ok(frame) => {
                    if let Some(msg) = socketcan_frame_to_frame(frame) {
                        return Ok(msg);
                    }
                }
                Err(e) => {
                    if !e.should_retry() {
                        return Err(TransportError::Io {
                            details: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn try_recv(&mut self) -> Option<CanFrame> {
        // The async socket has no non-blocking read; poll via recv() instead
        None
    }
}

/// Sending half of a socketcan interface
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<CanSocket>,
}

impl AsyncCanSender for SocketCanSender {
    async fn send(&mut self, frame: CanFrame) -> Result<(), TransportError> {
        let socketcan_frame = frame_to_socketcan_frame(&frame)?;
        self.socket
            .write_frame(socketcan_frame)
            .await
            .map_err(|e| TransportError::Io {
                details: e.to_string(),
            })
    }
}

/// Open a socketcan device and split it into a sender and receiver object
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0", or "can0"
/// * `filters` - Optional kernel-level receive filters
///
/// A key benefit of this is that by creating both sender and receiver objects
/// from a shared socket, the receiver will not receive messages sent by the
/// sender. Dropping both halves closes the socket.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
    filters: Option<&[CanFilter]>,
) -> Result<(SocketCanSender, SocketCanReceiver), TransportError> {
    let device: &str = device.as_ref();
    let socket = CanSocket::open(device).map_err(|e| TransportError::Io {
        details: e.to_string(),
    })?;
    if let Some(socket_filters) = filters {
        socket
            .set_filters(socket_filters)
            .map_err(|e| TransportError::Io {
                details: e.to_string(),
            })?;
    }
    let socket = Arc::new(socket);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}
