//! Transport traits the client stack is written against
//!
//! A concrete transport supplies one sender and one receiver; everything in
//! `opencan-client` is generic over these. The socketcan implementation in
//! this crate is one example; the integration tests provide a simulated bus.
use core::future::Future;

use snafu::Snafu;

use crate::messages::CanFrame;

/// Errors surfaced by a CAN transport
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum TransportError {
    /// The transport is not connected
    #[snafu(display("transport is not connected"))]
    NotConnected,
    /// The underlying interface failed
    #[snafu(display("CAN interface error: {details}"))]
    Io {
        /// Description of the interface failure
        details: String,
    },
}

/// An object which can send frames to a CAN bus
pub trait AsyncCanSender: Send {
    /// Send a single frame
    ///
    /// Fails with [`TransportError::NotConnected`] when the transport is
    /// down, or [`TransportError::Io`] on an interface failure. The frame is
    /// queued for arbitration; delivery is not confirmed at this layer.
    fn send(&mut self, frame: CanFrame) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// An object which can receive frames from a CAN bus
///
/// Frames are delivered in receive order, stamped by the transport.
pub trait AsyncCanReceiver: Send {
    /// The receiver's error type
    type Error: core::fmt::Debug + Send;

    /// Receive the next frame, waiting until one is available
    fn recv(&mut self) -> impl Future<Output = Result<CanFrame, Self::Error>> + Send;

    /// Return a frame if one is immediately available
    fn try_recv(&mut self) -> Option<CanFrame>;
}
