//! A simulated CAN bus
//!
//! Every frame sent by any sender is delivered, stamped, to every receiver on
//! the bus, in send order. The bus also models the transport connection
//! contract: while disconnected, sends fail with
//! [`TransportError::NotConnected`].
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};

use opencan_common::{AsyncCanReceiver, AsyncCanSender, CanFrame, TransportError};

const QUEUE_SIZE: usize = 100;

#[derive(Debug)]
struct SimBusInner {
    taps: Vec<Sender<CanFrame>>,
    connected: bool,
}

/// A simulated bus which frames can be sent to and received from
#[derive(Debug, Clone)]
pub struct SimBus {
    inner: Arc<Mutex<SimBusInner>>,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    /// Create a new, connected bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimBusInner {
                taps: Vec::new(),
                connected: true,
            })),
        }
    }

    /// Create a sender attached to this bus
    pub fn new_sender(&self) -> SimBusSender {
        SimBusSender {
            inner: self.inner.clone(),
        }
    }

    /// Create a receiver observing every frame on this bus
    pub fn new_receiver(&self) -> SimBusReceiver {
        let (tx, rx) = channel(QUEUE_SIZE);
        self.inner.lock().unwrap().taps.push(tx);
        SimBusReceiver { receiver: rx }
    }

    /// Take the bus down: subsequent sends fail until [`SimBus::connect`]
    pub fn disconnect(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    /// Bring the bus back up
    pub fn connect(&self) {
        self.inner.lock().unwrap().connected = true;
    }
}

/// Sending half of a [`SimBus`] attachment
#[derive(Debug, Clone)]
pub struct SimBusSender {
    inner: Arc<Mutex<SimBusInner>>,
}

impl AsyncCanSender for SimBusSender {
    async fn send(&mut self, frame: CanFrame) -> Result<(), TransportError> {
        let frame = frame.with_timestamp(Instant::now());
        let mut inner = self.inner.lock().unwrap();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        inner.taps.retain(|tap| match tap.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                log::warn!("SimBus dropped a frame due to a full receiver queue");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        Ok(())
    }
}

/// Receiving half of a [`SimBus`] attachment
#[derive(Debug)]
pub struct SimBusReceiver {
    receiver: Receiver<CanFrame>,
}

impl SimBusReceiver {
    /// Discard everything currently queued
    pub fn flush(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = ();

    async fn recv(&mut self) -> Result<CanFrame, Self::Error> {
        self.receiver.recv().await.ok_or(())
    }

    fn try_recv(&mut self) -> Option<CanFrame> {
        self.receiver.try_recv().ok()
    }
}
