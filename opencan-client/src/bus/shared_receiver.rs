//! Utility for fanning one transport receiver out to many services
//!
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::mpsc::error::TrySendError;
use tokio::{
    sync::mpsc::{channel, Receiver, Sender},
    task::JoinHandle,
};

use opencan_common::{AsyncCanReceiver, CanFrame};

/// Error returned when a subscription channel has shut down
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvError;

impl core::fmt::Display for RecvError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "shared receiver has shut down")
    }
}

impl core::error::Error for RecvError {}

#[derive(Debug)]
struct SharedReceiverInner {
    senders: Vec<Sender<CanFrame>>,
}

impl SharedReceiverInner {
    fn create_rx(&mut self) -> Receiver<CanFrame> {
        let (tx, rx) = channel(100);
        self.senders.push(tx);
        rx
    }
}

/// Fans frames from a single transport receiver out to subscription channels
///
/// A background task reads the transport and replicates every frame, stamped
/// on arrival, to each live channel in receive order. Per-channel delivery is
/// serial, so a subscriber never observes interleaved halves of one frame.
/// Dropping the `SharedReceiver` stops the reader task; dropping a channel
/// unsubscribes it.
#[derive(Debug)]
pub struct SharedReceiver {
    task_handle: JoinHandle<()>,
    inner: Arc<Mutex<SharedReceiverInner>>,
}

impl SharedReceiver {
    /// Start fanning out frames from `receiver`
    pub fn new<R: AsyncCanReceiver + 'static>(mut receiver: R) -> Self {
        let inner = Arc::new(Mutex::new(SharedReceiverInner {
            senders: Vec::new(),
        }));
        let inner_clone = inner.clone();
        let task_handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => {
                        let frame = match frame.timestamp() {
                            Some(_) => frame,
                            None => frame.with_timestamp(Instant::now()),
                        };
                        let mut inner = inner_clone.lock().unwrap();
                        inner.senders.retain(|sender| {
                            if let Err(e) = sender.try_send(frame) {
                                return match e {
                                    TrySendError::Full(_) => {
                                        log::warn!("Dropped received frame due to overflow");
                                        true
                                    }
                                    TrySendError::Closed(_) => false,
                                };
                            }
                            true
                        });
                    }
                    Err(e) => {
                        log::warn!("Transport receive failed, stopping fan-out: {e:?}");
                        break;
                    }
                }
            }
        });
        Self {
            task_handle,
            inner,
        }
    }

    /// Create a new subscription channel receiving every inbound frame
    pub fn create_rx(&self) -> SharedReceiverChannel {
        let rx = self.inner.lock().unwrap().create_rx();

        SharedReceiverChannel {
            inner: self.inner.clone(),
            receiver: rx,
        }
    }

    /// Get the number of current receiver channels
    #[allow(dead_code)]
    pub(crate) fn num_channels(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.senders.len()
    }
}

impl Drop for SharedReceiver {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

/// One subscription on a [`SharedReceiver`]
#[derive(Debug)]
pub struct SharedReceiverChannel {
    /// Data shared with the fan-out task
    inner: Arc<Mutex<SharedReceiverInner>>,
    /// Our receive channel
    receiver: Receiver<CanFrame>,
}

impl Clone for SharedReceiverChannel {
    fn clone(&self) -> Self {
        let receiver = self.inner.lock().unwrap().create_rx();
        Self {
            inner: self.inner.clone(),
            receiver,
        }
    }
}

impl SharedReceiverChannel {
    /// Remove any pending frames from the queue
    #[allow(dead_code)]
    pub fn flush(&mut self) {
        while self.receiver.try_recv().is_ok() {}
    }

    /// Receive the next frame
    pub async fn recv(&mut self) -> Result<CanFrame, RecvError> {
        self.receiver.recv().await.ok_or(RecvError)
    }

    /// Return a frame if one is queued
    pub fn try_recv(&mut self) -> Option<CanFrame> {
        self.receiver.try_recv().ok()
    }
}

impl AsyncCanReceiver for SharedReceiverChannel {
    type Error = RecvError;

    fn recv(&mut self) -> impl core::future::Future<Output = Result<CanFrame, Self::Error>> + Send {
        self.recv()
    }

    fn try_recv(&mut self) -> Option<CanFrame> {
        self.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use opencan_common::CanId;

    use super::*;

    struct MockReceiver {
        rx: Receiver<CanFrame>,
    }

    #[derive(Debug)]
    struct MockReceiveError;

    impl AsyncCanReceiver for MockReceiver {
        type Error = MockReceiveError;

        async fn recv(&mut self) -> Result<CanFrame, Self::Error> {
            self.rx.recv().await.ok_or(MockReceiveError)
        }

        fn try_recv(&mut self) -> Option<CanFrame> {
            self.rx.try_recv().ok()
        }
    }

    #[tokio::test]
    async fn test_shared_receiver() {
        let (chan_tx, chan_rx) = channel(8);
        let shared_receiver = SharedReceiver::new(MockReceiver { rx: chan_rx });

        let mut channel_a = shared_receiver.create_rx();
        let mut channel_b = shared_receiver.create_rx();

        let frame = CanFrame::new(CanId::masked(100), &[0, 1, 2, 3]).unwrap();
        chan_tx.send(frame).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(Some(frame), channel_a.try_recv());
        assert_eq!(Some(frame), channel_b.try_recv());
        assert_eq!(None, channel_a.try_recv());

        // Fan-out stamps frames which arrive without a timestamp
        chan_tx.send(frame).await.unwrap();
        let stamped = channel_b.recv().await.unwrap();
        assert!(stamped.timestamp().is_some());

        // Drop a channel, and make sure the channel count goes down after the
        // next frame is processed
        drop(channel_a);
        chan_tx.send(frame).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(1, shared_receiver.num_channels());
    }
}
