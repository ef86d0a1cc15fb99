//! Utility for sharing a single transport sender among services
use std::sync::Arc;

use tokio::sync::Mutex;

use opencan_common::{AsyncCanSender, CanFrame, TransportError};

/// A cloneable handle on a single underlying [`AsyncCanSender`]
///
/// Sends are serialized through an async mutex; a send never blocks another
/// send for longer than one frame submission.
#[derive(Debug)]
pub struct SharedSender<S: AsyncCanSender> {
    inner: Arc<Mutex<S>>,
}

impl<S: AsyncCanSender> Clone for SharedSender<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: AsyncCanSender> SharedSender<S> {
    /// Wrap a transport sender for shared use
    pub fn new(sender: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sender)),
        }
    }

    async fn send(&mut self, frame: CanFrame) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        inner.send(frame).await
    }
}

impl<S: AsyncCanSender> AsyncCanSender for SharedSender<S> {
    fn send(
        &mut self,
        frame: CanFrame,
    ) -> impl core::future::Future<Output = Result<(), TransportError>> + Send {
        self.send(frame)
    }
}
