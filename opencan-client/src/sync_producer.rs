//! Periodic SYNC producer
//!
//! Emits the 0x080 SYNC frame on a timer, optionally carrying the one-byte
//! cycle counter. Send failures are logged and do not stop the timer.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use opencan_common::messages::SyncMessage;
use opencan_common::AsyncCanSender;

use crate::bus::SharedSender;

/// The smallest supported SYNC period
pub const MIN_SYNC_PERIOD: Duration = Duration::from_millis(1);

/// The largest SYNC counter value before wrapping back to 1
const COUNTER_WRAP: u8 = 240;

/// Produces periodic SYNC frames on COB-ID 0x080
///
/// In counter mode the counter is pre-incremented before each send, cycling
/// through 1-240, and resets to zero whenever the producer is stopped.
#[derive(Debug)]
pub struct SyncProducer<S: AsyncCanSender + 'static> {
    sender: SharedSender<S>,
    period: Duration,
    counter_enabled: bool,
    counter: Arc<AtomicU8>,
    task: Option<JoinHandle<()>>,
}

impl<S: AsyncCanSender + 'static> SyncProducer<S> {
    /// Create a producer emitting empty SYNC frames
    ///
    /// Periods below [`MIN_SYNC_PERIOD`] are clamped up to it.
    pub fn new(sender: SharedSender<S>, period: Duration) -> Self {
        if period < MIN_SYNC_PERIOD {
            log::warn!("SYNC period {period:?} clamped to {MIN_SYNC_PERIOD:?}");
        }
        Self {
            sender,
            period: period.max(MIN_SYNC_PERIOD),
            counter_enabled: false,
            counter: Arc::new(AtomicU8::new(0)),
            task: None,
        }
    }

    /// Create a producer emitting SYNC frames with the cycle counter
    pub fn with_counter(sender: SharedSender<S>, period: Duration) -> Self {
        let mut producer = Self::new(sender, period);
        producer.counter_enabled = true;
        producer
    }

    /// The configured period
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the timer is currently running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start producing SYNC frames
    ///
    /// Starting a running producer restarts it: the timer is stopped, the
    /// counter zeroed, and a fresh cycle begins.
    pub fn start(&mut self) {
        self.stop();

        let mut sender = self.sender.clone();
        let counter = self.counter.clone();
        let counter_enabled = self.counter_enabled;
        let period = self.period;

        self.task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; the cycle starts now
            loop {
                interval.tick().await;
                let count = counter_enabled.then(|| {
                    let current = counter.load(Ordering::Relaxed);
                    let next = if current >= COUNTER_WRAP { 1 } else { current + 1 };
                    counter.store(next, Ordering::Relaxed);
                    next
                });
                let message = SyncMessage { counter: count };
                // A failed send must not kill the timer
                if let Err(e) = sender.send(message.into()).await {
                    log::warn!("SYNC send failed: {e}");
                }
            }
        }));
    }

    /// Stop producing SYNC frames and reset the counter
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.counter.store(0, Ordering::Relaxed);
    }
}

impl<S: AsyncCanSender + 'static> Drop for SyncProducer<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
