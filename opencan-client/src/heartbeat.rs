//! Heartbeat consumer with per-node deadline watchdogs
//!
//! A watch is installed per node with [`HeartbeatMonitor::monitor`]. The
//! consumer records each heartbeat it sees for a watched node, and a shared
//! check timer flips a node to dead once its deadline passes without one.
//! Exactly one [`HeartbeatEvent::Timeout`] fires per alive-to-dead
//! transition; a later heartbeat re-arms the watch.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use opencan_common::constants::cob_ids;
use opencan_common::messages::{Heartbeat, NmtState};
use opencan_common::NodeId;

use crate::bus::SharedReceiverChannel;

/// The default interval of the shared deadline check
///
/// Must be shorter than the smallest watched timeout for that timeout to be
/// observed promptly.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// The monitoring state of one watched node
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatWatch {
    /// The deadline for this node
    pub timeout: Duration,
    /// The state announced by the last heartbeat
    pub last_state: NmtState,
    /// When the last heartbeat arrived
    pub last_rx: Option<Instant>,
    /// Whether the node is currently considered alive
    pub alive: bool,
}

impl HeartbeatWatch {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_state: NmtState::Unknown,
            last_rx: None,
            alive: false,
        }
    }
}

/// Events produced by the heartbeat consumer
#[derive(Debug, Clone, Copy)]
pub enum HeartbeatEvent {
    /// A heartbeat arrived for a watched node
    Received {
        /// The producing node
        node: u8,
        /// The announced state
        state: NmtState,
        /// When the frame was received
        timestamp: Instant,
    },
    /// A watched node missed its deadline
    Timeout {
        /// The silent node
        node: u8,
        /// The last state it announced
        last_state: NmtState,
        /// How long the node had been silent when the check fired
        elapsed: Duration,
    },
}

/// Consumes heartbeat frames and raises deadline timeouts per watched node
#[derive(Debug)]
pub struct HeartbeatMonitor {
    watches: Arc<Mutex<HashMap<u8, HeartbeatWatch>>>,
    events: broadcast::Sender<HeartbeatEvent>,
    rx_task: JoinHandle<()>,
    check_task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Start the consumer with the default check interval
    pub fn new(receiver: SharedReceiverChannel) -> Self {
        Self::with_check_interval(receiver, DEFAULT_CHECK_INTERVAL)
    }

    /// Start the consumer with a custom check interval
    pub fn with_check_interval(
        mut receiver: SharedReceiverChannel,
        check_interval: Duration,
    ) -> Self {
        let watches: Arc<Mutex<HashMap<u8, HeartbeatWatch>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(64);

        let rx_task = {
            let watches = watches.clone();
            let events = events.clone();
            tokio::spawn(async move {
                while let Ok(frame) = receiver.recv().await {
                    let raw = frame.id().raw();
                    if !(cob_ids::HEARTBEAT_BASE + 1..=cob_ids::HEARTBEAT_BASE + 0x7F)
                        .contains(&raw)
                    {
                        continue;
                    }
                    let heartbeat = match Heartbeat::try_from(&frame) {
                        Ok(heartbeat) => heartbeat,
                        Err(e) => {
                            log::warn!("Dropping malformed heartbeat on {}: {e}", frame.id());
                            continue;
                        }
                    };
                    let timestamp = frame.timestamp().unwrap_or_else(Instant::now);
                    let watched = {
                        let mut watches = watches.lock().unwrap();
                        match watches.get_mut(&heartbeat.node) {
                            Some(watch) => {
                                watch.last_state = heartbeat.state;
                                watch.last_rx = Some(timestamp);
                                watch.alive = true;
                                true
                            }
                            None => false,
                        }
                    };
                    if watched {
                        events
                            .send(HeartbeatEvent::Received {
                                node: heartbeat.node,
                                state: heartbeat.state,
                                timestamp,
                            })
                            .ok();
                    }
                }
            })
        };

        let check_task = {
            let watches = watches.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(check_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    let now = Instant::now();
                    let mut expired = Vec::new();
                    {
                        let mut watches = watches.lock().unwrap();
                        for (node, watch) in watches.iter_mut() {
                            if !watch.alive {
                                continue;
                            }
                            let Some(last_rx) = watch.last_rx else {
                                continue;
                            };
                            let elapsed = now.saturating_duration_since(last_rx);
                            if elapsed > watch.timeout {
                                watch.alive = false;
                                expired.push(HeartbeatEvent::Timeout {
                                    node: *node,
                                    last_state: watch.last_state,
                                    elapsed,
                                });
                            }
                        }
                    }
                    for event in expired {
                        events.send(event).ok();
                    }
                }
            })
        };

        Self {
            watches,
            events,
            rx_task,
            check_task,
        }
    }

    /// Install or replace the watch for a node
    pub fn monitor(&self, node: NodeId, timeout: Duration) {
        self.watches
            .lock()
            .unwrap()
            .insert(node.raw(), HeartbeatWatch::new(timeout));
    }

    /// Remove the watch for a node
    pub fn stop(&self, node: NodeId) {
        self.watches.lock().unwrap().remove(&node.raw());
    }

    /// The current watch state for a node, if one is installed
    pub fn watch(&self, node: NodeId) -> Option<HeartbeatWatch> {
        self.watches.lock().unwrap().get(&node.raw()).copied()
    }

    /// Subscribe to heartbeat and timeout events
    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatEvent> {
        self.events.subscribe()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.rx_task.abort();
        self.check_task.abort();
    }
}
