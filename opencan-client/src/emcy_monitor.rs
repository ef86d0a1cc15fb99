//! Emergency (EMCY) monitor
//!
//! Decodes inbound emergency frames and retains the most recent record per
//! producing node. Live subscribers receive every decoded emergency;
//! clearing stored records does not affect them.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use opencan_common::constants::cob_ids;
use opencan_common::messages::{EmcyMessage, ErrorRegister};
use opencan_common::NodeId;

use crate::bus::SharedReceiverChannel;

/// A received emergency, stamped with its arrival time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyRecord {
    /// The producing node
    pub node: u8,
    /// The DS-301 emergency error code
    pub error_code: u16,
    /// The node's error register at the time of the event
    pub error_register: ErrorRegister,
    /// Manufacturer specific payload bytes
    pub manufacturer: [u8; 5],
    /// When the frame was received
    pub timestamp: Instant,
}

impl EmcyRecord {
    fn new(message: EmcyMessage, timestamp: Instant) -> Self {
        Self {
            node: message.node,
            error_code: message.error_code,
            error_register: message.error_register,
            manufacturer: message.manufacturer,
            timestamp,
        }
    }
}

/// Watches the emergency COB-ID range and retains the latest record per node
#[derive(Debug)]
pub struct EmcyMonitor {
    latest: Arc<Mutex<HashMap<u8, EmcyRecord>>>,
    events: broadcast::Sender<EmcyRecord>,
    rx_task: JoinHandle<()>,
}

impl EmcyMonitor {
    /// Start monitoring emergencies on the given subscription
    pub fn new(mut receiver: SharedReceiverChannel) -> Self {
        let latest: Arc<Mutex<HashMap<u8, EmcyRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(64);

        let rx_task = {
            let latest = latest.clone();
            let events = events.clone();
            tokio::spawn(async move {
                while let Ok(frame) = receiver.recv().await {
                    let raw = frame.id().raw();
                    // Bare 0x080 is SYNC, not an emergency
                    if !(cob_ids::EMCY_BASE + 1..=cob_ids::EMCY_BASE + 0x7F).contains(&raw) {
                        continue;
                    }
                    let message = match EmcyMessage::try_from(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            log::warn!("Dropping malformed EMCY frame on {}: {e}", frame.id());
                            continue;
                        }
                    };
                    let record =
                        EmcyRecord::new(message, frame.timestamp().unwrap_or_else(Instant::now));
                    latest.lock().unwrap().insert(record.node, record);
                    events.send(record).ok();
                }
            })
        };

        Self {
            latest,
            events,
            rx_task,
        }
    }

    /// The most recent emergency received from a node, if any
    pub fn latest(&self, node: NodeId) -> Option<EmcyRecord> {
        self.latest.lock().unwrap().get(&node.raw()).copied()
    }

    /// All retained records, ordered by node ID
    pub fn all(&self) -> Vec<EmcyRecord> {
        let mut records: Vec<EmcyRecord> = self.latest.lock().unwrap().values().copied().collect();
        records.sort_by_key(|r| r.node);
        records
    }

    /// Drop the stored record for a node
    pub fn clear(&self, node: NodeId) {
        self.latest.lock().unwrap().remove(&node.raw());
    }

    /// Drop all stored records
    pub fn clear_all(&self) {
        self.latest.lock().unwrap().clear();
    }

    /// Subscribe to emergencies as they arrive
    pub fn subscribe(&self) -> broadcast::Receiver<EmcyRecord> {
        self.events.subscribe()
    }
}

impl Drop for EmcyMonitor {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}
