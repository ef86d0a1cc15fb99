//! A scriptable stand-in for a CANopen server node
//!
//! The mock answers expedited SDO requests out of an in-memory object store,
//! can be scripted to abort specific objects or go silent entirely, and can
//! emit heartbeat and emergency frames on demand. Received client aborts are
//! recorded for inspection.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use opencan_common::constants::sdo_request_id;
use opencan_common::messages::{EmcyMessage, ErrorRegister, Heartbeat, NmtState};
use opencan_common::sdo::{AbortCode, SdoRequest, SdoResponse};
use opencan_common::{AsyncCanReceiver, AsyncCanSender, NodeId, ObjectAddress};

use crate::sim_bus::{SimBus, SimBusSender};

#[derive(Debug, Default)]
struct MockState {
    store: HashMap<ObjectAddress, Vec<u8>>,
    aborts: HashMap<ObjectAddress, AbortCode>,
    received_aborts: Vec<(ObjectAddress, u32)>,
}

/// A mock SDO/heartbeat/EMCY server attached to a [`SimBus`]
#[derive(Debug)]
pub struct MockNode {
    node_id: NodeId,
    state: Arc<Mutex<MockState>>,
    silent: Arc<AtomicBool>,
    sender: SimBusSender,
    task: JoinHandle<()>,
}

impl MockNode {
    /// Attach a mock node to the bus and start serving SDO requests
    pub fn spawn(node_id: NodeId, bus: &SimBus) -> Self {
        let state: Arc<Mutex<MockState>> = Arc::new(Mutex::new(MockState::default()));
        let silent = Arc::new(AtomicBool::new(false));
        let sender = bus.new_sender();
        let mut receiver = bus.new_receiver();

        let task = {
            let state = state.clone();
            let silent = silent.clone();
            let mut sender = bus.new_sender();
            let req_id = sdo_request_id(node_id);
            let resp_id = opencan_common::constants::sdo_response_id(node_id);
            tokio::spawn(async move {
                while let Ok(frame) = receiver.recv().await {
                    if frame.id() != req_id {
                        continue;
                    }
                    let request = match SdoRequest::try_from(&frame) {
                        Ok(request) => request,
                        Err(e) => {
                            log::debug!("Mock node ignoring malformed request: {e}");
                            continue;
                        }
                    };
                    let response = {
                        let mut state = state.lock().unwrap();
                        match request {
                            SdoRequest::InitiateUpload { index, sub } => {
                                let addr = ObjectAddress::new(index, sub);
                                if let Some(code) = state.aborts.get(&addr) {
                                    Some(SdoResponse::abort(index, sub, *code))
                                } else {
                                    match state.store.get(&addr) {
                                        Some(data) => {
                                            let len = data.len().min(4);
                                            Some(SdoResponse::expedited_upload(
                                                index,
                                                sub,
                                                &data[..len],
                                            ))
                                        }
                                        None => Some(SdoResponse::abort(
                                            index,
                                            sub,
                                            AbortCode::NoSuchObject,
                                        )),
                                    }
                                }
                            }
                            SdoRequest::InitiateDownload {
                                n,
                                e,
                                index,
                                sub,
                                data,
                                ..
                            } => {
                                let addr = ObjectAddress::new(index, sub);
                                if let Some(code) = state.aborts.get(&addr) {
                                    Some(SdoResponse::abort(index, sub, *code))
                                } else if !e {
                                    Some(SdoResponse::abort(
                                        index,
                                        sub,
                                        AbortCode::InvalidCommandSpecifier,
                                    ))
                                } else {
                                    let len = 4 - (n & 0x3) as usize;
                                    state.store.insert(addr, data[..len].to_vec());
                                    Some(SdoResponse::download_acknowledge(index, sub))
                                }
                            }
                            SdoRequest::Abort {
                                index,
                                sub,
                                abort_code,
                            } => {
                                state
                                    .received_aborts
                                    .push((ObjectAddress::new(index, sub), abort_code));
                                None
                            }
                        }
                    };
                    // A silent node processes requests but never answers them
                    if silent.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Some(response) = response {
                        sender.send(response.to_frame(resp_id)).await.ok();
                    }
                }
            })
        };

        Self {
            node_id,
            state,
            silent,
            sender,
            task,
        }
    }

    /// The node ID this mock serves
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Preload an object value
    pub fn set(&self, index: u16, sub: u8, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .store
            .insert(ObjectAddress::new(index, sub), data.to_vec());
    }

    /// Read back an object value written by a client
    pub fn get(&self, index: u16, sub: u8) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .store
            .get(&ObjectAddress::new(index, sub))
            .cloned()
    }

    /// Script an abort for all accesses to one object
    pub fn abort_on(&self, index: u16, sub: u8, code: AbortCode) {
        self.state
            .lock()
            .unwrap()
            .aborts
            .insert(ObjectAddress::new(index, sub), code);
    }

    /// Make the node stop answering entirely (a "null server")
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::Relaxed);
    }

    /// Client aborts the node has received, in arrival order
    pub fn received_aborts(&self) -> Vec<(ObjectAddress, u32)> {
        self.state.lock().unwrap().received_aborts.clone()
    }

    /// Emit one heartbeat announcing `state`
    pub async fn emit_heartbeat(&self, state: NmtState) {
        let heartbeat = Heartbeat {
            node: self.node_id.raw(),
            state,
        };
        self.sender.clone().send(heartbeat.into()).await.unwrap();
    }

    /// Emit one emergency frame
    pub async fn emit_emcy(&self, error_code: u16, error_register: u8, manufacturer: [u8; 5]) {
        let emcy = EmcyMessage {
            node: self.node_id.raw(),
            error_code,
            error_register: ErrorRegister(error_register),
            manufacturer,
        };
        self.sender.clone().send(emcy.into()).await.unwrap();
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}
