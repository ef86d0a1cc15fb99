//! Expedited SDO client
//!
//! Performs CiA 301 expedited uploads and downloads against a single server
//! node. Requests are correlated with responses through a pending table keyed
//! by object address, so transfers against different objects may be in flight
//! concurrently while each object is limited to one outstanding request.
//!
//! When the response deadline elapses the client transmits a best-effort
//! Abort SDO before surfacing [`SdoClientError::Timeout`]. If a caller
//! cancels a transfer by dropping its future, the pending entry is removed
//! but no abort is transmitted.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use opencan_common::constants::{sdo_request_id, sdo_response_id};
use opencan_common::sdo::{AbortCode, RawAbortCode, SdoRequest, SdoResponse};
use opencan_common::{AsyncCanSender, CanId, NodeId, ObjectAddress, TransportError};

use crate::bus::{SharedReceiverChannel, SharedSender};

/// The default deadline for a server response
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Errors surfaced by SDO transfers
#[derive(Debug, PartialEq, Snafu)]
pub enum SdoClientError {
    /// The transport failed while sending the request
    #[snafu(display("transport failure during SDO transfer: {source}"))]
    Transport {
        /// The underlying transport error
        source: TransportError,
    },
    /// The server aborted the transfer
    #[snafu(display("server aborted the transfer: {abort_code}"))]
    ServerAbort {
        /// The abort code sent by the server
        abort_code: RawAbortCode,
    },
    /// No response arrived before the deadline
    #[snafu(display("no response for {index:#06x}:{sub:02x} within {timeout:?}"))]
    Timeout {
        /// Index of the attempted object
        index: u16,
        /// Sub-index of the attempted object
        sub: u8,
        /// The deadline that elapsed
        timeout: Duration,
    },
    /// Another request for the same object is already awaiting its response
    #[snafu(display("a request for {index:#06x}:{sub:02x} is already in flight"))]
    RequestInFlight {
        /// Index of the contested object
        index: u16,
        /// Sub-index of the contested object
        sub: u8,
    },
    /// The server replied with a segmented transfer
    #[snafu(display("server replied with a segmented transfer, which is not supported"))]
    UnsupportedTransfer,
    /// The data length is outside the expedited range
    #[snafu(display("expedited transfers carry 1-4 bytes, got {len}"))]
    InvalidDataLength {
        /// The rejected length
        len: usize,
    },
    /// The server sent a response of the wrong type for the pending request
    #[snafu(display("unexpected response type for the pending request"))]
    UnexpectedResponse,
    /// The client's reader has shut down
    #[snafu(display("the SDO client has shut down"))]
    ClientClosed,
}

type Result<T> = std::result::Result<T, SdoClientError>;

#[derive(Debug)]
struct PendingEntry {
    seq: u64,
    completion: oneshot::Sender<SdoResponse>,
}

type PendingTable = Arc<Mutex<HashMap<ObjectAddress, PendingEntry>>>;

/// Removes the pending entry on every exit path, including cancellation.
///
/// The sequence check keeps a late-running guard from evicting an entry that
/// a newer request registered after ours completed.
struct PendingGuard {
    pending: PendingTable,
    addr: ObjectAddress,
    seq: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut table = self.pending.lock().unwrap();
        if table.get(&self.addr).is_some_and(|e| e.seq == self.seq) {
            table.remove(&self.addr);
        }
    }
}

/// An expedited SDO client bound to one server node
///
/// The client subscribes to the server's response COB-ID and correlates each
/// response with the pending request for the same object address. It is
/// usable from multiple tasks through `&self`.
#[derive(Debug)]
pub struct SdoClient<S: AsyncCanSender> {
    node_id: NodeId,
    req_cob_id: CanId,
    sender: SharedSender<S>,
    pending: PendingTable,
    timeout: Duration,
    next_seq: AtomicU64,
    decode_errors: Arc<AtomicU64>,
    reader_task: JoinHandle<()>,
}

impl<S: AsyncCanSender + 'static> SdoClient<S> {
    /// Create a client for `node_id` with the default response timeout
    pub fn new(node_id: NodeId, sender: SharedSender<S>, receiver: SharedReceiverChannel) -> Self {
        Self::with_timeout(node_id, sender, receiver, DEFAULT_RESPONSE_TIMEOUT)
    }

    /// Create a client for `node_id` with a custom response timeout
    pub fn with_timeout(
        node_id: NodeId,
        sender: SharedSender<S>,
        mut receiver: SharedReceiverChannel,
        timeout: Duration,
    ) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let decode_errors = Arc::new(AtomicU64::new(0));
        let resp_cob_id = sdo_response_id(node_id);

        let reader_task = {
            let pending = pending.clone();
            let decode_errors = decode_errors.clone();
            tokio::spawn(async move {
                while let Ok(frame) = receiver.recv().await {
                    if frame.id() != resp_cob_id || frame.data().len() < 8 {
                        continue;
                    }
                    let response = match SdoResponse::try_from(&frame) {
                        Ok(response) => response,
                        Err(e) => {
                            // Decode errors never surface to callers; they
                            // are counted and dropped
                            decode_errors.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropping malformed SDO response on {resp_cob_id}: {e}");
                            continue;
                        }
                    };
                    let completion = {
                        let mut table = pending.lock().unwrap();
                        table.remove(&response.address()).map(|e| e.completion)
                    };
                    match completion {
                        Some(completion) => {
                            // The request task may have timed out concurrently
                            completion.send(response).ok();
                        }
                        None => {
                            // No pending request: the response belongs to a
                            // sibling client or a canceled transfer
                            log::debug!("Unmatched SDO response for {}", response.address());
                        }
                    }
                }
            })
        };

        Self {
            node_id,
            req_cob_id: sdo_request_id(node_id),
            sender,
            pending,
            timeout,
            next_seq: AtomicU64::new(0),
            decode_errors,
            reader_task,
        }
    }

    /// The number of inbound frames dropped because they failed to decode
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// The server node this client talks to
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The number of requests currently awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Read the value of an object from the server
    ///
    /// Returns the 1-4 data bytes the server provided.
    pub async fn upload(&self, index: u16, sub: u8) -> Result<Vec<u8>> {
        let (completion, _guard) = self.register(index, sub)?;

        let frame = SdoRequest::initiate_upload(index, sub).to_frame(self.req_cob_id);
        self.sender
            .clone()
            .send(frame)
            .await
            .context(TransportSnafu)?;

        match self.wait_for_response(index, sub, completion).await? {
            SdoResponse::ConfirmUpload { n, e, data, .. } => {
                if !e {
                    return UnsupportedTransferSnafu.fail();
                }
                let len = 4 - (n & 0x3) as usize;
                Ok(data[..len].to_vec())
            }
            SdoResponse::Abort { abort_code, .. } => ServerAbortSnafu {
                abort_code: RawAbortCode::from(abort_code),
            }
            .fail(),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    /// Write a value of 1-4 bytes to an object on the server
    pub async fn download(&self, index: u16, sub: u8, data: &[u8]) -> Result<()> {
        if data.is_empty() || data.len() > 4 {
            return InvalidDataLengthSnafu { len: data.len() }.fail();
        }
        let (completion, _guard) = self.register(index, sub)?;

        let frame = SdoRequest::expedited_download(index, sub, data).to_frame(self.req_cob_id);
        self.sender
            .clone()
            .send(frame)
            .await
            .context(TransportSnafu)?;

        match self.wait_for_response(index, sub, completion).await? {
            SdoResponse::ConfirmDownload { .. } => Ok(()),
            SdoResponse::Abort { abort_code, .. } => ServerAbortSnafu {
                abort_code: RawAbortCode::from(abort_code),
            }
            .fail(),
            _ => UnexpectedResponseSnafu.fail(),
        }
    }

    /// Install a pending entry for the object, enforcing single-flight
    fn register(
        &self,
        index: u16,
        sub: u8,
    ) -> Result<(oneshot::Receiver<SdoResponse>, PendingGuard)> {
        let addr = ObjectAddress::new(index, sub);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut table = self.pending.lock().unwrap();
        match table.entry(addr) {
            Entry::Occupied(_) => RequestInFlightSnafu { index, sub }.fail(),
            Entry::Vacant(slot) => {
                slot.insert(PendingEntry {
                    seq,
                    completion: tx,
                });
                Ok((
                    rx,
                    PendingGuard {
                        pending: self.pending.clone(),
                        addr,
                        seq,
                    },
                ))
            }
        }
    }

    async fn wait_for_response(
        &self,
        index: u16,
        sub: u8,
        completion: oneshot::Receiver<SdoResponse>,
    ) -> Result<SdoResponse> {
        match tokio::time::timeout(self.timeout, completion).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => ClientClosedSnafu.fail(),
            Err(_) => {
                self.abort_transfer(index, sub).await;
                TimeoutSnafu {
                    index,
                    sub,
                    timeout: self.timeout,
                }
                .fail()
            }
        }
    }

    /// Tell the server we gave up on the transfer. Best effort only; the
    /// timeout is surfaced to the caller regardless.
    async fn abort_transfer(&self, index: u16, sub: u8) {
        let frame = SdoRequest::abort(index, sub, AbortCode::SdoTimeout).to_frame(self.req_cob_id);
        if let Err(e) = self.sender.clone().send(frame).await {
            log::warn!("Failed to send SDO abort for {index:#06x}:{sub:02x}: {e}");
        }
    }
}

impl<S: AsyncCanSender> Drop for SdoClient<S> {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
