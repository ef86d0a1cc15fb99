//! Simple interface for sending NMT commands to a bus
//!
//! NMT commands are fire-and-forget: no response is defined, and the
//! commanded node announces its new state through its heartbeat.
use opencan_common::messages::{NmtCommand, NmtCommandSpecifier};
use opencan_common::{AsyncCanSender, NodeId, TransportError};

use crate::bus::SharedSender;

/// A stateless NMT master which commands node state changes
#[derive(Debug)]
pub struct NmtMaster<S: AsyncCanSender> {
    sender: SharedSender<S>,
}

impl<S: AsyncCanSender> Clone for NmtMaster<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: AsyncCanSender> NmtMaster<S> {
    /// Create a new NmtMaster
    pub fn new(sender: SharedSender<S>) -> Self {
        Self { sender }
    }

    /// Send start operation command to a node
    pub async fn start(&self, node: NodeId) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::Start, node.raw()).await
    }

    /// Send stop command to a node
    pub async fn stop(&self, node: NodeId) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::Stop, node.raw()).await
    }

    /// Command a node to the pre-operational state
    pub async fn enter_preoperational(&self, node: NodeId) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::EnterPreOperational, node.raw())
            .await
    }

    /// Send application reset command to a node
    pub async fn reset_node(&self, node: NodeId) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::ResetNode, node.raw()).await
    }

    /// Send communications reset command to a node
    pub async fn reset_communication(&self, node: NodeId) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::ResetCommunication, node.raw())
            .await
    }

    /// Send start operation command to all nodes
    pub async fn start_all(&self) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::Start, 0).await
    }

    /// Send stop command to all nodes
    pub async fn stop_all(&self) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::Stop, 0).await
    }

    /// Command all nodes to the pre-operational state
    pub async fn enter_preoperational_all(&self) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::EnterPreOperational, 0).await
    }

    /// Send application reset command to all nodes
    pub async fn reset_all(&self) -> Result<(), TransportError> {
        self.send_command(NmtCommandSpecifier::ResetNode, 0).await
    }

    /// Send an NMT command
    ///
    /// `node` - the target node ID, or 0 to broadcast to all nodes
    pub async fn send_command(
        &self,
        cs: NmtCommandSpecifier,
        node: u8,
    ) -> Result<(), TransportError> {
        let message = NmtCommand { cs, node };
        self.sender.clone().send(message.into()).await
    }
}
