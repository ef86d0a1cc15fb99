//! Common functionality shared among the opencan crates.
//!
//! This crate holds the wire-level pieces of the stack: the [`CanFrame`] and
//! [`CanId`] types, codecs for the DS-301 services (NMT, SYNC, EMCY,
//! Heartbeat, SDO), the SDO abort code table, and the transport traits which
//! the client stack is written against.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by `opencan-client`.
#![warn(missing_docs, missing_copy_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod constants;
pub mod messages;
pub mod node_id;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
pub use socketcan::{open_socketcan, SocketCanReceiver, SocketCanSender};

pub use messages::{CanFrame, CanId, MessageError};
pub use node_id::NodeId;
pub use sdo::ObjectAddress;
pub use traits::{AsyncCanReceiver, AsyncCanSender, TransportError};
