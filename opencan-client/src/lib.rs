//! A client stack for communicating with CANopen nodes
//!
//! The crate provides the CiA 301 client services, all multiplexed over a
//! single CAN transport:
//!
//! - An [SDO client](SdoClient) for reading/writing a node's object
//!   dictionary via expedited transfers, with per-object request correlation
//!   and timeouts
//! - A [PDO manager](PdoManager) holding TPDO/RPDO configurations,
//!   dispatching received PDOs by COB-ID and extracting mapped values
//! - An [NMT master](NmtMaster) for commanding node state changes
//! - A [heartbeat consumer](HeartbeatMonitor) with per-node deadline
//!   watchdogs
//! - An [emergency monitor](EmcyMonitor) retaining the latest EMCY record
//!   per node
//! - A [SYNC producer](SyncProducer)
//! - A [`Device`] facade binding one node ID to an instance of each service
//! - A [`NodeConfig`] TOML file format for describing and applying PDO
//!   configurations
//!
//! This library is based on tokio/async. The transport is abstracted behind
//! the `AsyncCanSender`/`AsyncCanReceiver` traits from `opencan-common`;
//! enable the `socketcan` feature for a Linux socketcan implementation.
#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bus;
mod device;
mod emcy_monitor;
mod heartbeat;
mod nmt_master;
mod node_config;
mod pdo;
mod sdo_client;
mod sync_producer;

pub use opencan_common as common;

pub use device::{Device, DeviceConfig, DeviceError};
pub use emcy_monitor::{EmcyMonitor, EmcyRecord};
pub use heartbeat::{
    HeartbeatEvent, HeartbeatMonitor, HeartbeatWatch, DEFAULT_CHECK_INTERVAL,
};
pub use nmt_master::NmtMaster;
pub use node_config::{NodeConfig, NodeConfigError};
pub use pdo::{
    ConfigError, PdoConfig, PdoData, PdoError, PdoManager, PdoMapping, PDO_BIT_LIMIT,
};
pub use sdo_client::{SdoClient, SdoClientError, DEFAULT_RESPONSE_TIMEOUT};
pub use sync_producer::{SyncProducer, MIN_SYNC_PERIOD};
