//! Constants for COB-ID allocation and standard object addresses
//!
//!

use crate::messages::CanId;
use crate::node_id::NodeId;

/// COB-ID bases for the standard pre-defined connection set
pub mod cob_ids {
    /// NMT commands are broadcast on ID 0
    pub const NMT: u16 = 0x000;
    /// SYNC messages
    pub const SYNC: u16 = 0x080;
    /// Base ID for emergency messages (node ID is added)
    pub const EMCY_BASE: u16 = 0x080;
    /// Base ID for the first transmit PDO (node ID is added)
    pub const TPDO1_BASE: u16 = 0x180;
    /// Base ID for the first receive PDO (node ID is added)
    pub const RPDO1_BASE: u16 = 0x200;
    /// The base ID for SDO responses, sent server to client (node ID is added)
    pub const SDO_RESP_BASE: u16 = 0x580;
    /// The base ID for SDO requests, sent client to server (node ID is added)
    pub const SDO_REQ_BASE: u16 = 0x600;
    /// Base ID for heartbeat messages (node ID is added)
    pub const HEARTBEAT_BASE: u16 = 0x700;
}

/// Object indices for standard objects
pub mod object_ids {
    /// The device type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The error register object index
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;
    /// First RPDO communication parameter object index
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// First RPDO mapping parameter object index
    pub const RPDO_MAPPING_BASE: u16 = 0x1600;
    /// First TPDO communication parameter object index
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// First TPDO mapping parameter object index
    pub const TPDO_MAPPING_BASE: u16 = 0x1A00;
}

/// The COB-ID a node sends SDO responses on
pub fn sdo_response_id(node: NodeId) -> CanId {
    CanId::masked(cob_ids::SDO_RESP_BASE + node.raw() as u16)
}

/// The COB-ID a node receives SDO requests on
pub fn sdo_request_id(node: NodeId) -> CanId {
    CanId::masked(cob_ids::SDO_REQ_BASE + node.raw() as u16)
}

/// The COB-ID a node produces heartbeats on
pub fn heartbeat_id(node: NodeId) -> CanId {
    CanId::masked(cob_ids::HEARTBEAT_BASE + node.raw() as u16)
}

/// The COB-ID a node produces emergency messages on
pub fn emcy_id(node: NodeId) -> CanId {
    CanId::masked(cob_ids::EMCY_BASE + node.raw() as u16)
}

/// The default COB-ID for transmit PDO `pdo_number` (1-4) of a node
pub fn tpdo_id(pdo_number: u8, node: NodeId) -> Option<CanId> {
    if (1..=4).contains(&pdo_number) {
        let base = cob_ids::TPDO1_BASE + 0x100 * (pdo_number as u16 - 1);
        Some(CanId::masked(base + node.raw() as u16))
    } else {
        None
    }
}

/// The default COB-ID for receive PDO `pdo_number` (1-4) of a node
pub fn rpdo_id(pdo_number: u8, node: NodeId) -> Option<CanId> {
    if (1..=4).contains(&pdo_number) {
        let base = cob_ids::RPDO1_BASE + 0x100 * (pdo_number as u16 - 1);
        Some(CanId::masked(base + node.raw() as u16))
    } else {
        None
    }
}
