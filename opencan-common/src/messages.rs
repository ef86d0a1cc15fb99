//! CAN frame types and codecs for the DS-301 broadcast services
//!
//! Defines [`CanFrame`] and [`CanId`], plus encode/decode for the NMT, SYNC,
//! EMCY and Heartbeat messages. The SDO codec lives in [`crate::sdo`].
use std::time::Instant;

use snafu::Snafu;

use crate::constants::cob_ids;
use crate::sdo::{SdoRequest, SdoResponse};

/// An 11-bit CAN identifier
///
/// CANopen routes every communication object by a standard-frame identifier,
/// so values above [`CanId::MAX`] are rejected at construction. Extended
/// 29-bit identifiers are not supported by this stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanId(u16);

impl CanId {
    /// The largest valid identifier value
    pub const MAX: u16 = 0x7FF;

    /// Create a new CanId, failing if the value does not fit in 11 bits
    pub const fn new(raw: u16) -> Result<Self, MessageError> {
        if raw <= Self::MAX {
            Ok(CanId(raw))
        } else {
            Err(MessageError::InvalidId { raw })
        }
    }

    /// Create a CanId from a value which may carry flag bits in its upper
    /// bits, keeping only the low 11
    pub const fn masked(raw: u16) -> Self {
        CanId(raw & Self::MAX)
    }

    /// Get the raw identifier value
    pub const fn raw(&self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for CanId {
    type Error = MessageError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl core::fmt::Display for CanId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#05x}", self.0)
    }
}

/// The maximum payload size of a classic CAN frame
pub const MAX_FRAME_DATA: usize = 8;

/// A classic CAN data frame: an 11-bit identifier and 0-8 payload bytes
///
/// Received frames carry the timestamp assigned by the transport; frames
/// built for transmission have none. Timestamps are ignored by equality.
#[derive(Clone, Copy, Debug)]
pub struct CanFrame {
    id: CanId,
    data: [u8; MAX_FRAME_DATA],
    dlc: u8,
    timestamp: Option<Instant>,
}

impl CanFrame {
    /// Create a new frame, failing if `data` exceeds 8 bytes
    pub fn new(id: CanId, data: &[u8]) -> Result<Self, MessageError> {
        if data.len() > MAX_FRAME_DATA {
            return Err(MessageError::PayloadTooLong { len: data.len() });
        }
        let mut buf = [0u8; MAX_FRAME_DATA];
        buf[0..data.len()].copy_from_slice(data);
        Ok(Self {
            id,
            data: buf,
            dlc: data.len() as u8,
            timestamp: None,
        })
    }

    pub(crate) fn from_raw_parts(id: CanId, data: [u8; MAX_FRAME_DATA], dlc: u8) -> Self {
        debug_assert!(dlc as usize <= MAX_FRAME_DATA);
        Self {
            id,
            data,
            dlc,
            timestamp: None,
        }
    }

    /// The frame identifier
    pub fn id(&self) -> CanId {
        self.id
    }

    /// The valid payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// The receive timestamp, if this frame came from a transport
    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Return the frame with a receive timestamp attached
    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl PartialEq for CanFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data() == other.data()
    }
}

impl Eq for CanFrame {}

/// The command specifier byte of an NMT command
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Move the node to Operational
    Start = 0x01,
    /// Move the node to Stopped
    Stop = 0x02,
    /// Move the node to PreOperational
    EnterPreOperational = 0x80,
    /// Perform a full application reset
    ResetNode = 0x81,
    /// Reset the node's communication parameters
    ResetCommunication = 0x82,
}

impl NmtCommandSpecifier {
    /// Decode a specifier from its wire value
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x01 => Ok(Self::Start),
            0x02 => Ok(Self::Stop),
            0x80 => Ok(Self::EnterPreOperational),
            0x81 => Ok(Self::ResetNode),
            0x82 => Ok(Self::ResetCommunication),
            _ => Err(MessageError::InvalidField { value: b }),
        }
    }
}

/// An NMT command: a specifier and a target node, with node 0 addressing
/// every node on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NmtCommand {
    /// The command specifier
    pub cs: NmtCommandSpecifier,
    /// The target node ID, or 0 for broadcast
    pub node: u8,
}

impl From<NmtCommand> for CanFrame {
    fn from(cmd: NmtCommand) -> Self {
        let mut data = [0u8; MAX_FRAME_DATA];
        data[0] = cmd.cs as u8;
        data[1] = cmd.node;
        CanFrame::from_raw_parts(CanId::masked(cob_ids::NMT), data, 2)
    }
}

impl TryFrom<&CanFrame> for NmtCommand {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        if frame.id().raw() != cob_ids::NMT {
            return Err(MessageError::UnexpectedId { cob_id: frame.id() });
        }
        let payload = frame.data();
        if payload.len() < 2 {
            return Err(MessageError::TooShort {
                len: payload.len(),
                expected: 2,
            });
        }
        Ok(NmtCommand {
            cs: NmtCommandSpecifier::from_byte(payload[0])?,
            node: payload[1],
        })
    }
}

/// The NMT state of a node
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum NmtState {
    /// The node is initializing and has not yet announced itself
    Initializing,
    /// The node has just announced itself with a boot-up message
    BootUp,
    /// The node is stopped
    Stopped,
    /// The node is operational
    Operational,
    /// The node is pre-operational
    #[default]
    PreOperational,
    /// The node reported a state byte outside the DS-301 set
    Unknown,
}

impl NmtState {
    /// Decode a state from a heartbeat payload byte
    ///
    /// Unlike most decoders this cannot fail; byte values outside the DS-301
    /// set map to [`NmtState::Unknown`].
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => NmtState::BootUp,
            0x04 => NmtState::Stopped,
            0x05 => NmtState::Operational,
            0x7F => NmtState::PreOperational,
            _ => NmtState::Unknown,
        }
    }

    /// The wire encoding of this state
    ///
    /// `Initializing` shares the boot-up encoding; `Unknown` has no defined
    /// encoding and maps to 0xFF.
    pub fn wire_value(&self) -> u8 {
        match self {
            NmtState::Initializing | NmtState::BootUp => 0x00,
            NmtState::Stopped => 0x04,
            NmtState::Operational => 0x05,
            NmtState::PreOperational => 0x7F,
            NmtState::Unknown => 0xFF,
        }
    }
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            NmtState::Initializing => "Initializing",
            NmtState::BootUp => "BootUp",
            NmtState::Stopped => "Stopped",
            NmtState::Operational => "Operational",
            NmtState::PreOperational => "PreOperational",
            NmtState::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// A heartbeat message: a node's periodic one-byte state announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// The producing node
    pub node: u8,
    /// The announced NMT state
    pub state: NmtState,
}

impl From<Heartbeat> for CanFrame {
    fn from(value: Heartbeat) -> Self {
        let mut data = [0u8; MAX_FRAME_DATA];
        data[0] = value.state.wire_value();
        let id = CanId::masked(cob_ids::HEARTBEAT_BASE | (value.node as u16 & 0x7F));
        CanFrame::from_raw_parts(id, data, 1)
    }
}

impl TryFrom<&CanFrame> for Heartbeat {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let raw = frame.id().raw();
        if !(cob_ids::HEARTBEAT_BASE + 1..=cob_ids::HEARTBEAT_BASE + 0x7F).contains(&raw) {
            return Err(MessageError::UnexpectedId { cob_id: frame.id() });
        }
        let payload = frame.data();
        if payload.is_empty() {
            return Err(MessageError::TooShort {
                len: 0,
                expected: 1,
            });
        }
        Ok(Heartbeat {
            node: (raw - cob_ids::HEARTBEAT_BASE) as u8,
            state: NmtState::from_byte(payload[0]),
        })
    }
}

/// The error register byte carried by emergency messages
///
/// Each bit flags a pending error class on the producing node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct ErrorRegister(pub u8);

impl ErrorRegister {
    /// Generic error (bit 0)
    pub fn generic(&self) -> bool {
        self.0 & 0x01 != 0
    }
    /// Current error (bit 1)
    pub fn current(&self) -> bool {
        self.0 & 0x02 != 0
    }
    /// Voltage error (bit 2)
    pub fn voltage(&self) -> bool {
        self.0 & 0x04 != 0
    }
    /// Temperature error (bit 3)
    pub fn temperature(&self) -> bool {
        self.0 & 0x08 != 0
    }
    /// Communication error (bit 4)
    pub fn communication(&self) -> bool {
        self.0 & 0x10 != 0
    }
    /// Device-profile specific error (bit 5)
    pub fn device_profile(&self) -> bool {
        self.0 & 0x20 != 0
    }
    /// Manufacturer specific error (bit 7)
    pub fn manufacturer(&self) -> bool {
        self.0 & 0x80 != 0
    }
}

/// An emergency (EMCY) message announcing an error on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmcyMessage {
    /// The producing node
    pub node: u8,
    /// The DS-301 emergency error code
    pub error_code: u16,
    /// The node's error register at the time of the event
    pub error_register: ErrorRegister,
    /// Manufacturer specific payload bytes
    pub manufacturer: [u8; 5],
}

impl From<EmcyMessage> for CanFrame {
    fn from(value: EmcyMessage) -> Self {
        let mut data = [0u8; MAX_FRAME_DATA];
        data[0..2].copy_from_slice(&value.error_code.to_le_bytes());
        data[2] = value.error_register.0;
        data[3..8].copy_from_slice(&value.manufacturer);
        let id = CanId::masked(cob_ids::EMCY_BASE + (value.node as u16 & 0x7F));
        CanFrame::from_raw_parts(id, data, 8)
    }
}

impl TryFrom<&CanFrame> for EmcyMessage {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let raw = frame.id().raw();
        // Bare 0x080 is SYNC, not an emergency
        if !(cob_ids::EMCY_BASE + 1..=cob_ids::EMCY_BASE + 0x7F).contains(&raw) {
            return Err(MessageError::UnexpectedId { cob_id: frame.id() });
        }
        let payload = frame.data();
        if payload.len() < 8 {
            return Err(MessageError::TooShort {
                len: payload.len(),
                expected: 8,
            });
        }
        Ok(EmcyMessage {
            node: (raw - cob_ids::EMCY_BASE) as u8,
            error_code: u16::from_le_bytes([payload[0], payload[1]]),
            error_register: ErrorRegister(payload[2]),
            manufacturer: [payload[3], payload[4], payload[5], payload[6], payload[7]],
        })
    }
}

/// A SYNC message
///
/// In counter mode the one byte count cycles through 1-240; in counter-less
/// mode the payload is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMessage {
    /// The cycle counter, if the producer has counters enabled
    pub counter: Option<u8>,
}

impl From<SyncMessage> for CanFrame {
    fn from(value: SyncMessage) -> Self {
        let mut data = [0u8; MAX_FRAME_DATA];
        let dlc = match value.counter {
            Some(count) => {
                data[0] = count;
                1
            }
            None => 0,
        };
        CanFrame::from_raw_parts(CanId::masked(cob_ids::SYNC), data, dlc)
    }
}

impl TryFrom<&CanFrame> for SyncMessage {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        if frame.id().raw() != cob_ids::SYNC {
            return Err(MessageError::UnexpectedId { cob_id: frame.id() });
        }
        Ok(SyncMessage {
            counter: frame.data().first().copied(),
        })
    }
}

/// Any inbound message classified by its COB-ID
///
/// PDO identifiers are configuration-dependent and cannot be classified
/// statically; PDO frames fall out as [`MessageError::UnrecognizedId`].
#[derive(Debug, Clone, Copy)]
pub enum CanOpenMessage {
    /// An NMT command
    Nmt(NmtCommand),
    /// A SYNC message
    Sync(SyncMessage),
    /// An emergency message
    Emcy(EmcyMessage),
    /// A heartbeat
    Heartbeat(Heartbeat),
    /// An SDO request addressed to the server of `node`
    SdoRequest {
        /// The addressed server node
        node: u8,
        /// The decoded request
        request: SdoRequest,
    },
    /// An SDO response from the server of `node`
    SdoResponse {
        /// The responding server node
        node: u8,
        /// The decoded response
        response: SdoResponse,
    },
}

impl TryFrom<&CanFrame> for CanOpenMessage {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let raw = frame.id().raw();
        if raw == cob_ids::NMT {
            Ok(CanOpenMessage::Nmt(frame.try_into()?))
        } else if raw == cob_ids::SYNC {
            Ok(CanOpenMessage::Sync(frame.try_into()?))
        } else if (cob_ids::EMCY_BASE + 1..=cob_ids::EMCY_BASE + 0x7F).contains(&raw) {
            Ok(CanOpenMessage::Emcy(frame.try_into()?))
        } else if (cob_ids::SDO_RESP_BASE + 1..=cob_ids::SDO_RESP_BASE + 0x7F).contains(&raw) {
            Ok(CanOpenMessage::SdoResponse {
                node: (raw - cob_ids::SDO_RESP_BASE) as u8,
                response: frame.try_into()?,
            })
        } else if (cob_ids::SDO_REQ_BASE + 1..=cob_ids::SDO_REQ_BASE + 0x7F).contains(&raw) {
            Ok(CanOpenMessage::SdoRequest {
                node: (raw - cob_ids::SDO_REQ_BASE) as u8,
                request: frame.try_into()?,
            })
        } else if (cob_ids::HEARTBEAT_BASE + 1..=cob_ids::HEARTBEAT_BASE + 0x7F).contains(&raw) {
            Ok(CanOpenMessage::Heartbeat(frame.try_into()?))
        } else {
            Err(MessageError::UnrecognizedId { cob_id: frame.id() })
        }
    }
}

/// Errors raised when decoding inbound frames or constructing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum MessageError {
    /// The payload is shorter than the message type requires
    #[snafu(display("payload too short: {len} bytes, expected at least {expected}"))]
    TooShort {
        /// Actual payload length
        len: usize,
        /// Minimum length for this message type
        expected: usize,
    },
    /// The payload exceeds the 8 byte CAN limit
    #[snafu(display("payload length {len} exceeds the 8 byte CAN limit"))]
    PayloadTooLong {
        /// The rejected length
        len: usize,
    },
    /// The identifier does not fit in 11 bits
    #[snafu(display("identifier {raw:#x} does not fit in 11 bits"))]
    InvalidId {
        /// The rejected value
        raw: u16,
    },
    /// The frame's COB-ID does not belong to the decoded message type
    #[snafu(display("unexpected COB-ID {cob_id} for this message type"))]
    UnexpectedId {
        /// The offending identifier
        cob_id: CanId,
    },
    /// The frame's COB-ID matches no known service
    #[snafu(display("COB-ID {cob_id} does not match any known service"))]
    UnrecognizedId {
        /// The offending identifier
        cob_id: CanId,
    },
    /// A field holds a value outside its defined set
    #[snafu(display("invalid field value {value:#04x}"))]
    InvalidField {
        /// The offending byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_id_limits() {
        assert!(CanId::new(0x7FF).is_ok());
        assert_eq!(
            Err(MessageError::InvalidId { raw: 0x800 }),
            CanId::new(0x800)
        );
        assert_eq!(0x123, CanId::masked(0x8123).raw());
    }

    #[test]
    fn test_frame_rejects_long_payload() {
        let id = CanId::new(0x123).unwrap();
        assert!(CanFrame::new(id, &[0; 8]).is_ok());
        assert_eq!(
            Err(MessageError::PayloadTooLong { len: 9 }),
            CanFrame::new(id, &[0; 9])
        );
    }

    #[test]
    fn test_nmt_round_trip() {
        let cmd = NmtCommand {
            cs: NmtCommandSpecifier::Start,
            node: 1,
        };
        let frame: CanFrame = cmd.into();
        assert_eq!(0x000, frame.id().raw());
        assert_eq!(&[0x01, 0x01], frame.data());
        assert_eq!(cmd, NmtCommand::try_from(&frame).unwrap());
    }

    #[test]
    fn test_nmt_rejects_short_payload() {
        let frame = CanFrame::new(CanId::masked(0), &[0x01]).unwrap();
        assert!(matches!(
            NmtCommand::try_from(&frame),
            Err(MessageError::TooShort { len: 1, expected: 2 })
        ));
    }

    #[test]
    fn test_nmt_state_byte_mapping() {
        assert_eq!(NmtState::BootUp, NmtState::from_byte(0x00));
        assert_eq!(NmtState::Stopped, NmtState::from_byte(0x04));
        assert_eq!(NmtState::Operational, NmtState::from_byte(0x05));
        assert_eq!(NmtState::PreOperational, NmtState::from_byte(0x7F));
        assert_eq!(NmtState::Unknown, NmtState::from_byte(0x42));
    }

    #[test]
    fn test_heartbeat_decode() {
        let frame = CanFrame::new(CanId::masked(0x703), &[0x05]).unwrap();
        let hb = Heartbeat::try_from(&frame).unwrap();
        assert_eq!(3, hb.node);
        assert_eq!(NmtState::Operational, hb.state);

        let empty = CanFrame::new(CanId::masked(0x703), &[]).unwrap();
        assert!(Heartbeat::try_from(&empty).is_err());
    }

    #[test]
    fn test_emcy_decode() {
        let frame =
            CanFrame::new(CanId::masked(0x082), &[0x10, 0x11, 0x04, 1, 2, 3, 4, 5]).unwrap();
        let emcy = EmcyMessage::try_from(&frame).unwrap();
        assert_eq!(2, emcy.node);
        assert_eq!(0x1110, emcy.error_code);
        assert!(emcy.error_register.temperature());
        assert!(!emcy.error_register.generic());
        assert_eq!([1, 2, 3, 4, 5], emcy.manufacturer);
    }

    #[test]
    fn test_emcy_rejects_sync_id_and_short_payload() {
        let sync = CanFrame::new(CanId::masked(0x080), &[0; 8]).unwrap();
        assert!(matches!(
            EmcyMessage::try_from(&sync),
            Err(MessageError::UnexpectedId { .. })
        ));
        let short = CanFrame::new(CanId::masked(0x082), &[0x10, 0x11]).unwrap();
        assert!(matches!(
            EmcyMessage::try_from(&short),
            Err(MessageError::TooShort { .. })
        ));
    }

    #[test]
    fn test_sync_frames() {
        let bare: CanFrame = SyncMessage { counter: None }.into();
        assert_eq!(0x080, bare.id().raw());
        assert!(bare.data().is_empty());

        let counted: CanFrame = SyncMessage { counter: Some(17) }.into();
        assert_eq!(&[17], counted.data());
    }

    #[test]
    fn test_classify_by_cob_id() {
        let hb = CanFrame::new(CanId::masked(0x701), &[0x7F]).unwrap();
        assert!(matches!(
            CanOpenMessage::try_from(&hb),
            Ok(CanOpenMessage::Heartbeat(_))
        ));
        let pdo = CanFrame::new(CanId::masked(0x181), &[0, 1]).unwrap();
        assert!(matches!(
            CanOpenMessage::try_from(&pdo),
            Err(MessageError::UnrecognizedId { .. })
        ));
    }
}
