//! Common SDO implementation
//!
//! Defines the expedited SDO request/response messages, the abort code table,
//! and the object dictionary addressing type. Segmented and block transfers
//! are out of scope for this stack; anything over 4 bytes must be moved
//! through another channel.
use int_enum::IntEnum;

use crate::messages::{CanFrame, CanId, MessageError, MAX_FRAME_DATA};

/// Address of an object dictionary entry: a 16-bit index and 8-bit sub-index
///
/// This is the key of every SDO exchange and of every PDO mapping entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectAddress {
    /// The object index
    pub index: u16,
    /// The sub-index
    pub sub: u8,
}

impl ObjectAddress {
    /// Create a new address
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}

impl core::fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#06x}:{:02x}", self.index, self.sub)
    }
}

/// Specifies the possible client command specifier (CCS) values in SDO
/// request packets
enum ClientCommand {
    InitiateDownload = 1,
    InitiateUpload = 2,
    Abort = 4,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// Specifies the possible server command specifier (SCS) values in SDO
/// response packets
enum ServerCommand {
    Upload = 2,
    Download = 3,
    Abort = 4,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// SDO Abort Code
///
/// Defines the various reasons an SDO transfer can be aborted
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnallowedPdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Resource isn't available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored because of the device state
    CantStoreDeviceState = 0x0800_0022,
}

impl AbortCode {
    /// A human readable description of the abort reason
    pub fn description(&self) -> &'static str {
        match self {
            AbortCode::ToggleNotAlternated => "Toggle bit not alternated",
            AbortCode::SdoTimeout => "SDO protocol timed out",
            AbortCode::InvalidCommandSpecifier => "Command specifier not valid or unknown",
            AbortCode::OutOfMemory => "Out of memory",
            AbortCode::UnsupportedAccess => "Unsupported access to an object",
            AbortCode::WriteOnly => "Attempt to read a write only object",
            AbortCode::ReadOnly => "Attempt to write a read only object",
            AbortCode::NoSuchObject => "Object does not exist in the object dictionary",
            AbortCode::UnallowedPdo => "Object cannot be mapped to the PDO",
            AbortCode::PdoTooLong => "The number and length of objects would exceed PDO length",
            AbortCode::IncompatibleParameter => "General parameter incompatibility",
            AbortCode::HardwareError => "Access failed due to a hardware error",
            AbortCode::DataTypeMismatch => "Data type does not match, length does not match",
            AbortCode::DataTypeMismatchLengthHigh => "Data type does not match, length too high",
            AbortCode::DataTypeMismatchLengthLow => "Data type does not match, length too low",
            AbortCode::NoSuchSubIndex => "Sub-index does not exist",
            AbortCode::InvalidValue => "Invalid value for parameter",
            AbortCode::ValueTooHigh => "Value of parameter written too high",
            AbortCode::ValueTooLow => "Value of parameter written too low",
            AbortCode::ResourceNotAvailable => "Resource not available",
            AbortCode::GeneralError => "General error",
            AbortCode::CantStore => "Data cannot be transferred or stored",
            AbortCode::CantStoreLocalControl => {
                "Data cannot be transferred or stored because of local control"
            }
            AbortCode::CantStoreDeviceState => {
                "Data cannot be transferred or stored because of the device state"
            }
        }
    }
}

/// Coarse classification of an abort code by its numeric range
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbortClass {
    /// SDO protocol errors (0x0503xxxx - 0x0504xxxx)
    Protocol,
    /// Object dictionary access errors (0x0601xxxx - 0x060Axxxx)
    ObjectDictionary,
    /// Manufacturer specific errors (0x20000000 and up)
    ManufacturerSpecific,
    /// Anything else
    Unknown,
}

impl AbortClass {
    /// Classify a raw 32-bit abort code
    pub fn of(code: u32) -> Self {
        match code >> 16 {
            0x0503..=0x0504 => AbortClass::Protocol,
            0x0601..=0x060A => AbortClass::ObjectDictionary,
            c if c >= 0x2000 => AbortClass::ManufacturerSpecific,
            _ => AbortClass::Unknown,
        }
    }
}

/// An abort code as received on the wire
///
/// Servers are free to send codes outside the DS-301 table, so the raw value
/// is always preserved. Known codes additionally resolve to an [`AbortCode`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawAbortCode {
    /// A code from the DS-301 table
    Valid(AbortCode),
    /// A code outside the table, kept raw
    Unknown(u32),
}

impl RawAbortCode {
    /// The raw 32-bit code
    pub fn raw(&self) -> u32 {
        match self {
            RawAbortCode::Valid(code) => *code as u32,
            RawAbortCode::Unknown(raw) => *raw,
        }
    }

    /// A human readable description, falling back to the range class for
    /// codes outside the table
    pub fn description(&self) -> &'static str {
        match self {
            RawAbortCode::Valid(code) => code.description(),
            RawAbortCode::Unknown(raw) => match AbortClass::of(*raw) {
                AbortClass::Protocol => "Unknown SDO protocol error",
                AbortClass::ObjectDictionary => "Unknown object dictionary access error",
                AbortClass::ManufacturerSpecific => "Manufacturer specific error",
                AbortClass::Unknown => "Unknown abort code",
            },
        }
    }
}

impl From<u32> for RawAbortCode {
    fn from(raw: u32) -> Self {
        match AbortCode::try_from(raw) {
            Ok(code) => RawAbortCode::Valid(code),
            Err(_) => RawAbortCode::Unknown(raw),
        }
    }
}

impl core::fmt::Display for RawAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}: {}", self.raw(), self.description())
    }
}

/// An SDO Request
///
/// This represents the expedited request messages which can be sent from
/// client to server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// The value being written, little-endian with zero fill
        data: [u8; 4],
    },
    /// Begin an upload of data from an object on the server
    InitiateUpload {
        /// The requested object index
        index: u16,
        /// The requested sub object
        sub: u8,
    },
    /// Sent by client to abort an ongoing transaction
    Abort {
        /// The object index of the active transaction
        index: u16,
        /// The sub object of the active transaction
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an expedited download message
    ///
    /// # Panics
    ///
    /// Panics if `data` is empty or longer than 4 bytes
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        if data.is_empty() || data.len() > 4 {
            panic!("Expedited download data must be 1-4 bytes");
        }
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create an `InitiateUpload` request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Convert the request to a [`CanFrame`] using the provided COB-ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        let mut payload = [0; MAX_FRAME_DATA];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }

        CanFrame::from_raw_parts(id, payload, 8)
    }

    /// The address of the object this request operates on
    pub fn address(&self) -> ObjectAddress {
        match self {
            SdoRequest::InitiateDownload { index, sub, .. }
            | SdoRequest::InitiateUpload { index, sub }
            | SdoRequest::Abort { index, sub, .. } => ObjectAddress::new(*index, *sub),
        }
    }
}

impl TryFrom<&CanFrame> for SdoRequest {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let value = frame.data();
        if value.len() < 8 {
            return Err(MessageError::TooShort {
                len: value.len(),
                expected: 8,
            });
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| MessageError::InvalidField { value: value[0] })?;

        let index = u16::from_le_bytes([value[1], value[2]]);
        let sub = value[3];
        match ccs {
            ClientCommand::InitiateDownload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & (1 << 0)) != 0;
                let data = value[4..8].try_into().unwrap();
                Ok(SdoRequest::InitiateDownload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ClientCommand::InitiateUpload => Ok(SdoRequest::InitiateUpload { index, sub }),
            ClientCommand::Abort => {
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoRequest::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
        }
    }
}

/// Represents a response from SDO server to client
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SdoResponse {
    /// Response to an [`SdoRequest::InitiateUpload`]
    ConfirmUpload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size flag
        s: bool,
        /// The index of the object being uploaded
        index: u16,
        /// The sub object being uploaded
        sub: u8,
        /// Value if e=1, or size if s=1
        data: [u8; 4],
    },
    /// Response to a [`SdoRequest::InitiateDownload`]
    ConfirmDownload {
        /// The index of the object written to
        index: u16,
        /// The sub object written to
        sub: u8,
    },
    /// Sent by server to abort an ongoing transaction
    Abort {
        /// Object index of the active transfer
        index: u16,
        /// Sub object of the active transfer
        sub: u8,
        /// Abort reason
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create a `ConfirmUpload` response for an expedited upload
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than 4 bytes
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        if data.len() > 4 {
            panic!("Cannot create expedited upload with more than 4 bytes");
        }
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoResponse::ConfirmUpload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a `ConfirmDownload` response
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::ConfirmDownload { index, sub }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// The address of the object this response refers to
    pub fn address(&self) -> ObjectAddress {
        match self {
            SdoResponse::ConfirmUpload { index, sub, .. }
            | SdoResponse::ConfirmDownload { index, sub }
            | SdoResponse::Abort { index, sub, .. } => ObjectAddress::new(*index, *sub),
        }
    }

    /// Convert the response to a [`CanFrame`] using the provided COB-ID
    pub fn to_frame(self, id: CanId) -> CanFrame {
        let mut payload = [0; MAX_FRAME_DATA];

        match self {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::Upload as u8) << 5)
                    | ((n & 0x3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::ConfirmDownload { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }

        CanFrame::from_raw_parts(id, payload, 8)
    }
}

impl TryFrom<&CanFrame> for SdoResponse {
    type Error = MessageError;

    fn try_from(frame: &CanFrame) -> Result<Self, Self::Error> {
        let value = frame.data();
        if value.len() < 8 {
            return Err(MessageError::TooShort {
                len: value.len(),
                expected: 8,
            });
        }
        let scs: ServerCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| MessageError::InvalidField { value: value[0] })?;

        let index = u16::from_le_bytes([value[1], value[2]]);
        let sub = value[3];
        match scs {
            ServerCommand::Upload => {
                let n = (value[0] >> 2) & 0x3;
                let e = (value[0] & (1 << 1)) != 0;
                let s = (value[0] & (1 << 0)) != 0;
                let data = value[4..8].try_into().unwrap();
                Ok(SdoResponse::ConfirmUpload {
                    n,
                    e,
                    s,
                    index,
                    sub,
                    data,
                })
            }
            ServerCommand::Download => Ok(SdoResponse::ConfirmDownload { index, sub }),
            ServerCommand::Abort => {
                let abort_code = u32::from_le_bytes(value[4..8].try_into().unwrap());
                Ok(SdoResponse::Abort {
                    index,
                    sub,
                    abort_code,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expedited_download_encoding() {
        // For every payload length, n = 4 - L, e and s are set, and the data
        // bytes are little-endian with zero fill
        for len in 1usize..=4 {
            let data: Vec<u8> = (1..=len as u8).collect();
            let frame =
                SdoRequest::expedited_download(0x6040, 0, &data).to_frame(CanId::masked(0x601));
            let payload = frame.data();
            assert_eq!(8, payload.len());
            let specifier = payload[0];
            assert_eq!(0x20, specifier & 0xE0);
            assert_eq!((4 - len) as u8, (specifier >> 2) & 0x3);
            assert_eq!(0x02, specifier & 0x02);
            assert_eq!(&[0x40, 0x60, 0x00], &payload[1..4]);
            assert_eq!(&data[..], &payload[4..4 + len]);
            assert!(payload[4 + len..8].iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_write_u8_request_frame() {
        let frame = SdoRequest::expedited_download(0x6040, 0, &[0x0F]).to_frame(CanId::masked(0x601));
        assert_eq!(
            &[0x2F, 0x40, 0x60, 0x00, 0x0F, 0, 0, 0],
            frame.data()
        );
    }

    #[test]
    fn test_upload_request_frame() {
        let frame = SdoRequest::initiate_upload(0x6041, 0).to_frame(CanId::masked(0x601));
        assert_eq!(&[0x40, 0x41, 0x60, 0x00, 0, 0, 0, 0], frame.data());
    }

    #[test]
    fn test_upload_response_decode() {
        let frame =
            CanFrame::new(CanId::masked(0x581), &[0x4B, 0x41, 0x60, 0x00, 0x37, 0x06, 0, 0])
                .unwrap();
        let resp = SdoResponse::try_from(&frame).unwrap();
        match resp {
            SdoResponse::ConfirmUpload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                assert_eq!(2, n);
                assert!(e);
                assert!(s);
                assert_eq!(0x6041, index);
                assert_eq!(0, sub);
                assert_eq!([0x37, 0x06, 0, 0], data);
            }
            _ => panic!("Expected ConfirmUpload, got {resp:?}"),
        }
    }

    #[test]
    fn test_abort_response_decode() {
        let frame =
            CanFrame::new(CanId::masked(0x581), &[0x80, 0x00, 0x10, 0x00, 0x00, 0x00, 0x02, 0x06])
                .unwrap();
        let resp = SdoResponse::try_from(&frame).unwrap();
        assert_eq!(
            SdoResponse::Abort {
                index: 0x1000,
                sub: 0,
                abort_code: 0x0602_0000
            },
            resp
        );
    }

    #[test]
    fn test_response_rejects_short_payload() {
        let frame = CanFrame::new(CanId::masked(0x581), &[0x60, 0x40, 0x60]).unwrap();
        assert!(matches!(
            SdoResponse::try_from(&frame),
            Err(MessageError::TooShort { len: 3, expected: 8 })
        ));
    }

    #[test]
    fn test_request_round_trip() {
        let req = SdoRequest::expedited_download(0x2000, 3, &[0xAA, 0xBB]);
        let frame = req.to_frame(CanId::masked(0x602));
        assert_eq!(req, SdoRequest::try_from(&frame).unwrap());

        let abort = SdoRequest::abort(0x2000, 3, AbortCode::SdoTimeout);
        let frame = abort.to_frame(CanId::masked(0x602));
        assert_eq!(abort, SdoRequest::try_from(&frame).unwrap());
    }

    #[test]
    fn test_abort_code_lookup() {
        let code = RawAbortCode::from(0x0602_0000);
        assert_eq!(RawAbortCode::Valid(AbortCode::NoSuchObject), code);
        assert!(code.description().starts_with("Object does not exist"));
    }

    #[test]
    fn test_abort_code_classification() {
        assert_eq!(AbortClass::Protocol, AbortClass::of(0x0503_0001));
        assert_eq!(AbortClass::Protocol, AbortClass::of(0x0504_1234));
        assert_eq!(AbortClass::ObjectDictionary, AbortClass::of(0x0609_0099));
        assert_eq!(AbortClass::ManufacturerSpecific, AbortClass::of(0x2000_0001));
        assert_eq!(AbortClass::Unknown, AbortClass::of(0x0000_0001));

        let unknown = RawAbortCode::from(0x0609_0099);
        assert_eq!(0x0609_0099, unknown.raw());
        assert_eq!(
            "Unknown object dictionary access error",
            unknown.description()
        );
    }
}
