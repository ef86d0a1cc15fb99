//! PDO configuration, mapping and bit extraction
//!
//! Holds the TPDO/RPDO configuration registries, dispatches inbound frames to
//! configured TPDOs by COB-ID, and packs/unpacks mapped values from PDO
//! payloads.
//!
//! Bit extraction always takes an explicit bit offset. When reading through a
//! configuration, [`PdoConfig::field_offset`] derives the offset of a field
//! from the cumulative lengths of the mappings before it.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Deserialize;
use snafu::Snafu;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use opencan_common::{AsyncCanSender, CanFrame, CanId, ObjectAddress, TransportError};

use crate::bus::{SharedReceiverChannel, SharedSender};

/// The capacity of a classic CAN PDO, in bits
pub const PDO_BIT_LIMIT: u32 = 64;

/// Errors raised while building or storing PDO configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum ConfigError {
    /// PDO numbers are limited to the four standard PDOs
    #[snafu(display("PDO number {number} is out of range 1-4"))]
    InvalidPdoNumber {
        /// The rejected number
        number: u8,
    },
    /// The COB-ID does not fit in 11 bits
    #[snafu(display("COB-ID {cob_id:#x} does not fit in 11 bits"))]
    InvalidCobId {
        /// The rejected COB-ID
        cob_id: u16,
    },
    /// A mapping's bit length is outside the valid range
    #[snafu(display("mapping bit length {bits} is out of range 1-64"))]
    InvalidBitLength {
        /// The rejected bit length
        bits: u8,
    },
    /// The configured mappings would exceed the PDO capacity
    #[snafu(display("total mapped bits {total} would exceed the 64 bit PDO limit"))]
    MappingOverflow {
        /// The total that was rejected
        total: u32,
    },
}

/// Errors raised on the PDO transmit and receive paths
#[derive(Debug, PartialEq, Snafu)]
pub enum PdoError {
    /// The transport failed while sending
    #[snafu(display("transport failure sending PDO: {source}"))]
    Transport {
        /// The underlying transport error
        source: TransportError,
    },
    /// A configuration error
    #[snafu(display("PDO configuration error: {source}"))]
    Config {
        /// The underlying configuration error
        source: ConfigError,
    },
    /// No configuration is stored for the PDO
    #[snafu(display("PDO {pdo_number} is not configured"))]
    NotConfigured {
        /// The unconfigured PDO number
        pdo_number: u8,
    },
    /// The stored configuration is not usable
    #[snafu(display("PDO {pdo_number} configuration is invalid"))]
    InvalidConfig {
        /// The offending PDO number
        pdo_number: u8,
    },
    /// The payload exceeds the 8 byte CAN limit
    #[snafu(display("payload length {len} exceeds the 8 byte PDO limit"))]
    PayloadTooLong {
        /// The rejected length
        len: usize,
    },
    /// RTR-triggered PDO requests are not supported
    #[snafu(display("RTR requests are not supported"))]
    RtrUnsupported,
}

/// Represents a PDO mapping
///
/// Each mapping declares that one sub-object occupies the next `bit_length`
/// bits of the PDO payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PdoMapping {
    /// The object index
    pub index: u16,
    /// The object sub index
    pub sub: u8,
    /// The size of the mapped value, in **bits**
    pub bit_length: u8,
}

impl PdoMapping {
    /// Create a new mapping entry
    pub fn new(index: u16, sub: u8, bit_length: u8) -> Self {
        Self {
            index,
            sub,
            bit_length,
        }
    }

    /// The address of the mapped sub-object
    pub fn address(&self) -> ObjectAddress {
        ObjectAddress::new(self.index, self.sub)
    }

    /// Encode as the 32-bit value written to a mapping parameter object
    pub fn to_raw(&self) -> u32 {
        ((self.index as u32) << 16) | ((self.sub as u32) << 8) | self.bit_length as u32
    }

    /// Decode from a 32-bit mapping parameter value
    pub fn from_raw(raw: u32) -> Self {
        Self {
            index: (raw >> 16) as u16,
            sub: ((raw >> 8) & 0xFF) as u8,
            bit_length: (raw & 0xFF) as u8,
        }
    }
}

/// Represents the configuration parameters for a single PDO
///
/// Fields are public so callers can stage any configuration they like;
/// [`PdoConfig::new`] and [`PdoConfig::add_mapping`] enforce the invariants,
/// and [`PdoManager::validate`] reports on whatever is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PdoConfig {
    /// Which of the four standard PDOs this configures (1-4)
    pub pdo_number: u8,
    /// The COB-ID this PDO is sent or received on
    pub cob_id: u16,
    /// Specifies when a PDO is sent or latched
    ///
    /// - 0: sent in response to SYNC, after an application specific event
    /// - 1 - 240: sent in response to every Nth SYNC
    /// - 254/255: event driven
    pub transmission_type: u8,
    /// Minimum time between transmissions, in multiples of 100us
    pub inhibit_time: u16,
    /// Event timer period in ms, 0 to disable
    pub event_timer: u16,
    /// What sub objects are mapped into this PDO, in payload order
    pub mappings: Vec<PdoMapping>,
}

impl PdoConfig {
    /// Create an empty configuration, checking the PDO number and COB-ID
    pub fn new(pdo_number: u8, cob_id: u16) -> Result<Self, ConfigError> {
        if !(1..=4).contains(&pdo_number) {
            return Err(ConfigError::InvalidPdoNumber { number: pdo_number });
        }
        if cob_id > CanId::MAX {
            return Err(ConfigError::InvalidCobId { cob_id });
        }
        Ok(Self {
            pdo_number,
            cob_id,
            transmission_type: 254,
            inhibit_time: 0,
            event_timer: 0,
            mappings: Vec::new(),
        })
    }

    /// Append a mapping entry, enforcing the bit length and capacity rules
    pub fn add_mapping(&mut self, mapping: PdoMapping) -> Result<(), ConfigError> {
        if mapping.bit_length == 0 || mapping.bit_length as u32 > PDO_BIT_LIMIT {
            return Err(ConfigError::InvalidBitLength {
                bits: mapping.bit_length,
            });
        }
        let total = self.total_bits() + mapping.bit_length as u32;
        if total > PDO_BIT_LIMIT {
            return Err(ConfigError::MappingOverflow { total });
        }
        self.mappings.push(mapping);
        Ok(())
    }

    /// The sum of all mapped bit lengths
    pub fn total_bits(&self) -> u32 {
        self.mappings.iter().map(|m| m.bit_length as u32).sum()
    }

    /// Whether this PDO has at least one mapping and is usable
    pub fn is_configured(&self) -> bool {
        !self.mappings.is_empty()
    }

    /// The bit offset of mapping `field` within the payload
    ///
    /// Derived from the cumulative bit lengths of the preceding mappings.
    pub fn field_offset(&self, field: usize) -> Option<usize> {
        if field >= self.mappings.len() {
            return None;
        }
        Some(
            self.mappings[..field]
                .iter()
                .map(|m| m.bit_length as usize)
                .sum(),
        )
    }

    fn issues(&self, direction: &str, out: &mut Vec<String>) {
        let label = format!("{direction}{}", self.pdo_number);
        if self.cob_id > CanId::MAX {
            out.push(format!(
                "{label}: COB-ID {:#x} does not fit in 11 bits",
                self.cob_id
            ));
        }
        if self.mappings.is_empty() {
            out.push(format!("{label}: no mappings configured"));
        }
        if self.total_bits() > PDO_BIT_LIMIT {
            out.push(format!(
                "{label}: total mapped bits {} exceed the 64 bit limit",
                self.total_bits()
            ));
        }
        for mapping in &self.mappings {
            if mapping.bit_length == 0 {
                out.push(format!(
                    "{label}: mapping for {} has zero bit length",
                    mapping.address()
                ));
            }
        }
    }
}

/// A received PDO payload with its configuration context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoData {
    /// The matched TPDO number
    pub pdo_number: u8,
    /// The COB-ID the payload arrived on
    pub cob_id: u16,
    /// The raw payload bytes
    pub data: Vec<u8>,
    /// When the frame was received
    pub timestamp: Instant,
}

impl PdoData {
    /// Assemble `bit_length` bits starting at `bit_offset`, little-endian bit
    /// order
    ///
    /// Bits beyond the end of the payload read as zero. `bit_length` is
    /// clamped to 1-64.
    pub fn extract_bits(&self, bit_offset: usize, bit_length: u8) -> u64 {
        let bits = bit_length.clamp(1, 64) as usize;
        let total = self.data.len() * 8;
        let mut value = 0u64;
        for k in 0..bits {
            let bit = bit_offset + k;
            if bit >= total {
                break;
            }
            if (self.data[bit / 8] >> (bit % 8)) & 1 == 1 {
                value |= 1 << k;
            }
        }
        value
    }

    /// Extract an unsigned 8-bit value
    pub fn extract_u8(&self, bit_offset: usize, bit_length: u8) -> u8 {
        self.extract_bits(bit_offset, bit_length) as u8
    }

    /// Extract an unsigned 16-bit value
    pub fn extract_u16(&self, bit_offset: usize, bit_length: u8) -> u16 {
        self.extract_bits(bit_offset, bit_length) as u16
    }

    /// Extract an unsigned 32-bit value
    pub fn extract_u32(&self, bit_offset: usize, bit_length: u8) -> u32 {
        self.extract_bits(bit_offset, bit_length) as u32
    }

    /// Extract an unsigned 64-bit value
    pub fn extract_u64(&self, bit_offset: usize, bit_length: u8) -> u64 {
        self.extract_bits(bit_offset, bit_length)
    }

    /// Extract a signed 8-bit value, sign-extending from `bit_length`
    pub fn extract_i8(&self, bit_offset: usize, bit_length: u8) -> i8 {
        self.extract_signed(bit_offset, bit_length) as i8
    }

    /// Extract a signed 16-bit value, sign-extending from `bit_length`
    pub fn extract_i16(&self, bit_offset: usize, bit_length: u8) -> i16 {
        self.extract_signed(bit_offset, bit_length) as i16
    }

    /// Extract a signed 32-bit value, sign-extending from `bit_length`
    pub fn extract_i32(&self, bit_offset: usize, bit_length: u8) -> i32 {
        self.extract_signed(bit_offset, bit_length) as i32
    }

    /// Extract a signed 64-bit value, sign-extending from `bit_length`
    pub fn extract_i64(&self, bit_offset: usize, bit_length: u8) -> i64 {
        self.extract_signed(bit_offset, bit_length)
    }

    /// Extract a boolean: true iff any extracted bit is set
    pub fn extract_bool(&self, bit_offset: usize, bit_length: u8) -> bool {
        self.extract_bits(bit_offset, bit_length) != 0
    }

    /// Extract the value of mapping `field` through its configuration
    ///
    /// The offset comes from the mapping order, so this is immune to
    /// confusing a sub-index with a payload position.
    pub fn extract_mapped(&self, config: &PdoConfig, field: usize) -> Option<u64> {
        let offset = config.field_offset(field)?;
        let mapping = config.mappings.get(field)?;
        Some(self.extract_bits(offset, mapping.bit_length))
    }

    fn extract_signed(&self, bit_offset: usize, bit_length: u8) -> i64 {
        let bits = bit_length.clamp(1, 64) as u32;
        let value = self.extract_bits(bit_offset, bit_length);
        if bits >= 64 {
            return value as i64;
        }
        if (value >> (bits - 1)) & 1 == 1 {
            (value | !((1u64 << bits) - 1)) as i64
        } else {
            value as i64
        }
    }
}

/// TPDO/RPDO configuration registry and PDO transmit/receive engine
///
/// Inbound frames are matched against the configured TPDO COB-IDs; the first
/// match (lowest PDO number) wins. Configuring two TPDOs with the same COB-ID
/// is a caller bug.
#[derive(Debug)]
pub struct PdoManager<S: AsyncCanSender> {
    sender: SharedSender<S>,
    tpdo_configs: Arc<Mutex<HashMap<u8, PdoConfig>>>,
    rpdo_configs: Arc<Mutex<HashMap<u8, PdoConfig>>>,
    events: broadcast::Sender<PdoData>,
    rx_task: JoinHandle<()>,
}

impl<S: AsyncCanSender + 'static> PdoManager<S> {
    /// Create a manager using the given subscription for inbound TPDOs
    pub fn new(sender: SharedSender<S>, mut receiver: SharedReceiverChannel) -> Self {
        let tpdo_configs: Arc<Mutex<HashMap<u8, PdoConfig>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let rpdo_configs: Arc<Mutex<HashMap<u8, PdoConfig>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(64);

        let rx_task = {
            let tpdo_configs = tpdo_configs.clone();
            let events = events.clone();
            tokio::spawn(async move {
                while let Ok(frame) = receiver.recv().await {
                    let matched = {
                        let configs = tpdo_configs.lock().unwrap();
                        let mut numbers: Vec<u8> = configs.keys().copied().collect();
                        numbers.sort_unstable();
                        numbers.into_iter().find_map(|number| {
                            let config = &configs[&number];
                            let cob_id = config.cob_id & CanId::MAX;
                            (cob_id == frame.id().raw()).then_some((number, cob_id))
                        })
                    };
                    if let Some((pdo_number, cob_id)) = matched {
                        let data = PdoData {
                            pdo_number,
                            cob_id,
                            data: frame.data().to_vec(),
                            timestamp: frame.timestamp().unwrap_or_else(Instant::now),
                        };
                        events.send(data).ok();
                    }
                }
            })
        };

        Self {
            sender,
            tpdo_configs,
            rpdo_configs,
            events,
            rx_task,
        }
    }

    /// Insert or replace a TPDO configuration by its PDO number
    pub fn configure_tpdo(&self, config: PdoConfig) -> Result<(), ConfigError> {
        Self::store(&self.tpdo_configs, config)
    }

    /// Insert or replace an RPDO configuration by its PDO number
    pub fn configure_rpdo(&self, config: PdoConfig) -> Result<(), ConfigError> {
        Self::store(&self.rpdo_configs, config)
    }

    fn store(
        registry: &Mutex<HashMap<u8, PdoConfig>>,
        config: PdoConfig,
    ) -> Result<(), ConfigError> {
        if !(1..=4).contains(&config.pdo_number) {
            return Err(ConfigError::InvalidPdoNumber {
                number: config.pdo_number,
            });
        }
        registry.lock().unwrap().insert(config.pdo_number, config);
        Ok(())
    }

    /// The stored TPDO configuration, if any
    pub fn tpdo_config(&self, pdo_number: u8) -> Option<PdoConfig> {
        self.tpdo_configs.lock().unwrap().get(&pdo_number).cloned()
    }

    /// The stored RPDO configuration, if any
    pub fn rpdo_config(&self, pdo_number: u8) -> Option<PdoConfig> {
        self.rpdo_configs.lock().unwrap().get(&pdo_number).cloned()
    }

    /// Report human-readable issues with the stored configurations
    ///
    /// This is a precondition check only; invalid configurations are
    /// reported, never rejected from storage.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for (registry, direction) in [(&self.tpdo_configs, "TPDO"), (&self.rpdo_configs, "RPDO")] {
            let configs = registry.lock().unwrap();
            let mut numbers: Vec<u8> = configs.keys().copied().collect();
            numbers.sort_unstable();
            for number in &numbers {
                configs[number].issues(direction, &mut issues);
            }
            for (i, first) in numbers.iter().enumerate() {
                for second in &numbers[i + 1..] {
                    let (a, b) = (&configs[first], &configs[second]);
                    if a.cob_id == b.cob_id {
                        issues.push(format!(
                            "{direction}{} and {direction}{} share COB-ID {:#x}",
                            a.pdo_number, b.pdo_number, a.cob_id
                        ));
                    }
                }
            }
        }
        issues
    }

    /// Send an RPDO payload to the device
    pub async fn send_rpdo(&self, pdo_number: u8, data: &[u8]) -> Result<(), PdoError> {
        let config = self
            .rpdo_config(pdo_number)
            .ok_or(PdoError::NotConfigured { pdo_number })?;
        if !config.is_configured() {
            return Err(PdoError::InvalidConfig { pdo_number });
        }
        if data.len() > 8 {
            return Err(PdoError::PayloadTooLong { len: data.len() });
        }
        let frame = CanFrame::new(CanId::masked(config.cob_id), data)
            .map_err(|_| PdoError::PayloadTooLong { len: data.len() })?;
        self.sender
            .clone()
            .send(frame)
            .await
            .map_err(|source| PdoError::Transport { source })
    }

    /// Request a TPDO by RTR
    ///
    /// Always fails: remote frames are not supported by this stack.
    pub fn request_tpdo(&self, _pdo_number: u8) -> Result<(), PdoError> {
        Err(PdoError::RtrUnsupported)
    }

    /// Subscribe to received PDO payloads
    pub fn subscribe(&self) -> broadcast::Receiver<PdoData> {
        self.events.subscribe()
    }
}

impl<S: AsyncCanSender> Drop for PdoManager<S> {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}
