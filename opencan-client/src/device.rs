//! Device facade binding one node to every client service
//!
//! A [`Device`] owns one instance of each service, all multiplexed over a
//! single transport: an SDO client, NMT master, PDO manager, emergency
//! monitor and heartbeat consumer, plus a lazily created SYNC producer. It
//! carries no protocol state of its own beyond the node's last observed NMT
//! state.
//!
//! The cached NMT state is updated optimistically when Start, Stop or
//! PreOperational commands are sent (not on resets, where the true state
//! arrives via heartbeat), and corrected whenever the bound node's own
//! heartbeat is observed.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;

use opencan_common::constants::{heartbeat_id, object_ids, rpdo_id, tpdo_id};
use opencan_common::messages::{Heartbeat, NmtState};
use opencan_common::{AsyncCanReceiver, AsyncCanSender, NodeId, TransportError};

use crate::bus::{SharedReceiver, SharedSender};
use crate::emcy_monitor::EmcyMonitor;
use crate::heartbeat::{HeartbeatMonitor, DEFAULT_CHECK_INTERVAL};
use crate::nmt_master::NmtMaster;
use crate::node_config::{NodeConfig, NodeConfigError};
use crate::pdo::{ConfigError, PdoConfig, PdoManager};
use crate::sdo_client::{SdoClient, SdoClientError, DEFAULT_RESPONSE_TIMEOUT};
use crate::sync_producer::SyncProducer;

/// Tunables for the services a [`Device`] creates
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Deadline for SDO responses
    pub sdo_timeout: Duration,
    /// Interval of the heartbeat deadline check
    pub heartbeat_check_interval: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sdo_timeout: DEFAULT_RESPONSE_TIMEOUT,
            heartbeat_check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Errors surfaced by the facade's composite operations
#[derive(Debug, Snafu)]
pub enum DeviceError {
    /// An SDO transfer failed
    #[snafu(display("SDO transfer failed: {source}"))]
    Sdo {
        /// The underlying SDO error
        source: SdoClientError,
    },
    /// The node configuration is invalid
    #[snafu(display("node configuration error: {source}"))]
    Config {
        /// The underlying configuration error
        source: NodeConfigError,
    },
    /// A PDO registry operation failed
    #[snafu(display("PDO configuration error: {source}"))]
    Pdo {
        /// The underlying configuration error
        source: ConfigError,
    },
}

/// One CANopen node as seen from this client
#[derive(Debug)]
pub struct Device<S: AsyncCanSender + 'static> {
    node_id: NodeId,
    sender: SharedSender<S>,
    nmt: NmtMaster<S>,
    sdo: SdoClient<S>,
    pdo: PdoManager<S>,
    emcy: EmcyMonitor,
    heartbeat: HeartbeatMonitor,
    sync: Option<SyncProducer<S>>,
    nmt_state: Arc<Mutex<NmtState>>,
    state_task: JoinHandle<()>,
    // Kept so further subscriptions could be created, and so the fan-out task
    // lives exactly as long as the device
    _receiver: SharedReceiver,
}

impl<S: AsyncCanSender + 'static> Device<S> {
    /// Bind a node with default service settings
    pub fn new(node_id: NodeId, sender: S, receiver: impl AsyncCanReceiver + 'static) -> Self {
        Self::with_config(node_id, sender, receiver, DeviceConfig::default())
    }

    /// Bind a node with custom service settings
    pub fn with_config(
        node_id: NodeId,
        sender: S,
        receiver: impl AsyncCanReceiver + 'static,
        config: DeviceConfig,
    ) -> Self {
        let sender = SharedSender::new(sender);
        let receiver = SharedReceiver::new(receiver);

        let nmt = NmtMaster::new(sender.clone());
        let sdo = SdoClient::with_timeout(
            node_id,
            sender.clone(),
            receiver.create_rx(),
            config.sdo_timeout,
        );
        let pdo = PdoManager::new(sender.clone(), receiver.create_rx());
        let emcy = EmcyMonitor::new(receiver.create_rx());
        let heartbeat = HeartbeatMonitor::with_check_interval(
            receiver.create_rx(),
            config.heartbeat_check_interval,
        );

        let nmt_state = Arc::new(Mutex::new(NmtState::PreOperational));
        let state_task = {
            let nmt_state = nmt_state.clone();
            let own_id = heartbeat_id(node_id);
            let mut rx = receiver.create_rx();
            tokio::spawn(async move {
                while let Ok(frame) = rx.recv().await {
                    if frame.id() != own_id {
                        continue;
                    }
                    if let Ok(heartbeat) = Heartbeat::try_from(&frame) {
                        *nmt_state.lock().unwrap() = heartbeat.state;
                    }
                }
            })
        };

        Self {
            node_id,
            sender,
            nmt,
            sdo,
            pdo,
            emcy,
            heartbeat,
            sync: None,
            nmt_state,
            state_task,
            _receiver: receiver,
        }
    }

    /// The bound node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The node's last observed NMT state
    pub fn nmt_state(&self) -> NmtState {
        *self.nmt_state.lock().unwrap()
    }

    fn set_nmt_state(&self, state: NmtState) {
        *self.nmt_state.lock().unwrap() = state;
    }

    /// The SDO client bound to this node
    pub fn sdo(&self) -> &SdoClient<S> {
        &self.sdo
    }

    /// The PDO manager for this node
    pub fn pdo(&self) -> &PdoManager<S> {
        &self.pdo
    }

    /// The emergency monitor
    pub fn emcy(&self) -> &EmcyMonitor {
        &self.emcy
    }

    /// The heartbeat consumer
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// The NMT master
    pub fn nmt(&self) -> &NmtMaster<S> {
        &self.nmt
    }

    // ------------------------------------------------------------------
    // NMT
    // ------------------------------------------------------------------

    /// Command the node to Operational
    pub async fn start(&self) -> Result<(), TransportError> {
        self.nmt.start(self.node_id).await?;
        self.set_nmt_state(NmtState::Operational);
        Ok(())
    }

    /// Command the node to Stopped
    pub async fn stop(&self) -> Result<(), TransportError> {
        self.nmt.stop(self.node_id).await?;
        self.set_nmt_state(NmtState::Stopped);
        Ok(())
    }

    /// Command the node to PreOperational
    pub async fn enter_preoperational(&self) -> Result<(), TransportError> {
        self.nmt.enter_preoperational(self.node_id).await?;
        self.set_nmt_state(NmtState::PreOperational);
        Ok(())
    }

    /// Command a full application reset
    ///
    /// The cached NMT state is left alone; the node's true state arrives via
    /// its boot-up message and heartbeats.
    pub async fn reset_node(&self) -> Result<(), TransportError> {
        self.nmt.reset_node(self.node_id).await
    }

    /// Command a communication reset
    pub async fn reset_communication(&self) -> Result<(), TransportError> {
        self.nmt.reset_communication(self.node_id).await
    }

    // ------------------------------------------------------------------
    // SDO
    // ------------------------------------------------------------------

    /// Read the raw bytes of an object
    pub async fn read(&self, index: u16, sub: u8) -> Result<Vec<u8>, SdoClientError> {
        self.sdo.upload(index, sub).await
    }

    /// Write raw bytes to an object
    pub async fn write(&self, index: u16, sub: u8, data: &[u8]) -> Result<(), SdoClientError> {
        self.sdo.download(index, sub, data).await
    }

    /// Read an object as u8
    pub async fn read_u8(&self, index: u16, sub: u8) -> Result<u8, SdoClientError> {
        Ok(unsigned_from_le(&self.sdo.upload(index, sub).await?) as u8)
    }

    /// Read an object as u16
    pub async fn read_u16(&self, index: u16, sub: u8) -> Result<u16, SdoClientError> {
        Ok(unsigned_from_le(&self.sdo.upload(index, sub).await?) as u16)
    }

    /// Read an object as u32
    pub async fn read_u32(&self, index: u16, sub: u8) -> Result<u32, SdoClientError> {
        Ok(unsigned_from_le(&self.sdo.upload(index, sub).await?) as u32)
    }

    /// Read an object as i16
    pub async fn read_i16(&self, index: u16, sub: u8) -> Result<i16, SdoClientError> {
        Ok(signed_from_le(&self.sdo.upload(index, sub).await?) as i16)
    }

    /// Read an object as i32
    pub async fn read_i32(&self, index: u16, sub: u8) -> Result<i32, SdoClientError> {
        Ok(signed_from_le(&self.sdo.upload(index, sub).await?) as i32)
    }

    /// Write a u8 value to an object
    pub async fn write_u8(&self, index: u16, sub: u8, value: u8) -> Result<(), SdoClientError> {
        self.sdo.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write a u16 value to an object
    pub async fn write_u16(&self, index: u16, sub: u8, value: u16) -> Result<(), SdoClientError> {
        self.sdo.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write a u32 value to an object
    pub async fn write_u32(&self, index: u16, sub: u8, value: u32) -> Result<(), SdoClientError> {
        self.sdo.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write an i16 value to an object
    pub async fn write_i16(&self, index: u16, sub: u8, value: i16) -> Result<(), SdoClientError> {
        self.sdo.download(index, sub, &value.to_le_bytes()).await
    }

    /// Write an i32 value to an object
    pub async fn write_i32(&self, index: u16, sub: u8, value: i32) -> Result<(), SdoClientError> {
        self.sdo.download(index, sub, &value.to_le_bytes()).await
    }

    /// Check whether the node's SDO server responds
    ///
    /// Reads the mandatory device type object. A server abort still counts
    /// as presence; only a timeout or transport failure reads as absence.
    pub async fn ping(&self) -> bool {
        match self.sdo.upload(object_ids::DEVICE_TYPE, 0).await {
            Ok(_) => true,
            Err(SdoClientError::ServerAbort { .. }) => true,
            Err(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // PDO
    // ------------------------------------------------------------------

    /// Install the four standard TPDO COB-IDs for this node
    ///
    /// The configurations start without mappings; add them through
    /// [`PdoManager::configure_tpdo`] or a [`NodeConfig`].
    pub fn setup_standard_tpdos(&self) -> Result<(), ConfigError> {
        for pdo_number in 1..=4u8 {
            if let Some(id) = tpdo_id(pdo_number, self.node_id) {
                self.pdo.configure_tpdo(PdoConfig::new(pdo_number, id.raw())?)?;
            }
        }
        Ok(())
    }

    /// Install the four standard RPDO COB-IDs for this node
    pub fn setup_standard_rpdos(&self) -> Result<(), ConfigError> {
        for pdo_number in 1..=4u8 {
            if let Some(id) = rpdo_id(pdo_number, self.node_id) {
                self.pdo.configure_rpdo(PdoConfig::new(pdo_number, id.raw())?)?;
            }
        }
        Ok(())
    }

    /// Write a node configuration to the device over SDO
    ///
    /// For every PDO in the configuration this writes the communication
    /// parameters, clears the mapping count, writes each 32-bit mapping
    /// value, and finally writes the count. The configurations are also
    /// stored in the local PDO registries.
    pub async fn apply_config(&self, config: &NodeConfig) -> Result<(), DeviceError> {
        for pdo in config.tpdo_configs().context(ConfigSnafu)? {
            let slot = (pdo.pdo_number - 1) as u16;
            self.write_pdo_parameters(
                object_ids::TPDO_COMM_BASE + slot,
                object_ids::TPDO_MAPPING_BASE + slot,
                &pdo,
            )
            .await?;
            self.pdo.configure_tpdo(pdo).context(PdoSnafu)?;
        }
        for pdo in config.rpdo_configs().context(ConfigSnafu)? {
            let slot = (pdo.pdo_number - 1) as u16;
            self.write_pdo_parameters(
                object_ids::RPDO_COMM_BASE + slot,
                object_ids::RPDO_MAPPING_BASE + slot,
                &pdo,
            )
            .await?;
            self.pdo.configure_rpdo(pdo).context(PdoSnafu)?;
        }
        Ok(())
    }

    async fn write_pdo_parameters(
        &self,
        comm_index: u16,
        mapping_index: u16,
        pdo: &PdoConfig,
    ) -> Result<(), DeviceError> {
        self.write_u32(comm_index, 1, pdo.cob_id as u32)
            .await
            .context(SdoSnafu)?;
        self.write_u8(comm_index, 2, pdo.transmission_type)
            .await
            .context(SdoSnafu)?;
        self.write_u16(comm_index, 3, pdo.inhibit_time)
            .await
            .context(SdoSnafu)?;
        self.write_u16(comm_index, 5, pdo.event_timer)
            .await
            .context(SdoSnafu)?;

        // Mapping changes require the count to be zeroed first
        self.write_u8(mapping_index, 0, 0).await.context(SdoSnafu)?;
        for (i, mapping) in pdo.mappings.iter().enumerate() {
            self.write_u32(mapping_index, (i + 1) as u8, mapping.to_raw())
                .await
                .context(SdoSnafu)?;
        }
        self.write_u8(mapping_index, 0, pdo.mappings.len() as u8)
            .await
            .context(SdoSnafu)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Heartbeat and SYNC
    // ------------------------------------------------------------------

    /// Start watching this node's heartbeat with the given deadline
    pub fn enable_heartbeat_monitor(&self, timeout: Duration) {
        self.heartbeat.monitor(self.node_id, timeout);
    }

    /// Stop watching this node's heartbeat
    pub fn disable_heartbeat_monitor(&self) {
        self.heartbeat.stop(self.node_id);
    }

    /// Start producing SYNC frames
    ///
    /// The producer is created on first use. Enabling while running restarts
    /// the producer with the new settings.
    pub fn enable_sync(&mut self, period: Duration, with_counter: bool) {
        let mut producer = if with_counter {
            SyncProducer::with_counter(self.sender.clone(), period)
        } else {
            SyncProducer::new(self.sender.clone(), period)
        };
        producer.start();
        self.sync = Some(producer);
    }

    /// Stop producing SYNC frames
    pub fn disable_sync(&mut self) {
        if let Some(mut producer) = self.sync.take() {
            producer.stop();
        }
    }

    /// Whether the SYNC producer is currently running
    pub fn sync_running(&self) -> bool {
        self.sync.as_ref().is_some_and(|p| p.is_running())
    }
}

impl<S: AsyncCanSender + 'static> Drop for Device<S> {
    fn drop(&mut self) {
        self.state_task.abort();
    }
}

/// Zero-extending little-endian conversion for short SDO payloads
fn unsigned_from_le(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, b) in bytes.iter().take(8).enumerate() {
        value |= (*b as u64) << (8 * i);
    }
    value
}

/// Sign-extending little-endian conversion for short SDO payloads
///
/// The sign bit of the highest byte the server actually sent is extended.
fn signed_from_le(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let bits = (bytes.len().min(8) * 8) as u32;
    let value = unsigned_from_le(bytes);
    if bits >= 64 {
        return value as i64;
    }
    if (value >> (bits - 1)) & 1 == 1 {
        (value | !((1u64 << bits) - 1)) as i64
    } else {
        value as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_from_le_zero_extends() {
        assert_eq!(0x0637, unsigned_from_le(&[0x37, 0x06]));
        assert_eq!(0x37, unsigned_from_le(&[0x37]));
        assert_eq!(0, unsigned_from_le(&[]));
    }

    #[test]
    fn test_signed_from_le_sign_extends_short_payloads() {
        assert_eq!(-1, signed_from_le(&[0xFF]));
        assert_eq!(-2, signed_from_le(&[0xFE, 0xFF]));
        assert_eq!(0x7F, signed_from_le(&[0x7F]));
        assert_eq!(-0x8000, signed_from_le(&[0x00, 0x80]));
    }
}
