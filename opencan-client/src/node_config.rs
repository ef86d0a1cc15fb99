//! TOML node configuration files
//!
//! A node configuration describes the PDO setup to be applied to a device:
//!
//! ```toml
//! [tpdo.1]
//! cob = 0x181
//! transmission_type = 254
//! mappings = [
//!     { index = 0x6041, sub = 0, bit_length = 16 },
//!     { index = 0x606C, sub = 0, bit_length = 32 },
//! ]
//! ```
//!
//! Configurations are applied over SDO by
//! [`Device::apply_config`](crate::Device::apply_config).
use std::collections::HashMap;
use std::path::Path;

use serde::{de, Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};

use crate::pdo::{ConfigError, PdoConfig, PdoMapping};

/// Error returned when loading node configuration files
#[derive(Debug, Snafu)]
pub enum NodeConfigError {
    /// Reading the file failed
    #[snafu(display("IO error loading {path}: {source:?}"))]
    Io {
        /// The path that failed to load
        path: String,
        /// The underlying IO error
        source: std::io::Error,
    },
    /// The file is not valid TOML for this format
    #[snafu(display("Error parsing TOML: {source}"))]
    TomlDeserialization {
        /// The underlying parse error
        source: toml::de::Error,
    },
    /// A PDO entry violates the configuration invariants
    #[snafu(display("Invalid PDO {pdo_number} in configuration: {source}"))]
    InvalidPdo {
        /// The offending PDO number
        pdo_number: u8,
        /// The underlying configuration error
        source: ConfigError,
    },
}

/// A node configuration
///
/// Represents a runtime configuration which can be loaded into a node,
/// describing its transmit and receive PDOs.
#[derive(Debug, Clone)]
pub struct NodeConfig(NodeConfigSerializer);

impl NodeConfig {
    /// Read a configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<NodeConfig, NodeConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).context(IoSnafu {
            path: path.to_string_lossy(),
        })?;
        Self::load_from_str(&content)
    }

    /// Read a configuration from a string
    pub fn load_from_str(s: &str) -> Result<NodeConfig, NodeConfigError> {
        let raw_config: NodeConfigSerializer =
            toml::from_str(s).context(TomlDeserializationSnafu)?;
        Ok(NodeConfig(raw_config))
    }

    /// Build the transmit PDO configurations, validating each entry
    pub fn tpdo_configs(&self) -> Result<Vec<PdoConfig>, NodeConfigError> {
        build_configs(&self.0.tpdo)
    }

    /// Build the receive PDO configurations, validating each entry
    pub fn rpdo_configs(&self) -> Result<Vec<PdoConfig>, NodeConfigError> {
        build_configs(&self.0.rpdo)
    }
}

fn build_configs(entries: &HashMap<u8, PdoEntry>) -> Result<Vec<PdoConfig>, NodeConfigError> {
    let mut numbers: Vec<u8> = entries.keys().copied().collect();
    numbers.sort_unstable();

    let mut configs = Vec::with_capacity(numbers.len());
    for number in numbers {
        let entry = &entries[&number];
        let mut config =
            PdoConfig::new(number, entry.cob).context(InvalidPdoSnafu { pdo_number: number })?;
        config.transmission_type = entry.transmission_type;
        config.inhibit_time = entry.inhibit_time;
        config.event_timer = entry.event_timer;
        for mapping in &entry.mappings {
            config
                .add_mapping(*mapping)
                .context(InvalidPdoSnafu { pdo_number: number })?;
        }
        configs.push(config);
    }
    Ok(configs)
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeConfigSerializer {
    #[serde(deserialize_with = "deserialize_pdo_map", default)]
    tpdo: HashMap<u8, PdoEntry>,
    #[serde(deserialize_with = "deserialize_pdo_map", default)]
    rpdo: HashMap<u8, PdoEntry>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PdoEntry {
    /// The COB ID this PDO will use to send/receive
    pub cob: u16,
    #[serde(default = "default_transmission_type")]
    pub transmission_type: u8,
    #[serde(default)]
    pub inhibit_time: u16,
    #[serde(default)]
    pub event_timer: u16,
    #[serde(default)]
    pub mappings: Vec<PdoMapping>,
}

fn default_transmission_type() -> u8 {
    254
}

fn deserialize_pdo_map<'de, D>(deserializer: D) -> Result<HashMap<u8, PdoEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let str_map = HashMap::<String, PdoEntry>::deserialize(deserializer)?;
    let original_len = str_map.len();
    let data = {
        str_map
            .into_iter()
            .map(|(str_key, value)| match str_key.parse() {
                Ok(int_key) => Ok((int_key, value)),
                Err(_) => Err(de::Error::invalid_value(
                    de::Unexpected::Str(&str_key),
                    &"a PDO number",
                )),
            })
            .collect::<Result<HashMap<_, _>, _>>()?
    };
    // multiple strings could parse to the same int, e.g "1" and "01"
    if data.len() < original_len {
        return Err(de::Error::custom("detected duplicate PDO number"));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_config_parse() {
        let str = r#"
        [tpdo.1]
        cob = 0x181
        transmission_type = 254
        mappings = [
            { index = 0x6041, sub = 0, bit_length = 16 },
            { index = 0x606C, sub = 0, bit_length = 32 },
        ]

        [rpdo.1]
        cob = 0x201
        mappings = [
            { index = 0x6040, sub = 0, bit_length = 16 },
        ]
        "#;

        let config = NodeConfig::load_from_str(str).expect("Failed to parse config");
        let tpdos = config.tpdo_configs().unwrap();
        assert_eq!(1, tpdos.len());
        assert_eq!(0x181, tpdos[0].cob_id);
        assert_eq!(48, tpdos[0].total_bits());

        let rpdos = config.rpdo_configs().unwrap();
        assert_eq!(1, rpdos.len());
        assert_eq!(254, rpdos[0].transmission_type);
    }

    #[test]
    fn test_node_config_rejects_overflowing_mappings() {
        let str = r#"
        [tpdo.2]
        cob = 0x281
        mappings = [
            { index = 0x2000, sub = 1, bit_length = 64 },
            { index = 0x2000, sub = 2, bit_length = 8 },
        ]
        "#;

        let config = NodeConfig::load_from_str(str).unwrap();
        let result = config.tpdo_configs();
        assert!(matches!(
            result,
            Err(NodeConfigError::InvalidPdo { pdo_number: 2, .. })
        ));
    }

    #[test]
    fn test_node_config_rejects_duplicate_keys() {
        let str = r#"
        [tpdo.1]
        cob = 0x181

        [tpdo.01]
        cob = 0x182
        "#;

        assert!(NodeConfig::load_from_str(str).is_err());
    }
}
