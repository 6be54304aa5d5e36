//! Transport configuration
//!
//! Receiver/sender timing and flow-control parameters plus the already
//! parsed addressing records. Loadable from TOML; CAN identifiers and byte
//! values accept either hex strings ("0x7E0") or integers.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TpError, TpResult};
use crate::frame::SeparationTime;
use crate::CanId;

/// Complete transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub sender: SenderConfig,
    #[serde(default)]
    pub addressing: AddressingConfig,
}

impl TransportConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> TpResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TpError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> TpResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| TpError::Config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TpResult<()> {
        self.receiver.separation_time()?;
        if self.receiver.max_message_len == 0 {
            return Err(TpError::Config(
                "receiver.max_message_len must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters advertised to peers when receiving segmented messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Block size sent in flow control (0 = no further flow control)
    #[serde(default)]
    pub block_size: u8,
    /// Raw STmin byte sent in flow control
    #[serde(default, deserialize_with = "deserialize_hex_u8")]
    pub st_min: u8,
    /// N_Cr: wait for the next consecutive frame (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub n_cr_ms: u64,
    /// Longest message accepted; longer first frames get an overflow reply
    #[serde(default = "default_max_message_len")]
    pub max_message_len: u32,
    /// Padding byte for outgoing flow control frames
    #[serde(default, deserialize_with = "deserialize_optional_hex_u8")]
    pub padding: Option<u8>,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_message_len() -> u32 {
    4095
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 0,
            n_cr_ms: default_timeout_ms(),
            max_message_len: default_max_message_len(),
            padding: None,
        }
    }
}

impl ReceiverConfig {
    pub fn n_cr(&self) -> Duration {
        Duration::from_millis(self.n_cr_ms)
    }

    pub fn separation_time(&self) -> TpResult<SeparationTime> {
        SeparationTime::from_byte(self.st_min)
    }
}

/// Parameters for segmented transmission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// N_Bs: wait for a flow control frame (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub n_bs_ms: u64,
    /// Consecutive Wait flow controls tolerated before aborting
    #[serde(default = "default_max_wait_frames")]
    pub max_wait_frames: u8,
    /// Padding byte for outgoing data frames
    #[serde(default, deserialize_with = "deserialize_optional_hex_u8")]
    pub padding: Option<u8>,
}

fn default_max_wait_frames() -> u8 {
    2
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            n_bs_ms: default_timeout_ms(),
            max_wait_frames: default_max_wait_frames(),
            padding: None,
        }
    }
}

impl SenderConfig {
    pub fn n_bs(&self) -> Duration {
        Duration::from_millis(self.n_bs_ms)
    }
}

/// Addressing records supplied at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressingConfig {
    #[serde(default)]
    pub ecus: Vec<EcuAddressConfig>,
    #[serde(default, deserialize_with = "deserialize_can_ids")]
    pub functional: Vec<CanId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcuAddressConfig {
    pub name: String,
    #[serde(deserialize_with = "deserialize_can_id")]
    pub request_id: CanId,
    #[serde(deserialize_with = "deserialize_can_id")]
    pub response_id: CanId,
}

/// Parse a CAN identifier ("0x7E0" or "2016")
pub fn parse_can_id(s: &str) -> TpResult<CanId> {
    let s = s.trim();
    let (digits, radix) = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (s, 10),
    };
    CanId::from_str_radix(digits, radix)
        .map_err(|e| TpError::Config(format!("Invalid CAN ID '{}': {}", s, e)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HexOrInt {
    Hex(String),
    Int(u32),
}

impl HexOrInt {
    fn value(self) -> TpResult<u32> {
        match self {
            HexOrInt::Int(n) => Ok(n),
            HexOrInt::Hex(s) => parse_can_id(&s),
        }
    }
}

fn deserialize_can_id<'de, D>(deserializer: D) -> Result<CanId, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    HexOrInt::deserialize(deserializer)?
        .value()
        .map_err(|e| D::Error::custom(e.to_string()))
}

fn deserialize_can_ids<'de, D>(deserializer: D) -> Result<Vec<CanId>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    Vec::<HexOrInt>::deserialize(deserializer)?
        .into_iter()
        .map(|v| v.value().map_err(|e| D::Error::custom(e.to_string())))
        .collect()
}

fn deserialize_hex_u8<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value = HexOrInt::deserialize(deserializer)?
        .value()
        .map_err(|e| D::Error::custom(e.to_string()))?;
    u8::try_from(value).map_err(|_| D::Error::custom(format!("0x{:X} does not fit a byte", value)))
}

fn deserialize_optional_hex_u8<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_hex_u8(deserializer).map(Some)
}
