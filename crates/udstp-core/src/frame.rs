//! ISO-TP protocol data units (ISO 15765-2)
//!
//! Classification of raw classic-CAN payloads into Single, First,
//! Consecutive and Flow Control frames, and the matching encoders used on
//! the transmit side. Everything here is pure: no session is touched.

use std::fmt;
use std::time::Duration;

use crate::error::{TpError, TpResult};
use crate::CanId;

/// Maximum payload of a classic CAN frame
pub const CLASSIC_FRAME_LEN: usize = 8;
/// Data bytes carried by a Single Frame
pub const SINGLE_FRAME_CAPACITY: usize = 7;
/// Data bytes carried by a First Frame with a 12-bit length
pub const FIRST_FRAME_CAPACITY: usize = 6;
/// Data bytes carried by a First Frame with the 32-bit escape length
pub const FIRST_FRAME_ESCAPE_CAPACITY: usize = 2;
/// Data bytes carried by a Consecutive Frame
pub const CONSECUTIVE_FRAME_CAPACITY: usize = 7;
/// Largest message length expressible in the 12-bit First Frame field
pub const MAX_SHORT_MESSAGE_LEN: usize = 0x0FFF;

/// Protocol control information (high nibble of byte 0)
mod pci {
    pub const SINGLE: u8 = 0x0;
    pub const FIRST: u8 = 0x1;
    pub const CONSECUTIVE: u8 = 0x2;
    pub const FLOW_CONTROL: u8 = 0x3;
}

/// One frame as seen on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub id: CanId,
    pub data: Vec<u8>,
}

impl RawFrame {
    pub fn new(id: CanId, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:03X} [{}]", self.id, hex::encode_upper(&self.data))
    }
}

/// Flow status nibble of a Flow Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowStatus {
    ContinueToSend = 0x0,
    Wait = 0x1,
    Overflow = 0x2,
}

impl FlowStatus {
    pub fn from_nibble(value: u8) -> TpResult<Self> {
        match value {
            0x0 => Ok(Self::ContinueToSend),
            0x1 => Ok(Self::Wait),
            0x2 => Ok(Self::Overflow),
            other => Err(TpError::InvalidFlowStatus(other)),
        }
    }
}

/// Minimum separation time between Consecutive Frames (STmin)
///
/// Only valid encodings can be constructed: `0x00..=0x7F` milliseconds and
/// `0xF1..=0xF9` for 100 to 900 microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeparationTime(u8);

impl SeparationTime {
    pub const ZERO: Self = Self(0);

    pub fn from_byte(value: u8) -> TpResult<Self> {
        match value {
            0x00..=0x7F | 0xF1..=0xF9 => Ok(Self(value)),
            other => Err(TpError::InvalidSeparationTime(other)),
        }
    }

    /// Encode the smallest STmin that is at least `duration`, saturating at 127 ms
    pub fn from_duration(duration: Duration) -> Self {
        let micros = duration.as_micros();
        match micros {
            0 => Self::ZERO,
            1..=900 => Self(0xF0 + micros.div_ceil(100) as u8),
            _ => Self(micros.div_ceil(1000).min(0x7F) as u8),
        }
    }

    pub fn to_byte(self) -> u8 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        match self.0 {
            ms @ 0x00..=0x7F => Duration::from_millis(u64::from(ms)),
            us @ 0xF1..=0xF9 => Duration::from_micros(u64::from(us - 0xF0) * 100),
            // unreachable through the constructors; ISO 15765-2 maps reserved values to 127 ms
            _ => Duration::from_millis(0x7F),
        }
    }
}

/// Decoded Flow Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    pub status: FlowStatus,
    /// Consecutive Frames allowed before the next Flow Control (0 = unlimited)
    pub block_size: u8,
    pub st_min: SeparationTime,
}

impl FlowControl {
    pub fn continue_to_send(block_size: u8, st_min: SeparationTime) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            st_min,
        }
    }

    pub fn wait() -> Self {
        Self {
            status: FlowStatus::Wait,
            block_size: 0,
            st_min: SeparationTime::ZERO,
        }
    }

    pub fn overflow() -> Self {
        Self {
            status: FlowStatus::Overflow,
            block_size: 0,
            st_min: SeparationTime::ZERO,
        }
    }
}

/// Classified frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    /// Complete message in one frame; `data.len()` is the encoded length
    Single { data: Vec<u8> },
    /// Start of a segmented message
    First { total_len: u32, data: Vec<u8> },
    /// Continuation chunk; `sequence` is mod 16
    Consecutive { sequence: u8, data: Vec<u8> },
    FlowControl(FlowControl),
}

impl Pdu {
    pub fn kind(&self) -> &'static str {
        match self {
            Pdu::Single { .. } => "SF",
            Pdu::First { .. } => "FF",
            Pdu::Consecutive { .. } => "CF",
            Pdu::FlowControl(_) => "FC",
        }
    }
}

/// Classify one classic-CAN payload
pub fn classify(data: &[u8]) -> TpResult<Pdu> {
    let (&head, rest) = data.split_first().ok_or(TpError::EmptyFrame)?;
    if data.len() > CLASSIC_FRAME_LEN {
        return Err(TpError::InvalidLength(format!(
            "frame of {} bytes exceeds classic CAN payload",
            data.len()
        )));
    }

    match head >> 4 {
        pci::SINGLE => {
            let len = usize::from(head & 0x0F);
            if len == 0 || len > SINGLE_FRAME_CAPACITY || len > rest.len() {
                return Err(TpError::InvalidLength(format!(
                    "single frame declares {} bytes, frame carries {}",
                    len,
                    rest.len()
                )));
            }
            // bytes past the declared length are padding
            Ok(Pdu::Single {
                data: rest[..len].to_vec(),
            })
        }
        pci::FIRST => {
            let Some((&low, after)) = rest.split_first() else {
                return Err(TpError::InvalidLength(
                    "first frame without length byte".to_string(),
                ));
            };
            let short_len = (u32::from(head & 0x0F) << 8) | u32::from(low);
            if short_len != 0 {
                if short_len as usize <= SINGLE_FRAME_CAPACITY {
                    return Err(TpError::InvalidLength(format!(
                        "first frame length {} fits a single frame",
                        short_len
                    )));
                }
                return Ok(Pdu::First {
                    total_len: short_len,
                    data: after.to_vec(),
                });
            }

            if after.len() < 4 {
                return Err(TpError::InvalidLength(
                    "first frame too short for escape length".to_string(),
                ));
            }
            let total_len = u32::from_be_bytes([after[0], after[1], after[2], after[3]]);
            if total_len == 0 {
                return Err(TpError::InvalidLength(
                    "first frame escape length is zero".to_string(),
                ));
            }
            if total_len as usize <= SINGLE_FRAME_CAPACITY {
                return Err(TpError::InvalidLength(format!(
                    "first frame escape length {} fits a single frame",
                    total_len
                )));
            }
            Ok(Pdu::First {
                total_len,
                data: after[4..].to_vec(),
            })
        }
        pci::CONSECUTIVE => Ok(Pdu::Consecutive {
            sequence: head & 0x0F,
            data: rest.to_vec(),
        }),
        pci::FLOW_CONTROL => {
            if rest.len() < 2 {
                return Err(TpError::InvalidLength(format!(
                    "flow control needs 3 bytes, got {}",
                    data.len()
                )));
            }
            Ok(Pdu::FlowControl(FlowControl {
                status: FlowStatus::from_nibble(head & 0x0F)?,
                block_size: rest[0],
                st_min: SeparationTime::from_byte(rest[1])?,
            }))
        }
        _ => Err(TpError::UnknownFrameType(head)),
    }
}

/// Data bytes the First Frame of a `total_len` message can carry
pub fn first_frame_capacity(total_len: usize) -> usize {
    if total_len <= MAX_SHORT_MESSAGE_LEN {
        FIRST_FRAME_CAPACITY
    } else {
        FIRST_FRAME_ESCAPE_CAPACITY
    }
}

pub fn encode_single(payload: &[u8], padding: Option<u8>) -> TpResult<Vec<u8>> {
    if payload.is_empty() || payload.len() > SINGLE_FRAME_CAPACITY {
        return Err(TpError::InvalidLength(format!(
            "{} bytes do not fit a single frame",
            payload.len()
        )));
    }
    let mut buf = Vec::with_capacity(CLASSIC_FRAME_LEN);
    buf.push((pci::SINGLE << 4) | payload.len() as u8);
    buf.extend_from_slice(payload);
    Ok(pad(buf, padding))
}

/// Encode a First Frame header plus the initial `chunk` of a `total_len` message
pub fn encode_first(total_len: usize, chunk: &[u8], padding: Option<u8>) -> TpResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(CLASSIC_FRAME_LEN);
    if total_len <= SINGLE_FRAME_CAPACITY {
        return Err(TpError::InvalidLength(format!(
            "{} bytes fit a single frame",
            total_len
        )));
    } else if total_len <= MAX_SHORT_MESSAGE_LEN {
        buf.push((pci::FIRST << 4) | ((total_len >> 8) as u8 & 0x0F));
        buf.push(total_len as u8);
    } else {
        let escaped = u32::try_from(total_len).map_err(|_| {
            TpError::InvalidLength(format!("{} bytes exceed the 32-bit length field", total_len))
        })?;
        buf.extend_from_slice(&[pci::FIRST << 4, 0x00]);
        buf.extend_from_slice(&escaped.to_be_bytes());
    }

    if chunk.len() > CLASSIC_FRAME_LEN - buf.len() {
        return Err(TpError::InvalidLength(format!(
            "first frame chunk of {} bytes too large",
            chunk.len()
        )));
    }
    buf.extend_from_slice(chunk);
    Ok(pad(buf, padding))
}

/// Encode a Consecutive Frame; `sequence` is taken modulo 16
pub fn encode_consecutive(sequence: u8, chunk: &[u8], padding: Option<u8>) -> TpResult<Vec<u8>> {
    if chunk.len() > CONSECUTIVE_FRAME_CAPACITY {
        return Err(TpError::InvalidLength(format!(
            "consecutive frame chunk of {} bytes too large",
            chunk.len()
        )));
    }
    let mut buf = Vec::with_capacity(CLASSIC_FRAME_LEN);
    buf.push((pci::CONSECUTIVE << 4) | (sequence & 0x0F));
    buf.extend_from_slice(chunk);
    Ok(pad(buf, padding))
}

pub fn encode_flow_control(fc: &FlowControl, padding: Option<u8>) -> Vec<u8> {
    let buf = vec![
        (pci::FLOW_CONTROL << 4) | fc.status as u8,
        fc.block_size,
        fc.st_min.to_byte(),
    ];
    pad(buf, padding)
}

fn pad(mut buf: Vec<u8>, padding: Option<u8>) -> Vec<u8> {
    if let Some(byte) = padding {
        buf.resize(CLASSIC_FRAME_LEN, byte);
    }
    buf
}
