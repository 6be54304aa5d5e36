//! Transport-layer errors

use thiserror::Error;

use crate::CanId;

/// Errors raised by the ISO-TP transport core
///
/// Frame-level errors drop the offending frame and leave every session
/// untouched. Session-level errors terminate exactly one session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TpError {
    // Malformed input
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Invalid length: {0}")]
    InvalidLength(String),

    #[error("Invalid separation time: 0x{0:02X}")]
    InvalidSeparationTime(u8),

    #[error("Invalid flow status: 0x{0:X}")]
    InvalidFlowStatus(u8),

    #[error("Unknown frame type: PCI 0x{0:02X}")]
    UnknownFrameType(u8),

    // Session protocol violations
    #[error("Unexpected frame from 0x{0:03X}")]
    UnexpectedFrame(CanId),

    #[error("Sequence mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u8, got: u8 },

    // Timing and peer behaviour
    #[error("Timeout waiting for consecutive frame")]
    ReassemblyTimeout,

    #[error("Timeout waiting for flow control")]
    FlowControlTimeout,

    #[error("Peer not ready: {0} consecutive wait frames")]
    PeerNotReady(u8),

    #[error("Peer reported buffer overflow")]
    PeerOverflow,

    #[error("Superseded by a new first frame")]
    Superseded,

    #[error("Session cancelled")]
    Cancelled,

    // Configuration
    #[error("Duplicate address: 0x{id:03X} already registered to {ecu}")]
    DuplicateAddress { id: CanId, ecu: String },

    #[error("Unknown address: 0x{0:03X}")]
    UnknownAddress(CanId),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bus error: {0}")]
    Bus(String),
}

impl TpError {
    /// True for errors caused by a single malformed frame
    pub fn is_frame_error(&self) -> bool {
        matches!(
            self,
            TpError::EmptyFrame
                | TpError::InvalidLength(_)
                | TpError::InvalidSeparationTime(_)
                | TpError::InvalidFlowStatus(_)
                | TpError::UnknownFrameType(_)
        )
    }

    /// True for errors that terminate one reception or transmission session
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            TpError::UnexpectedFrame(_)
                | TpError::SequenceMismatch { .. }
                | TpError::ReassemblyTimeout
                | TpError::FlowControlTimeout
                | TpError::PeerNotReady(_)
                | TpError::PeerOverflow
                | TpError::Superseded
                | TpError::Cancelled
        )
    }
}

/// Result alias for the transport core
pub type TpResult<T> = Result<T, TpError>;
