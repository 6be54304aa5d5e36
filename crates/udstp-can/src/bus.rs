//! Bus I/O abstraction

use async_trait::async_trait;
use thiserror::Error;
use udstp_core::{CanId, RawFrame, TpError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Bus closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Frame too long: {0} bytes")]
    FrameTooLong(usize),
}

impl From<BusError> for TpError {
    fn from(err: BusError) -> Self {
        TpError::Bus(err.to_string())
    }
}

/// Raw CAN frame I/O
///
/// Implemented by real controllers and by [`crate::mock::VirtualBus`]
/// endpoints. The transport node owns one `BusIo` and is the only reader.
#[async_trait]
pub trait BusIo: Send + Sync {
    /// Put one frame on the bus
    async fn send(&self, id: CanId, data: &[u8]) -> Result<(), BusError>;

    /// Wait for the next frame addressed to anyone
    ///
    /// Must be cancel-safe: the node polls it inside `tokio::select!` and
    /// drops the future whenever another branch wins, so no frame may be
    /// lost when that happens.
    async fn receive(&self) -> Result<RawFrame, BusError>;
}
