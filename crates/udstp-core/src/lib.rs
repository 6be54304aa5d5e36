//! udstp-core - ISO-TP transport core for UDS over CAN
//!
//! Sans-I/O building blocks: nothing here touches a socket or a clock.
//! Callers pass raw frames and `Instant`s in and get frames to send,
//! completed messages and deadlines back.
//!
//! # Architecture
//!
//! ```text
//!              raw CAN frame
//!                    │
//!   ┌────────────────┴───────────────┐
//!   │ AddressTable + frame::classify │
//!   └───────┬────────────────┬───────┘
//!           │ SF / FF / CF   │ FC
//!  ┌────────┴─────────┐  ┌───┴─────────────┐
//!  │ ReassemblyEngine │  │ TransmitSession │
//!  └────────┬─────────┘  └─────────────────┘
//!           │ CompletedMessage
//!  ┌────────┴─────────┐
//!  │ service::classify│
//!  └──────────────────┘
//! ```

pub mod addressing;
pub mod config;
pub mod error;
pub mod frame;
pub mod pacer;
pub mod reassembly;
pub mod service;

/// CAN identifier, 11-bit or 29-bit
pub type CanId = u32;

pub use addressing::{
    AddressRole, AddressTable, FunctionalAddressGroup, PhysicalAddressPair, Resolution,
};
pub use config::{
    AddressingConfig, EcuAddressConfig, ReceiverConfig, SenderConfig, TransportConfig,
};
pub use error::{TpError, TpResult};
pub use frame::{FlowControl, FlowStatus, Pdu, RawFrame, SeparationTime};
pub use pacer::{BlockPlan, PacerAction, Transmission, TransmitSession, TxPoll, TxState};
pub use reassembly::{CompletedMessage, Reassembly, ReassemblyEngine, SessionAbort};
pub use service::{ServiceCategory, ServiceClassification, ServiceId};
