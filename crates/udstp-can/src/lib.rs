//! udstp-can - async ISO-TP transport over a CAN bus
//!
//! Runs the `udstp-core` state machines on tokio. A [`TransportNode`]
//! owns one [`BusIo`] and exchanges complete diagnostic messages with the
//! layer above through a [`TransportHandle`] and a [`TpEvent`] stream.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use udstp_can::{NodeRole, TransportNode, VirtualBus};
//! use udstp_core::{AddressTable, TransportConfig};
//!
//! let config = TransportConfig::load("udstp.toml")?;
//! let table = Arc::new(AddressTable::from_config(&config.addressing)?);
//! let bus = VirtualBus::new();
//! let (handle, mut events, _task) =
//!     TransportNode::spawn(Arc::new(bus.endpoint()), table, NodeRole::Tester, &config)?;
//!
//! handle.transmit(0x7E0, vec![0x22, 0xF1, 0x90]).await?;
//! let response = events.recv().await;
//! ```

pub mod bus;
pub mod mock;
pub mod node;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use bus::{BusError, BusIo};
pub use mock::{VirtualBus, VirtualBusEndpoint};
pub use node::{DiagnosticMessage, NodeRole, TpEvent, TransportHandle, TransportNode};

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub use crate::socketcan::SocketCanBus;
