//! In-memory CAN bus for tests and simulations

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};
use udstp_core::frame::CLASSIC_FRAME_LEN;
use udstp_core::{CanId, RawFrame};

use crate::bus::{BusError, BusIo};

const BUS_CAPACITY: usize = 1024;
/// Origin used for frames injected from outside any endpoint
const INJECTED: usize = usize::MAX;

#[derive(Debug, Clone)]
struct BusFrame {
    origin: usize,
    frame: RawFrame,
}

/// Broadcast bus shared by any number of endpoints
///
/// Every frame reaches every endpoint except the one that sent it. All
/// frames are recorded in order so tests can inspect the traffic.
#[derive(Debug, Clone)]
pub struct VirtualBus {
    tx: broadcast::Sender<BusFrame>,
    next_endpoint: Arc<AtomicUsize>,
    log: Arc<RwLock<Vec<RawFrame>>>,
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            next_endpoint: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Attach a new endpoint; it sees frames sent from now on
    pub fn endpoint(&self) -> VirtualBusEndpoint {
        VirtualBusEndpoint {
            index: self.next_endpoint.fetch_add(1, Ordering::SeqCst),
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            log: Arc::clone(&self.log),
        }
    }

    /// Put a frame on the bus that every endpoint receives
    pub fn inject(&self, id: CanId, data: &[u8]) {
        let frame = RawFrame::new(id, data);
        self.log.write().push(frame.clone());
        let _ = self.tx.send(BusFrame {
            origin: INJECTED,
            frame,
        });
    }

    /// Every frame sent so far, oldest first
    pub fn sent_frames(&self) -> Vec<RawFrame> {
        self.log.read().clone()
    }

    /// Frames sent so far on one identifier
    pub fn frames_on(&self, id: CanId) -> Vec<RawFrame> {
        self.log
            .read()
            .iter()
            .filter(|frame| frame.id == id)
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.log.write().clear();
    }
}

/// One participant on a [`VirtualBus`]
#[derive(Debug)]
pub struct VirtualBusEndpoint {
    index: usize,
    tx: broadcast::Sender<BusFrame>,
    rx: Mutex<broadcast::Receiver<BusFrame>>,
    log: Arc<RwLock<Vec<RawFrame>>>,
}

#[async_trait]
impl BusIo for VirtualBusEndpoint {
    async fn send(&self, id: CanId, data: &[u8]) -> Result<(), BusError> {
        if data.len() > CLASSIC_FRAME_LEN {
            return Err(BusError::FrameTooLong(data.len()));
        }

        let frame = RawFrame::new(id, data);
        debug!(endpoint = self.index, %frame, "Virtual bus: frame sent");
        self.log.write().push(frame.clone());
        // nobody listening is not an error on a broadcast medium
        let _ = self.tx.send(BusFrame {
            origin: self.index,
            frame,
        });
        Ok(())
    }

    async fn receive(&self) -> Result<RawFrame, BusError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(bus_frame) if bus_frame.origin == self.index => continue,
                Ok(bus_frame) => return Ok(bus_frame.frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(endpoint = self.index, skipped, "Virtual bus: receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
            }
        }
    }
}
