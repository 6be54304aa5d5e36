//! Raw SocketCAN bus (Linux only)
//!
//! The kernel ISO-TP stack is bypassed: frames are read and written raw so
//! the transport node does its own segmentation and flow control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use ::socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use udstp_core::frame::CLASSIC_FRAME_LEN;
use udstp_core::{CanId, RawFrame};

use crate::bus::{BusError, BusIo};

const RECEIVE_QUEUE: usize = 1024;
const MAX_STANDARD_ID: CanId = 0x7FF;

/// Raw CAN socket bound to one interface
pub struct SocketCanBus {
    interface: String,
    socket: Arc<Mutex<CanSocket>>,
    running: Arc<AtomicBool>,
    frames: tokio::sync::Mutex<mpsc::Receiver<RawFrame>>,
}

impl SocketCanBus {
    /// Open `interface` (e.g. "can0", "vcan0") and start the reader thread
    /// on the current tokio runtime's blocking pool
    pub async fn open(interface: &str) -> Result<Self, BusError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            BusError::ReceiveFailed(format!("Failed to open CAN socket on {}: {}", interface, e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| BusError::ReceiveFailed(format!("Failed to set non-blocking: {}", e)))?;

        let socket = Arc::new(Mutex::new(socket));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE);

        Self::start_reader(Arc::clone(&socket), Arc::clone(&running), tx);
        info!(interface = %interface, "SocketCAN bus opened");

        Ok(Self {
            interface: interface.to_string(),
            socket,
            running,
            frames: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn start_reader(
        socket: Arc<Mutex<CanSocket>>,
        running: Arc<AtomicBool>,
        tx: mpsc::Sender<RawFrame>,
    ) {
        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(frame @ CanFrame::Data(_)) => {
                        let raw = RawFrame::new(frame.raw_id(), frame.data());
                        if tx.blocking_send(raw).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!(?e, "SocketCAN read error");
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            debug!("SocketCAN reader stopped");
        });
    }

    fn build_frame(id: CanId, data: &[u8]) -> Option<CanFrame> {
        if id <= MAX_STANDARD_ID {
            StandardId::new(id as u16).and_then(|sid| CanFrame::new(sid, data))
        } else {
            ExtendedId::new(id).and_then(|eid| CanFrame::new(eid, data))
        }
    }
}

impl Drop for SocketCanBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl BusIo for SocketCanBus {
    async fn send(&self, id: CanId, data: &[u8]) -> Result<(), BusError> {
        if data.len() > CLASSIC_FRAME_LEN {
            return Err(BusError::FrameTooLong(data.len()));
        }
        let frame = Self::build_frame(id, data)
            .ok_or_else(|| BusError::SendFailed(format!("Invalid CAN ID 0x{:X}", id)))?;

        self.socket
            .lock()
            .write_frame(&frame)
            .map_err(|e| BusError::SendFailed(format!("0x{:03X}: {}", id, e)))
    }

    async fn receive(&self) -> Result<RawFrame, BusError> {
        self.frames.lock().await.recv().await.ok_or(BusError::Closed)
    }
}
