//! Reassembly of segmented messages
//!
//! One state machine per sender identifier. A sender has at most one
//! message in flight: a new First Frame or Single Frame replaces the
//! current one and the replaced session is reported as superseded.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::config::ReceiverConfig;
use crate::error::{TpError, TpResult};
use crate::frame::{FlowControl, Pdu, SeparationTime};
use crate::service::{classify_payload, ServiceClassification};
use crate::CanId;

/// Fully reassembled message handed to the diagnostic layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedMessage {
    pub sender: CanId,
    pub payload: Bytes,
    pub completed_at: Instant,
}

impl CompletedMessage {
    pub fn service(&self) -> Option<ServiceClassification> {
        classify_payload(&self.payload)
    }
}

/// A reception session that ended without producing a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAbort {
    pub sender: CanId,
    pub reason: TpError,
    /// Bytes accumulated before the abort (already released)
    pub received: usize,
}

/// Outcome of feeding one PDU to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// A message is complete
    Completed {
        message: CompletedMessage,
        superseded: Option<SessionAbort>,
    },
    /// A First Frame opened a session; send `flow_control` to the peer
    Started {
        flow_control: FlowControl,
        superseded: Option<SessionAbort>,
    },
    /// The current block is exhausted; send `flow_control` to release the next one
    BlockComplete { flow_control: FlowControl },
    /// The First Frame announced more than we accept; reply with `flow_control`
    Refused {
        flow_control: FlowControl,
        superseded: Option<SessionAbort>,
    },
    /// Consecutive Frame accepted, more to come
    InProgress,
}

#[derive(Debug)]
struct ReassemblySession {
    expected_len: usize,
    buffer: BytesMut,
    next_sequence: u8,
    /// Frames left in the current block; unused when the block size is 0
    block_remaining: u8,
    deadline: Instant,
}

/// Per-sender reassembly state machines
#[derive(Debug)]
pub struct ReassemblyEngine {
    sessions: HashMap<CanId, ReassemblySession>,
    block_size: u8,
    st_min: SeparationTime,
    n_cr: Duration,
    max_message_len: u32,
}

impl ReassemblyEngine {
    pub fn new(config: &ReceiverConfig) -> TpResult<Self> {
        Ok(Self {
            sessions: HashMap::new(),
            block_size: config.block_size,
            st_min: config.separation_time()?,
            n_cr: config.n_cr(),
            max_message_len: config.max_message_len,
        })
    }

    /// Feed a classified frame received from `sender`
    ///
    /// Errors are session-level: `UnexpectedFrame` leaves state untouched,
    /// `SequenceMismatch` and `ReassemblyTimeout` destroy the session.
    pub fn on_pdu(&mut self, sender: CanId, pdu: Pdu, now: Instant) -> TpResult<Reassembly> {
        match pdu {
            Pdu::Single { data } => {
                let superseded = self.supersede(sender);
                debug!(
                    sender = format!("0x{:03X}", sender),
                    len = data.len(),
                    "Single frame message"
                );
                Ok(Reassembly::Completed {
                    message: CompletedMessage {
                        sender,
                        payload: Bytes::from(data),
                        completed_at: now,
                    },
                    superseded,
                })
            }
            Pdu::First { total_len, data } => Ok(self.start(sender, total_len, data, now)),
            Pdu::Consecutive { sequence, data } => self.append(sender, sequence, &data, now),
            Pdu::FlowControl(_) => Err(TpError::UnexpectedFrame(sender)),
        }
    }

    fn start(&mut self, sender: CanId, total_len: u32, data: Vec<u8>, now: Instant) -> Reassembly {
        let superseded = self.supersede(sender);

        if total_len > self.max_message_len {
            warn!(
                sender = format!("0x{:03X}", sender),
                total_len,
                max = self.max_message_len,
                "First frame exceeds receive buffer, replying overflow"
            );
            return Reassembly::Refused {
                flow_control: FlowControl::overflow(),
                superseded,
            };
        }

        let expected_len = total_len as usize;
        let mut buffer = BytesMut::with_capacity(expected_len);
        buffer.extend_from_slice(&data[..data.len().min(expected_len)]);

        debug!(
            sender = format!("0x{:03X}", sender),
            total_len, "First frame, reassembly started"
        );

        self.sessions.insert(
            sender,
            ReassemblySession {
                expected_len,
                buffer,
                next_sequence: 1,
                block_remaining: self.block_size,
                deadline: now + self.n_cr,
            },
        );

        Reassembly::Started {
            flow_control: self.flow_control(),
            superseded,
        }
    }

    fn append(
        &mut self,
        sender: CanId,
        sequence: u8,
        data: &[u8],
        now: Instant,
    ) -> TpResult<Reassembly> {
        let Some(session) = self.sessions.get_mut(&sender) else {
            debug!(
                sender = format!("0x{:03X}", sender),
                sequence, "Consecutive frame without active session"
            );
            return Err(TpError::UnexpectedFrame(sender));
        };

        if now >= session.deadline {
            self.sessions.remove(&sender);
            return Err(TpError::ReassemblyTimeout);
        }

        if sequence != session.next_sequence {
            let expected = session.next_sequence;
            self.sessions.remove(&sender);
            warn!(
                sender = format!("0x{:03X}", sender),
                expected,
                got = sequence,
                "Sequence mismatch, reassembly aborted"
            );
            return Err(TpError::SequenceMismatch {
                expected,
                got: sequence,
            });
        }

        let remaining = session.expected_len - session.buffer.len();
        // trailing bytes of the last frame are padding
        session
            .buffer
            .extend_from_slice(&data[..data.len().min(remaining)]);
        session.next_sequence = (session.next_sequence + 1) & 0x0F;
        session.deadline = now + self.n_cr;

        if session.buffer.len() >= session.expected_len {
            let session = self.sessions.remove(&sender).ok_or(TpError::UnexpectedFrame(sender))?;
            debug!(
                sender = format!("0x{:03X}", sender),
                len = session.expected_len,
                "Reassembly complete"
            );
            return Ok(Reassembly::Completed {
                message: CompletedMessage {
                    sender,
                    payload: session.buffer.freeze(),
                    completed_at: now,
                },
                superseded: None,
            });
        }

        if self.block_size != 0 {
            session.block_remaining -= 1;
            if session.block_remaining == 0 {
                session.block_remaining = self.block_size;
                return Ok(Reassembly::BlockComplete {
                    flow_control: FlowControl::continue_to_send(self.block_size, self.st_min),
                });
            }
        }

        Ok(Reassembly::InProgress)
    }

    /// Abort every session whose N_Cr deadline has passed
    pub fn poll_timeouts(&mut self, now: Instant) -> Vec<SessionAbort> {
        let expired: Vec<CanId> = self
            .sessions
            .iter()
            .filter(|(_, s)| now >= s.deadline)
            .map(|(&sender, _)| sender)
            .collect();

        expired
            .into_iter()
            .filter_map(|sender| self.remove(sender, TpError::ReassemblyTimeout))
            .inspect(|abort| {
                warn!(
                    sender = format!("0x{:03X}", abort.sender),
                    received = abort.received,
                    "Reassembly timed out"
                );
            })
            .collect()
    }

    /// Earliest N_Cr deadline across active sessions
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sessions.values().map(|s| s.deadline).min()
    }

    /// Cancel the session of `sender`, releasing its buffer
    pub fn abort(&mut self, sender: CanId) -> Option<SessionAbort> {
        self.remove(sender, TpError::Cancelled)
    }

    pub fn is_active(&self, sender: CanId) -> bool {
        self.sessions.contains_key(&sender)
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Flow control advertised after a First Frame
    pub fn flow_control(&self) -> FlowControl {
        FlowControl::continue_to_send(self.block_size, self.st_min)
    }

    fn supersede(&mut self, sender: CanId) -> Option<SessionAbort> {
        let abort = self.remove(sender, TpError::Superseded)?;
        warn!(
            sender = format!("0x{:03X}", sender),
            received = abort.received,
            "In-flight message superseded"
        );
        Some(abort)
    }

    fn remove(&mut self, sender: CanId, reason: TpError) -> Option<SessionAbort> {
        self.sessions.remove(&sender).map(|session| SessionAbort {
            sender,
            reason,
            received: session.buffer.len(),
        })
    }
}
