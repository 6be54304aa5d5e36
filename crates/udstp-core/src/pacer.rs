//! Segmented transmission paced by peer flow control
//!
//! `TransmitSession` is a sans-I/O state machine: the caller feeds it Flow
//! Control frames and polls it with the current time; it answers with the
//! next frame to put on the bus or the instant to wake up again.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::SenderConfig;
use crate::error::{TpError, TpResult};
use crate::frame::{
    encode_consecutive, encode_first, encode_single, first_frame_capacity, FlowControl,
    FlowStatus, RawFrame, SeparationTime, CONSECUTIVE_FRAME_CAPACITY, SINGLE_FRAME_CAPACITY,
};
use crate::CanId;

/// Start of an outbound message
#[derive(Debug)]
pub enum Transmission {
    /// Message fits one frame; nothing to pace
    Single(RawFrame),
    /// First Frame to send now plus the session that paces the rest
    Segmented {
        session: TransmitSession,
        first_frame: RawFrame,
    },
}

impl Transmission {
    pub fn begin(
        target: CanId,
        payload: Bytes,
        config: &SenderConfig,
        now: Instant,
    ) -> TpResult<Self> {
        if payload.is_empty() {
            return Err(TpError::InvalidLength("empty payload".to_string()));
        }

        if payload.len() <= SINGLE_FRAME_CAPACITY {
            let data = encode_single(&payload, config.padding)?;
            return Ok(Transmission::Single(RawFrame::new(target, data)));
        }

        let chunk = first_frame_capacity(payload.len());
        let first_frame = RawFrame::new(
            target,
            encode_first(payload.len(), &payload[..chunk], config.padding)?,
        );

        debug!(
            target_id = format!("0x{:03X}", target),
            len = payload.len(),
            "Segmented transmission started"
        );

        let session = TransmitSession {
            target,
            payload,
            offset: chunk,
            next_sequence: 1,
            state: TxState::AwaitingFlowControl,
            block_size: 0,
            block_remaining: 0,
            st_min: SeparationTime::ZERO,
            wait_count: 0,
            max_wait_frames: config.max_wait_frames,
            n_bs: config.n_bs(),
            padding: config.padding,
            deadline: now + config.n_bs(),
            next_send_at: now,
        };

        Ok(Transmission::Segmented {
            session,
            first_frame,
        })
    }
}

/// Transmission session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxState {
    /// Suspended until the peer sends Flow Control
    AwaitingFlowControl,
    /// Sending Consecutive Frames within a block
    Sending,
    Complete,
    Failed(TpError),
}

/// Batching plan armed by a ContinueToSend flow control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    /// Consecutive Frames to send before the next Flow Control is needed
    pub frames: usize,
    /// Minimum gap between those frames
    pub separation: Duration,
}

/// Reaction to an incoming Flow Control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerAction {
    Resume(BlockPlan),
    /// Peer asked to wait; the N_Bs timer was restarted
    Wait,
    /// Flow Control arrived while none was expected
    Ignored,
}

/// What the session wants next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPoll {
    Send(RawFrame),
    /// Separation time not yet elapsed
    SleepUntil(Instant),
    /// Waiting for Flow Control until the given N_Bs deadline
    AwaitFlowControl(Instant),
    Complete,
}

/// Pacing state for one outbound segmented message
#[derive(Debug)]
pub struct TransmitSession {
    target: CanId,
    payload: Bytes,
    offset: usize,
    next_sequence: u8,
    state: TxState,
    block_size: u8,
    block_remaining: u8,
    st_min: SeparationTime,
    wait_count: u8,
    max_wait_frames: u8,
    n_bs: Duration,
    padding: Option<u8>,
    deadline: Instant,
    next_send_at: Instant,
}

impl TransmitSession {
    pub fn on_flow_control(&mut self, fc: &FlowControl, now: Instant) -> TpResult<PacerAction> {
        if self.state != TxState::AwaitingFlowControl {
            debug!(
                target_id = format!("0x{:03X}", self.target),
                state = ?self.state,
                "Ignoring unexpected flow control"
            );
            return Ok(PacerAction::Ignored);
        }

        match fc.status {
            FlowStatus::ContinueToSend => {
                self.wait_count = 0;
                self.block_size = fc.block_size;
                self.block_remaining = fc.block_size;
                self.st_min = fc.st_min;
                self.state = TxState::Sending;
                self.next_send_at = now;

                let plan = BlockPlan {
                    frames: self.block_frames(),
                    separation: fc.st_min.as_duration(),
                };
                debug!(
                    target_id = format!("0x{:03X}", self.target),
                    frames = plan.frames,
                    separation_us = plan.separation.as_micros() as u64,
                    "Flow control: continue to send"
                );
                Ok(PacerAction::Resume(plan))
            }
            FlowStatus::Wait => {
                self.wait_count = self.wait_count.saturating_add(1);
                if self.wait_count > self.max_wait_frames {
                    warn!(
                        target_id = format!("0x{:03X}", self.target),
                        waits = self.wait_count,
                        "Peer exceeded wait frame limit"
                    );
                    return Err(self.fail(TpError::PeerNotReady(self.wait_count)));
                }
                self.deadline = now + self.n_bs;
                debug!(
                    target_id = format!("0x{:03X}", self.target),
                    waits = self.wait_count,
                    "Flow control: wait"
                );
                Ok(PacerAction::Wait)
            }
            FlowStatus::Overflow => {
                warn!(
                    target_id = format!("0x{:03X}", self.target),
                    "Peer reported overflow"
                );
                Err(self.fail(TpError::PeerOverflow))
            }
        }
    }

    /// Advance the session at time `now`
    pub fn poll(&mut self, now: Instant) -> TpResult<TxPoll> {
        match &self.state {
            TxState::Complete => Ok(TxPoll::Complete),
            TxState::Failed(reason) => Err(reason.clone()),
            TxState::AwaitingFlowControl => {
                if now >= self.deadline {
                    warn!(
                        target_id = format!("0x{:03X}", self.target),
                        sent = self.offset,
                        "Timed out waiting for flow control"
                    );
                    return Err(self.fail(TpError::FlowControlTimeout));
                }
                Ok(TxPoll::AwaitFlowControl(self.deadline))
            }
            TxState::Sending => {
                if now < self.next_send_at {
                    return Ok(TxPoll::SleepUntil(self.next_send_at));
                }
                match self.next_consecutive(now) {
                    Ok(frame) => Ok(TxPoll::Send(frame)),
                    Err(e) => Err(self.fail(e)),
                }
            }
        }
    }

    fn next_consecutive(&mut self, now: Instant) -> TpResult<RawFrame> {
        let end = (self.offset + CONSECUTIVE_FRAME_CAPACITY).min(self.payload.len());
        let data = encode_consecutive(
            self.next_sequence,
            &self.payload[self.offset..end],
            self.padding,
        )?;
        self.offset = end;
        self.next_sequence = (self.next_sequence + 1) & 0x0F;

        if self.offset >= self.payload.len() {
            debug!(
                target_id = format!("0x{:03X}", self.target),
                len = self.payload.len(),
                "Transmission complete"
            );
            self.state = TxState::Complete;
        } else {
            self.next_send_at = now + self.st_min.as_duration();
            if self.block_size != 0 {
                self.block_remaining -= 1;
                if self.block_remaining == 0 {
                    self.state = TxState::AwaitingFlowControl;
                    self.deadline = now + self.n_bs;
                }
            }
        }

        Ok(RawFrame::new(self.target, data))
    }

    /// Cancel the session; returns false if it had already finished
    pub fn abort(&mut self) -> bool {
        if self.is_finished() {
            return false;
        }
        self.fail(TpError::Cancelled);
        true
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, TxState::Complete | TxState::Failed(_))
    }

    /// Instant at which `poll` has something new to say
    pub fn next_wakeup(&self) -> Option<Instant> {
        match self.state {
            TxState::AwaitingFlowControl => Some(self.deadline),
            TxState::Sending => Some(self.next_send_at),
            TxState::Complete | TxState::Failed(_) => None,
        }
    }

    pub fn state(&self) -> &TxState {
        &self.state
    }

    pub fn target(&self) -> CanId {
        self.target
    }

    /// Payload bytes already handed out in frames
    pub fn sent_len(&self) -> usize {
        self.offset
    }

    fn remaining_frames(&self) -> usize {
        (self.payload.len() - self.offset).div_ceil(CONSECUTIVE_FRAME_CAPACITY)
    }

    fn block_frames(&self) -> usize {
        let remaining = self.remaining_frames();
        if self.block_size == 0 {
            remaining
        } else {
            remaining.min(usize::from(self.block_size))
        }
    }

    fn fail(&mut self, reason: TpError) -> TpError {
        self.state = TxState::Failed(reason.clone());
        reason
    }
}
