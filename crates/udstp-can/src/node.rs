//! Transport node: one task per bus participant
//!
//! The node owns the reassembly engine and every transmit session of its
//! participant. Frames, commands from [`TransportHandle`]s and timer
//! expiries are all handled by the single task running
//! [`TransportNode::run`], so session state is never shared.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use udstp_core::frame::{classify, encode_flow_control, FlowControl, SINGLE_FRAME_CAPACITY};
use udstp_core::{
    AddressRole, AddressTable, CanId, Pdu, RawFrame, Reassembly, ReassemblyEngine, Resolution,
    SenderConfig, ServiceClassification, SessionAbort, TpError, TpResult, TransportConfig,
    Transmission, TransmitSession, TxPoll,
};

use crate::bus::BusIo;

const COMMAND_CHANNEL_CAPACITY: usize = 32;
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Which side of the physical pairs a node plays
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRole {
    /// Listens on every physical response id
    Tester,
    /// Listens on the named ECU's request id and on the functional group
    Ecu(String),
}

/// Message delivered to the diagnostic-session layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticMessage {
    pub sender: CanId,
    pub payload: Bytes,
    pub completed_at: Instant,
    /// `None` only for an empty payload
    pub service: Option<ServiceClassification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpEvent {
    Message(DiagnosticMessage),
    /// A reception from `sender` was dropped
    ReceptionFailed { sender: CanId, error: TpError },
}

#[derive(Debug)]
enum Command {
    Transmit {
        target: CanId,
        payload: Bytes,
        reply: oneshot::Sender<TpResult<()>>,
    },
    AbortReception {
        sender: CanId,
    },
    AbortTransmission {
        target: CanId,
    },
}

/// Cloneable handle to a running [`TransportNode`]
///
/// The node stops once every handle has been dropped.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::Sender<Command>,
}

impl TransportHandle {
    /// Send `payload` to `target`
    ///
    /// Resolves once the last frame is on the bus or the transmission
    /// failed. Transmissions to the same target are queued.
    pub async fn transmit(&self, target: CanId, payload: impl Into<Bytes>) -> TpResult<()> {
        let (reply, response) = oneshot::channel();
        self.submit(Command::Transmit {
            target,
            payload: payload.into(),
            reply,
        })
        .await?;
        response.await.map_err(|_| node_stopped())?
    }

    /// Drop the message currently being received from `sender`
    pub async fn abort_reception(&self, sender: CanId) -> TpResult<()> {
        self.submit(Command::AbortReception { sender }).await
    }

    /// Cancel the active transmission to `target`; queued ones still run
    pub async fn abort_transmission(&self, target: CanId) -> TpResult<()> {
        self.submit(Command::AbortTransmission { target }).await
    }

    async fn submit(&self, command: Command) -> TpResult<()> {
        self.commands.send(command).await.map_err(|_| node_stopped())
    }
}

fn node_stopped() -> TpError {
    TpError::Bus("transport node stopped".to_string())
}

struct PendingTransmit {
    payload: Bytes,
    reply: oneshot::Sender<TpResult<()>>,
}

struct ActiveTransmit {
    session: TransmitSession,
    reply: oneshot::Sender<TpResult<()>>,
}

/// Event loop binding the core state machines to a bus
pub struct TransportNode {
    bus: Arc<dyn BusIo>,
    table: Arc<AddressTable>,
    role: NodeRole,
    sender_config: SenderConfig,
    fc_padding: Option<u8>,
    engine: ReassemblyEngine,
    active: HashMap<CanId, ActiveTransmit>,
    queued: HashMap<CanId, VecDeque<PendingTransmit>>,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<TpEvent>,
}

impl TransportNode {
    /// Build a node plus the handle that drives it and its event stream
    pub fn new(
        bus: Arc<dyn BusIo>,
        table: Arc<AddressTable>,
        role: NodeRole,
        config: &TransportConfig,
    ) -> TpResult<(Self, TransportHandle, mpsc::Receiver<TpEvent>)> {
        config.validate()?;
        if let NodeRole::Ecu(name) = &role {
            if table.physical(name).is_none() {
                return Err(TpError::Config(format!("ECU '{}' is not in the address table", name)));
            }
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let node = Self {
            bus,
            table,
            role,
            sender_config: config.sender.clone(),
            fc_padding: config.receiver.padding,
            engine: ReassemblyEngine::new(&config.receiver)?,
            active: HashMap::new(),
            queued: HashMap::new(),
            commands: command_rx,
            events: event_tx,
        };

        Ok((node, TransportHandle { commands: command_tx }, event_rx))
    }

    /// Build a node and run it on a new tokio task
    pub fn spawn(
        bus: Arc<dyn BusIo>,
        table: Arc<AddressTable>,
        role: NodeRole,
        config: &TransportConfig,
    ) -> TpResult<(TransportHandle, mpsc::Receiver<TpEvent>, JoinHandle<()>)> {
        let (node, handle, events) = Self::new(bus, table, role, config)?;
        let task = tokio::spawn(node.run());
        Ok((handle, events, task))
    }

    pub async fn run(mut self) {
        info!(role = ?self.role, "Transport node started");
        let bus = Arc::clone(&self.bus);

        loop {
            let deadline = self.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                received = bus.receive() => match received {
                    Ok(frame) => self.on_frame(frame).await,
                    Err(e) => {
                        error!(error = %e, "Bus receive failed, stopping transport node");
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        debug!("All transport handles dropped");
                        break;
                    }
                },
                _ = timer => {}
            }

            let now = now();
            for abort in self.engine.poll_timeouts(now) {
                self.report_abort(abort);
            }
            self.pump(now).await;
        }

        self.shutdown();
        info!(role = ?self.role, "Transport node stopped");
    }

    fn listens_on(&self, id: CanId) -> bool {
        match (&self.role, self.table.resolve(id)) {
            (
                NodeRole::Tester,
                Resolution::Physical {
                    role: AddressRole::Response,
                    ..
                },
            ) => true,
            (
                NodeRole::Ecu(name),
                Resolution::Physical {
                    ecu_name,
                    role: AddressRole::Request,
                },
            ) => ecu_name == name,
            (NodeRole::Ecu(_), Resolution::Functional) => true,
            _ => false,
        }
    }

    async fn on_frame(&mut self, frame: RawFrame) {
        if !self.listens_on(frame.id) {
            return;
        }

        let pdu = match classify(&frame.data) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!(%frame, error = %e, "Dropping malformed frame");
                return;
            }
        };

        let now = now();
        match pdu {
            Pdu::FlowControl(fc) => self.on_flow_control(frame.id, &fc, now).await,
            Pdu::Single { .. } => self.on_data(frame.id, pdu, now).await,
            Pdu::First { .. } | Pdu::Consecutive { .. } => {
                if matches!(self.table.resolve(frame.id), Resolution::Functional) {
                    warn!(
                        id = format!("0x{:03X}", frame.id),
                        kind = pdu.kind(),
                        "Dropping segmented frame on functional address"
                    );
                    return;
                }
                self.on_data(frame.id, pdu, now).await;
            }
        }
    }

    async fn on_data(&mut self, sender: CanId, pdu: Pdu, now: Instant) {
        match self.engine.on_pdu(sender, pdu, now) {
            Ok(Reassembly::Completed {
                message,
                superseded,
            }) => {
                if let Some(abort) = superseded {
                    self.report_abort(abort);
                }
                let service = message.service();
                info!(
                    sender = format!("0x{:03X}", sender),
                    len = message.payload.len(),
                    service = ?service.map(|s| s.service),
                    "Message received"
                );
                self.emit(TpEvent::Message(DiagnosticMessage {
                    sender: message.sender,
                    payload: message.payload,
                    completed_at: message.completed_at,
                    service,
                }));
            }
            Ok(Reassembly::Started {
                flow_control,
                superseded,
            }) => {
                if let Some(abort) = superseded {
                    self.report_abort(abort);
                }
                self.send_flow_control(sender, &flow_control).await;
            }
            Ok(Reassembly::BlockComplete { flow_control }) => {
                self.send_flow_control(sender, &flow_control).await;
            }
            Ok(Reassembly::Refused {
                flow_control,
                superseded,
            }) => {
                if let Some(abort) = superseded {
                    self.report_abort(abort);
                }
                self.send_flow_control(sender, &flow_control).await;
                self.emit(TpEvent::ReceptionFailed {
                    sender,
                    error: TpError::InvalidLength(
                        "first frame exceeds the receive limit".to_string(),
                    ),
                });
            }
            Ok(Reassembly::InProgress) => {}
            Err(TpError::UnexpectedFrame(_)) => {
                debug!(
                    sender = format!("0x{:03X}", sender),
                    "Ignoring frame outside a reception"
                );
            }
            Err(e) => {
                self.emit(TpEvent::ReceptionFailed { sender, error: e });
            }
        }
    }

    async fn on_flow_control(&mut self, id: CanId, fc: &FlowControl, now: Instant) {
        let Some(target) = self.table.counterpart(id) else {
            return;
        };
        let Some(active) = self.active.get_mut(&target) else {
            debug!(
                id = format!("0x{:03X}", id),
                "Flow control without active transmission"
            );
            return;
        };

        if let Err(e) = active.session.on_flow_control(fc, now) {
            self.finish(target, Err(e), now).await;
        }
    }

    async fn on_command(&mut self, command: Command) {
        let now = now();
        match command {
            Command::Transmit {
                target,
                payload,
                reply,
            } => {
                if self.active.contains_key(&target) {
                    debug!(
                        target_id = format!("0x{:03X}", target),
                        "Transmission queued behind active session"
                    );
                    self.queued
                        .entry(target)
                        .or_default()
                        .push_back(PendingTransmit { payload, reply });
                } else {
                    self.start(target, payload, reply, now).await;
                }
            }
            Command::AbortReception { sender } => {
                if let Some(abort) = self.engine.abort(sender) {
                    self.report_abort(abort);
                }
            }
            Command::AbortTransmission { target } => {
                if let Some(active) = self.active.get_mut(&target) {
                    active.session.abort();
                    self.finish(target, Err(TpError::Cancelled), now).await;
                }
            }
        }
    }

    async fn start(
        &mut self,
        target: CanId,
        payload: Bytes,
        reply: oneshot::Sender<TpResult<()>>,
        now: Instant,
    ) {
        match self.table.resolve(target) {
            Resolution::Unknown => {
                let _ = reply.send(Err(TpError::UnknownAddress(target)));
                return;
            }
            Resolution::Functional if payload.len() > SINGLE_FRAME_CAPACITY => {
                let _ = reply.send(Err(TpError::InvalidLength(format!(
                    "{} bytes do not fit a single frame on functional address 0x{:03X}",
                    payload.len(),
                    target
                ))));
                return;
            }
            _ => {}
        }

        let len = payload.len();
        match Transmission::begin(target, payload, &self.sender_config, now) {
            Ok(Transmission::Single(frame)) => {
                let result = self.bus.send(frame.id, &frame.data).await.map_err(TpError::from);
                if result.is_ok() {
                    info!(
                        target_id = format!("0x{:03X}", target),
                        len, "Message sent"
                    );
                }
                let _ = reply.send(result);
            }
            Ok(Transmission::Segmented {
                session,
                first_frame,
            }) => {
                if let Err(e) = self.bus.send(first_frame.id, &first_frame.data).await {
                    let _ = reply.send(Err(e.into()));
                    return;
                }
                self.active.insert(target, ActiveTransmit { session, reply });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Send every frame that is due
    async fn pump(&mut self, now: Instant) {
        let targets: Vec<CanId> = self.active.keys().copied().collect();
        for target in targets {
            self.drive(target, now).await;
        }
    }

    async fn drive(&mut self, target: CanId, now: Instant) {
        loop {
            let Some(active) = self.active.get_mut(&target) else {
                return;
            };
            match active.session.poll(now) {
                Ok(TxPoll::Send(frame)) => {
                    if let Err(e) = self.bus.send(frame.id, &frame.data).await {
                        self.finish(target, Err(e.into()), now).await;
                        return;
                    }
                }
                Ok(TxPoll::Complete) => {
                    self.finish(target, Ok(()), now).await;
                    return;
                }
                Ok(TxPoll::SleepUntil(_)) | Ok(TxPoll::AwaitFlowControl(_)) => return,
                Err(e) => {
                    self.finish(target, Err(e), now).await;
                    return;
                }
            }
        }
    }

    /// Retire the active transmission to `target` and start the next queued one
    async fn finish(&mut self, target: CanId, result: TpResult<()>, now: Instant) {
        if let Some(active) = self.active.remove(&target) {
            match &result {
                Ok(()) => info!(
                    target_id = format!("0x{:03X}", target),
                    len = active.session.sent_len(),
                    "Message sent"
                ),
                Err(e) => warn!(
                    target_id = format!("0x{:03X}", target),
                    sent = active.session.sent_len(),
                    error = %e,
                    "Transmission failed"
                ),
            }
            let _ = active.reply.send(result);
        }

        while !self.active.contains_key(&target) {
            let Some(next) = self.queued.get_mut(&target).and_then(VecDeque::pop_front) else {
                break;
            };
            self.start(target, next.payload, next.reply, now).await;
        }
        if self.queued.get(&target).is_some_and(VecDeque::is_empty) {
            self.queued.remove(&target);
        }
    }

    async fn send_flow_control(&self, sender: CanId, fc: &FlowControl) {
        let Some(id) = self.table.counterpart(sender) else {
            warn!(
                sender = format!("0x{:03X}", sender),
                "No counterpart id for flow control"
            );
            return;
        };
        let data = encode_flow_control(fc, self.fc_padding);
        if let Err(e) = self.bus.send(id, &data).await {
            warn!(id = format!("0x{:03X}", id), error = %e, "Failed to send flow control");
        }
    }

    fn report_abort(&self, abort: SessionAbort) {
        self.emit(TpEvent::ReceptionFailed {
            sender: abort.sender,
            error: abort.reason,
        });
    }

    /// Hand an event to the consumer without ever stalling the loop
    fn emit(&self, event: TpEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "Event queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event receiver dropped");
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.active
            .values()
            .filter_map(|active| active.session.next_wakeup())
            .chain(self.engine.next_deadline())
            .min()
    }

    fn shutdown(&mut self) {
        for (_, active) in self.active.drain() {
            let _ = active.reply.send(Err(TpError::Cancelled));
        }
        for pending in self.queued.drain().flat_map(|(_, queue)| queue) {
            let _ = pending.reply.send(Err(TpError::Cancelled));
        }
    }
}

/// Current time on tokio's clock, so paused-time tests stay deterministic
fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}
