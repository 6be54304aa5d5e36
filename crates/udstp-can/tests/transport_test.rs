//! Transport node tests over the virtual bus
//!
//! Timers run on tokio's paused clock, so N_Bs/N_Cr expiries and STmin
//! pacing are exercised without real waiting. Scripted peers talk to a
//! node through a raw bus endpoint.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use udstp_can::{
    BusIo, DiagnosticMessage, NodeRole, TpEvent, TransportHandle, TransportNode, VirtualBus,
    VirtualBusEndpoint,
};
use udstp_core::config::{AddressingConfig, EcuAddressConfig};
use udstp_core::{
    AddressTable, RawFrame, ReceiverConfig, SenderConfig, ServiceCategory, ServiceId, TpError,
    TransportConfig,
};

const REQUEST_ID: u32 = 0x7E0;
const RESPONSE_ID: u32 = 0x7E8;
const FUNCTIONAL_ID: u32 = 0x7DF;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn address_table() -> Arc<AddressTable> {
    let config = AddressingConfig {
        ecus: vec![EcuAddressConfig {
            name: "ECU_A".to_string(),
            request_id: REQUEST_ID,
            response_id: RESPONSE_ID,
        }],
        functional: vec![FUNCTIONAL_ID],
    };
    Arc::new(AddressTable::from_config(&config).unwrap())
}

fn config_with(receiver: ReceiverConfig, sender: SenderConfig) -> TransportConfig {
    TransportConfig {
        receiver,
        sender,
        ..TransportConfig::default()
    }
}

struct Node {
    handle: TransportHandle,
    events: mpsc::Receiver<TpEvent>,
    _task: JoinHandle<()>,
}

impl Node {
    fn spawn(bus: &VirtualBus, role: NodeRole, config: &TransportConfig) -> Self {
        let (handle, events, task) =
            TransportNode::spawn(Arc::new(bus.endpoint()), address_table(), role, config).unwrap();
        Self {
            handle,
            events,
            _task: task,
        }
    }

    fn tester(bus: &VirtualBus) -> Self {
        Self::spawn(bus, NodeRole::Tester, &TransportConfig::default())
    }

    fn ecu(bus: &VirtualBus) -> Self {
        Self::spawn(
            bus,
            NodeRole::Ecu("ECU_A".to_string()),
            &TransportConfig::default(),
        )
    }

    async fn next_event(&mut self) -> TpEvent {
        tokio::time::timeout(Duration::from_secs(30), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn next_message(&mut self) -> DiagnosticMessage {
        match self.next_event().await {
            TpEvent::Message(message) => message,
            other => panic!("Expected message, got {:?}", other),
        }
    }
}

async fn next_frame(peer: &VirtualBusEndpoint) -> RawFrame {
    tokio::time::timeout(Duration::from_secs(30), peer.receive())
        .await
        .expect("timed out waiting for frame")
        .unwrap()
}

fn payload(len: usize, sid: u8) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| i as u8).collect();
    data[0] = sid;
    data
}

#[tokio::test(start_paused = true)]
async fn test_single_frame_request_response() {
    init_tracing();
    let bus = VirtualBus::new();
    let mut tester = Node::tester(&bus);
    let mut ecu = Node::ecu(&bus);

    tester
        .handle
        .transmit(REQUEST_ID, vec![0x22, 0xF1, 0x90])
        .await
        .unwrap();

    let request = ecu.next_message().await;
    assert_eq!(request.sender, REQUEST_ID);
    assert_eq!(request.payload.as_ref(), &[0x22, 0xF1, 0x90]);
    let service = request.service.unwrap();
    assert_eq!(service.service, ServiceId::ReadDataByIdentifier);
    assert_eq!(service.category, ServiceCategory::Request);

    ecu.handle
        .transmit(RESPONSE_ID, vec![0x7F, 0x22, 0x31])
        .await
        .unwrap();

    let response = tester.next_message().await;
    assert_eq!(response.sender, RESPONSE_ID);
    assert_eq!(
        response.service.unwrap().category,
        ServiceCategory::NegativeResponse
    );
}

#[tokio::test(start_paused = true)]
async fn test_segmented_round_trip() {
    init_tracing();
    let bus = VirtualBus::new();
    let mut tester = Node::tester(&bus);
    let mut ecu = Node::ecu(&bus);

    let request = payload(200, 0x2E);
    tester
        .handle
        .transmit(REQUEST_ID, request.clone())
        .await
        .unwrap();

    let received = ecu.next_message().await;
    assert_eq!(received.payload.to_vec(), request);
    assert_eq!(
        received.service.unwrap().service,
        ServiceId::WriteDataByIdentifier
    );

    // 6 bytes in the first frame, 194 in 28 consecutive frames
    assert_eq!(bus.frames_on(REQUEST_ID).len(), 29);
    assert_eq!(
        bus.frames_on(RESPONSE_ID),
        vec![RawFrame::new(RESPONSE_ID, vec![0x30, 0x00, 0x00])]
    );

    let response = payload(100, 0x6E);
    ecu.handle
        .transmit(RESPONSE_ID, response.clone())
        .await
        .unwrap();
    assert_eq!(tester.next_message().await.payload.to_vec(), response);
}

#[tokio::test(start_paused = true)]
async fn test_block_size_and_separation_time() {
    init_tracing();
    let bus = VirtualBus::new();
    let mut tester = Node::tester(&bus);
    let receiver = ReceiverConfig {
        block_size: 4,
        st_min: 0x0A,
        ..ReceiverConfig::default()
    };
    let mut ecu = Node::spawn(
        &bus,
        NodeRole::Ecu("ECU_A".to_string()),
        &config_with(receiver, SenderConfig::default()),
    );

    // 6 + 10 * 7 = 76 bytes -> 10 consecutive frames in blocks of 4, 4, 2
    let request = payload(76, 0x36);
    let start = tokio::time::Instant::now();
    tester
        .handle
        .transmit(REQUEST_ID, request.clone())
        .await
        .unwrap();

    assert_eq!(ecu.next_message().await.payload.to_vec(), request);

    let flow_controls = bus.frames_on(RESPONSE_ID);
    assert_eq!(flow_controls.len(), 3);
    assert!(flow_controls
        .iter()
        .all(|fc| fc.data == vec![0x30, 0x04, 0x0A]));

    // 3 + 3 + 1 STmin gaps; a block's first frame follows its flow control at once
    assert!(start.elapsed() >= Duration::from_millis(70));
}

#[tokio::test(start_paused = true)]
async fn test_padding_applied_to_all_frames() {
    let bus = VirtualBus::new();
    let padded = config_with(
        ReceiverConfig {
            padding: Some(0xAA),
            ..ReceiverConfig::default()
        },
        SenderConfig {
            padding: Some(0xCC),
            ..SenderConfig::default()
        },
    );
    let tester = Node::spawn(&bus, NodeRole::Tester, &padded);
    let mut ecu = Node::spawn(&bus, NodeRole::Ecu("ECU_A".to_string()), &padded);

    tester
        .handle
        .transmit(REQUEST_ID, payload(10, 0x31))
        .await
        .unwrap();
    assert_eq!(ecu.next_message().await.payload.len(), 10);

    assert!(bus.sent_frames().iter().all(|frame| frame.data.len() == 8));
    assert_eq!(
        bus.frames_on(RESPONSE_ID)[0].data,
        vec![0x30, 0x00, 0x00, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA]
    );
}

#[tokio::test(start_paused = true)]
async fn test_functional_single_frame() {
    let bus = VirtualBus::new();
    let tester = Node::tester(&bus);
    let mut ecu = Node::ecu(&bus);

    tester
        .handle
        .transmit(FUNCTIONAL_ID, vec![0x3E, 0x00])
        .await
        .unwrap();

    let message = ecu.next_message().await;
    assert_eq!(message.sender, FUNCTIONAL_ID);
    assert_eq!(message.service.unwrap().service, ServiceId::TesterPresent);
}

#[tokio::test(start_paused = true)]
async fn test_functional_segmentation_rejected() {
    let bus = VirtualBus::new();
    let tester = Node::tester(&bus);

    let result = tester.handle.transmit(FUNCTIONAL_ID, payload(8, 0x22)).await;
    assert!(matches!(result, Err(TpError::InvalidLength(_))));
    assert!(bus.sent_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_target_rejected() {
    let bus = VirtualBus::new();
    let tester = Node::tester(&bus);

    assert_eq!(
        tester.handle.transmit(0x123, vec![0x10, 0x01]).await,
        Err(TpError::UnknownAddress(0x123))
    );
}

#[rstest]
#[case::wait_limit(vec![0x31, 0x00, 0x00], 3, TpError::PeerNotReady(3))]
#[case::overflow(vec![0x32, 0x00, 0x00], 1, TpError::PeerOverflow)]
#[tokio::test(start_paused = true)]
async fn test_peer_flow_control_aborts(
    #[case] flow_control: Vec<u8>,
    #[case] repeats: usize,
    #[case] expected: TpError,
) {
    init_tracing();
    let bus = VirtualBus::new();
    let tester = Node::tester(&bus);
    let peer = bus.endpoint();

    let handle = tester.handle.clone();
    let transmit = tokio::spawn(async move { handle.transmit(REQUEST_ID, payload(30, 0x2E)).await });

    let first = next_frame(&peer).await;
    assert_eq!(first.id, REQUEST_ID);
    assert_eq!(first.data[..2], [0x10, 30]);

    for _ in 0..repeats {
        peer.send(RESPONSE_ID, &flow_control).await.unwrap();
    }

    assert_eq!(transmit.await.unwrap(), Err(expected));
    assert_eq!(bus.frames_on(REQUEST_ID).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_then_continue() {
    let bus = VirtualBus::new();
    let tester = Node::tester(&bus);
    let peer = bus.endpoint();

    let handle = tester.handle.clone();
    let transmit = tokio::spawn(async move { handle.transmit(REQUEST_ID, payload(20, 0x2E)).await });

    next_frame(&peer).await;
    peer.send(RESPONSE_ID, &[0x31, 0x00, 0x00]).await.unwrap();
    peer.send(RESPONSE_ID, &[0x31, 0x00, 0x00]).await.unwrap();
    peer.send(RESPONSE_ID, &[0x30, 0x00, 0x00]).await.unwrap();

    assert_eq!(next_frame(&peer).await.data[0], 0x21);
    assert_eq!(next_frame(&peer).await.data[0], 0x22);
    assert_eq!(transmit.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn test_flow_control_timeout() {
    let bus = VirtualBus::new();
    let tester = Node::tester(&bus);
    let _silent_peer = bus.endpoint();

    let start = tokio::time::Instant::now();
    let result = tester.handle.transmit(REQUEST_ID, payload(20, 0x2E)).await;

    assert_eq!(result, Err(TpError::FlowControlTimeout));
    assert!(start.elapsed() >= Duration::from_millis(1000));
}

#[tokio::test(start_paused = true)]
async fn test_abort_transmission() {
    let bus = VirtualBus::new();
    let tester = Node::tester(&bus);
    let peer = bus.endpoint();

    let handle = tester.handle.clone();
    let transmit = tokio::spawn(async move { handle.transmit(REQUEST_ID, payload(20, 0x2E)).await });

    next_frame(&peer).await;
    tester.handle.abort_transmission(REQUEST_ID).await.unwrap();
    assert_eq!(transmit.await.unwrap(), Err(TpError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_transmissions_to_one_target_are_queued() {
    let bus = VirtualBus::new();
    let tester = Node::tester(&bus);
    let mut ecu = Node::ecu(&bus);

    let first = payload(40, 0x2E);
    let second = payload(15, 0x31);
    let (a, b) = tokio::join!(
        tester.handle.transmit(REQUEST_ID, first.clone()),
        tester.handle.transmit(REQUEST_ID, second.clone()),
    );
    a.unwrap();
    b.unwrap();

    assert_eq!(ecu.next_message().await.payload.to_vec(), first);
    assert_eq!(ecu.next_message().await.payload.to_vec(), second);
}

#[tokio::test(start_paused = true)]
async fn test_reassembly_timeout_reported() {
    let bus = VirtualBus::new();
    let mut ecu = Node::ecu(&bus);
    let peer = bus.endpoint();

    peer.send(REQUEST_ID, &[0x10, 0x14, 0x2E, 1, 2, 3, 4, 5])
        .await
        .unwrap();
    assert_eq!(
        next_frame(&peer).await,
        RawFrame::new(RESPONSE_ID, vec![0x30, 0x00, 0x00])
    );

    assert_eq!(
        ecu.next_event().await,
        TpEvent::ReceptionFailed {
            sender: REQUEST_ID,
            error: TpError::ReassemblyTimeout,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_sequence_mismatch_reported() {
    let bus = VirtualBus::new();
    let mut ecu = Node::ecu(&bus);
    let peer = bus.endpoint();

    peer.send(REQUEST_ID, &[0x10, 0x14, 0x2E, 1, 2, 3, 4, 5])
        .await
        .unwrap();
    next_frame(&peer).await;
    peer.send(REQUEST_ID, &[0x22, 6, 7, 8, 9, 10, 11, 12])
        .await
        .unwrap();

    assert_eq!(
        ecu.next_event().await,
        TpEvent::ReceptionFailed {
            sender: REQUEST_ID,
            error: TpError::SequenceMismatch {
                expected: 1,
                got: 2
            },
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_new_first_frame_supersedes_reception() {
    let bus = VirtualBus::new();
    let mut ecu = Node::ecu(&bus);
    let peer = bus.endpoint();

    peer.send(REQUEST_ID, &[0x10, 0x14, 0x2E, 1, 2, 3, 4, 5])
        .await
        .unwrap();
    next_frame(&peer).await;
    peer.send(REQUEST_ID, &[0x02, 0x10, 0x03]).await.unwrap();

    assert_eq!(
        ecu.next_event().await,
        TpEvent::ReceptionFailed {
            sender: REQUEST_ID,
            error: TpError::Superseded,
        }
    );
    assert_eq!(ecu.next_message().await.payload.as_ref(), &[0x10, 0x03]);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_message_refused() {
    let bus = VirtualBus::new();
    let receiver = ReceiverConfig {
        max_message_len: 100,
        ..ReceiverConfig::default()
    };
    let mut ecu = Node::spawn(
        &bus,
        NodeRole::Ecu("ECU_A".to_string()),
        &config_with(receiver, SenderConfig::default()),
    );
    let peer = bus.endpoint();

    peer.send(REQUEST_ID, &[0x10, 0xC8, 0x36, 1, 2, 3, 4, 5])
        .await
        .unwrap();
    assert_eq!(
        next_frame(&peer).await,
        RawFrame::new(RESPONSE_ID, vec![0x32, 0x00, 0x00])
    );
    assert!(matches!(
        ecu.next_event().await,
        TpEvent::ReceptionFailed {
            sender: REQUEST_ID,
            error: TpError::InvalidLength(_),
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_abort_reception() {
    let bus = VirtualBus::new();
    let mut ecu = Node::ecu(&bus);
    let peer = bus.endpoint();

    peer.send(REQUEST_ID, &[0x10, 0x14, 0x2E, 1, 2, 3, 4, 5])
        .await
        .unwrap();
    next_frame(&peer).await;
    ecu.handle.abort_reception(REQUEST_ID).await.unwrap();

    assert_eq!(
        ecu.next_event().await,
        TpEvent::ReceptionFailed {
            sender: REQUEST_ID,
            error: TpError::Cancelled,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_foreign_frames_ignored() {
    let bus = VirtualBus::new();
    let mut ecu = Node::ecu(&bus);
    let peer = bus.endpoint();

    // unknown PCI type, empty frame, stray consecutive frame, other id
    peer.send(REQUEST_ID, &[0x40, 0x01]).await.unwrap();
    peer.send(REQUEST_ID, &[]).await.unwrap();
    peer.send(REQUEST_ID, &[0x21, 1, 2, 3]).await.unwrap();
    peer.send(0x7E1, &[0x02, 0x10, 0x01]).await.unwrap();
    peer.send(REQUEST_ID, &[0x02, 0x11, 0x01]).await.unwrap();

    let message = ecu.next_message().await;
    assert_eq!(message.payload.as_ref(), &[0x11, 0x01]);
    assert_eq!(message.service.unwrap().service, ServiceId::EcuReset);
}

#[tokio::test(start_paused = true)]
async fn test_undrained_events_do_not_stall_node() {
    init_tracing();
    let bus = VirtualBus::new();
    let mut tester = Node::tester(&bus);
    let peer = bus.endpoint();

    // more responses than the event queue holds, none of them consumed
    for i in 0..100u8 {
        peer.send(RESPONSE_ID, &[0x02, 0x62, i]).await.unwrap();
    }

    tokio::time::timeout(
        Duration::from_secs(10),
        tester.handle.transmit(REQUEST_ID, vec![0x3E, 0x00]),
    )
    .await
    .expect("transmit stalled behind a full event queue")
    .unwrap();

    let request = next_frame(&peer).await;
    assert_eq!(request.id, REQUEST_ID);
    assert_eq!(request.data, vec![0x02, 0x3E, 0x00]);

    let first = tester.next_message().await;
    assert_eq!(first.payload.as_ref(), &[0x62, 0x00]);
}
