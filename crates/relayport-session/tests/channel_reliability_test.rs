//! Integration tests for channel reliability
//! Loss recovery, in-order delivery and window flow control over in-memory transports

use bytes::{Bytes, BytesMut};
use relayport_proto::{
    parse_document, FrameCodec, HandshakeRequest, HandshakeResponse, Message, MessageType,
    Segment, SegmentKind,
};
use relayport_session::{
    spawn_channel, AgentHandshake, ChannelConfig, ChannelEnd, ChannelEvent, ClientHandshake,
    Role,
};
use relayport_transport::{
    memory_pair, DuplexTransport, FrameFilter, TransportReceiver, TransportSender,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn fast_config() -> ChannelConfig {
    ChannelConfig {
        retransmit_interval: Duration::from_millis(10),
        retransmit_timeout: Duration::from_millis(50),
        max_retransmit_backoff: Duration::from_millis(200),
        ack_delay: Duration::from_millis(5),
        handshake_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Drops the first transmission of every data frame
fn drop_first_transmissions() -> FrameFilter {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    Arc::new(move |chunk: &Bytes| {
        let mut buffer = BytesMut::from(&chunk[..]);
        match FrameCodec::decode(&mut buffer) {
            Ok(Some(msg)) if msg.message_type == MessageType::Data => {
                !seen.lock().unwrap().insert(msg.message_id)
            }
            _ => true,
        }
    })
}

/// Raw end of a transport that speaks frames directly
struct ScriptedPeer {
    tx: Box<dyn TransportSender>,
    rx: Box<dyn TransportReceiver>,
    buffer: BytesMut,
}

impl ScriptedPeer {
    fn new(transport: Box<dyn DuplexTransport>) -> Self {
        let (tx, rx) = transport.split();
        Self {
            tx,
            rx,
            buffer: BytesMut::new(),
        }
    }

    async fn next(&mut self) -> Option<Message> {
        loop {
            if let Some(msg) = FrameCodec::decode(&mut self.buffer).unwrap() {
                return Some(msg);
            }
            let chunk = self.rx.recv().await.unwrap()?;
            self.buffer.extend_from_slice(&chunk);
        }
    }

    async fn send(&mut self, msg: Message) {
        self.tx.send(FrameCodec::encode(&msg).unwrap()).await.unwrap();
    }

    /// Answer the initiator's handshake, accepting what it requested
    async fn accept_handshake(&mut self) {
        let open = self.next().await.unwrap();
        assert_eq!(open.message_type, MessageType::ChannelOpen);
        let request = self.next().await.unwrap();
        let request: HandshakeRequest = parse_document(&request).unwrap();

        self.send(
            Message::control_json(
                MessageType::HandshakeResponse,
                &HandshakeResponse {
                    schema_version: 1,
                    capabilities: request.capabilities,
                    errors: vec![],
                },
            )
            .unwrap(),
        )
        .await;

        let complete = self.next().await.unwrap();
        assert_eq!(complete.message_type, MessageType::HandshakeComplete);
    }
}

/// Test 1: every first transmission lost, the byte stream still arrives exactly once
#[tokio::test]
async fn test_lossy_link_converges_without_duplicates() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let config = fast_config();
    let (a, b) = memory_pair(256);
    let a = a.with_send_filter(drop_first_transmissions());

    let client_cancel = CancellationToken::new();
    let client = spawn_channel(
        Box::new(a),
        Role::Initiator(ClientHandshake::new(&config, "lossy", "")),
        config.clone(),
        client_cancel.clone(),
    );
    let agent = spawn_channel(
        Box::new(b),
        Role::Responder(AgentHandshake::new(&config)),
        config.clone(),
        CancellationToken::new(),
    );
    let (client, agent) = tokio::join!(client.opened(), agent.opened());
    let client = client.unwrap();
    let mut agent = agent.unwrap();

    let chunks: Vec<Bytes> = (0..10u8)
        .map(|i| Bytes::from(vec![i; 100 + i as usize]))
        .collect();
    let expected: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();

    for chunk in &chunks {
        client
            .segments
            .send(Segment::data(1, chunk.clone()))
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    while received.len() < expected.len() {
        let event = tokio::time::timeout(Duration::from_secs(5), agent.events.recv())
            .await
            .expect("delivery stalled")
            .unwrap();
        match event {
            ChannelEvent::Segment(segment) => {
                assert_eq!(segment.kind, SegmentKind::Data);
                received.extend_from_slice(&segment.data);
            }
            ChannelEvent::PeerClosed => panic!("peer closed early"),
        }
    }
    assert_eq!(received, expected);

    client_cancel.cancel();
    drop(client.segments);
    let summary = client.task.join().await.unwrap();
    assert_eq!(summary.end, ChannelEnd::Shutdown);
    assert!(summary.retransmissions >= 10);

    // Nothing after the stream but the close
    assert_eq!(agent.events.recv().await, Some(ChannelEvent::PeerClosed));
    println!("✅ Lossy link converged after {} retransmissions", summary.retransmissions);
}

/// Test 2: unacknowledged bytes never exceed the window
#[tokio::test]
async fn test_window_bounds_unacknowledged_bytes() {
    let config = ChannelConfig {
        max_frame_size: 1024,
        max_window: 4096,
        retransmit_interval: Duration::from_millis(100),
        retransmit_timeout: Duration::from_secs(5),
        max_retransmit_backoff: Duration::from_secs(10),
        ..Default::default()
    };
    let (a, b) = memory_pair(256);
    let mut peer = ScriptedPeer::new(Box::new(b));
    let client = spawn_channel(
        Box::new(a),
        Role::Initiator(ClientHandshake::new(&config, "window", "")),
        config.clone(),
        CancellationToken::new(),
    );

    let mut snapshots = client.snapshots();
    let peak = Arc::new(Mutex::new(0usize));
    let observed = peak.clone();
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let in_flight = snapshots.borrow().in_flight;
            let mut peak = observed.lock().unwrap();
            *peak = (*peak).max(in_flight);
        }
    });

    let (open, ()) = tokio::join!(client.opened(), peer.accept_handshake());
    let open = open.unwrap();

    let chunk = Bytes::from(vec![7u8; 1024 - Segment::HEADER_SIZE]);
    for _ in 0..16 {
        open.segments
            .send(Segment::data(1, chunk.clone()))
            .await
            .unwrap();
    }

    let mut total = 0usize;
    for round in 1..=4u64 {
        let mut in_round = 0usize;
        while in_round < 4096 {
            let msg = peer.next().await.unwrap();
            assert_eq!(msg.message_type, MessageType::Data);
            in_round += msg.payload.len();
        }
        assert_eq!(in_round, 4096);

        // The sender must now be blocked on the window
        let extra = tokio::time::timeout(Duration::from_millis(200), peer.next()).await;
        assert!(extra.is_err(), "sent past the window in round {}", round);
        assert_eq!(open.snapshots.borrow().in_flight, 4096);

        total += in_round;
        peer.send(Message::acknowledge((round * 4096) as u32)).await;
    }
    assert_eq!(total, 16 * 1024);
    assert!(*peak.lock().unwrap() <= 4096);
    println!("✅ Window held at {} bytes", *peak.lock().unwrap());
}

/// Test 3: duplicate and stale acknowledgments change nothing
#[tokio::test]
async fn test_repeated_acks_are_idempotent() {
    let config = ChannelConfig {
        retransmit_timeout: Duration::from_secs(5),
        max_retransmit_backoff: Duration::from_secs(10),
        ..fast_config()
    };
    let (a, b) = memory_pair(256);
    let mut peer = ScriptedPeer::new(Box::new(b));
    let client = spawn_channel(
        Box::new(a),
        Role::Initiator(ClientHandshake::new(&config, "acks", "")),
        config.clone(),
        CancellationToken::new(),
    );
    let (open, ()) = tokio::join!(client.opened(), peer.accept_handshake());
    let open = open.unwrap();

    for _ in 0..3 {
        open.segments
            .send(Segment::data(1, Bytes::from_static(b"0123456789")))
            .await
            .unwrap();
    }
    for _ in 0..3 {
        peer.next().await.unwrap();
    }

    // 15 bytes per fragment; acknowledge the first two
    peer.send(Message::acknowledge(30)).await;
    peer.send(Message::acknowledge(30)).await;
    peer.send(Message::acknowledge(15)).await;
    // Beyond anything sent
    peer.send(Message::acknowledge(1000)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = *open.snapshots.borrow();
    assert_eq!(snapshot.acked, 30);
    assert_eq!(snapshot.in_flight, 15);
    assert_eq!(snapshot.unacked, 1);
}

/// Test 4: fragments delivered out of order by the peer come out in order
#[tokio::test]
async fn test_reordered_fragments_delivered_in_order() {
    let config = fast_config();
    let (a, b) = memory_pair(256);
    let mut peer = ScriptedPeer::new(Box::new(b));
    let client = spawn_channel(
        Box::new(a),
        Role::Initiator(ClientHandshake::new(&config, "reorder", "")),
        config.clone(),
        CancellationToken::new(),
    );
    let (open, ()) = tokio::join!(client.opened(), peer.accept_handshake());
    let mut open = open.unwrap();

    let first = Segment::data(1, Bytes::from_static(b"aaaaa")).encode();
    let second = Segment::data(1, Bytes::from_static(b"bbbbb")).encode();
    let third = Segment::data(1, Bytes::from_static(b"ccccc")).encode();

    peer.send(Message::data(0, first)).await;
    peer.send(Message::data(20, third)).await;

    // The gap triggers an immediate acknowledgment of what is contiguous
    let ack = peer.next().await.unwrap();
    assert_eq!(ack.message_type, MessageType::Acknowledge);
    assert_eq!(ack.sequence_number, 10);

    peer.send(Message::data(10, second)).await;

    let mut delivered = Vec::new();
    for _ in 0..3 {
        match open.events.recv().await.unwrap() {
            ChannelEvent::Segment(segment) => delivered.extend_from_slice(&segment.data),
            ChannelEvent::PeerClosed => panic!("unexpected close"),
        }
    }
    assert_eq!(delivered, b"aaaaabbbbbccccc");

    let ack = loop {
        let msg = peer.next().await.unwrap();
        if msg.message_type == MessageType::Acknowledge && msg.sequence_number == 30 {
            break msg;
        }
    };
    assert_eq!(ack.sequence_number, 30);
}
