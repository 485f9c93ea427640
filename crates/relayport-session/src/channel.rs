//! Channel coordinator
//!
//! A single task owns the [`ChannelState`]. Around it:
//! - a reader task turns transport chunks into messages,
//! - a writer task pushes encoded frames onto the transport,
//! - local connection pumps feed outbound segments through a bounded queue.
//!
//! The coordinator only pulls the next outbound segment while the window has
//! room for a full frame, so a saturated window backpressures every pump.

use bytes::{Bytes, BytesMut};
use relayport_proto::{
    DecodeError, EncodeError, FrameCodec, Message, MessageFlags, MessageType, Segment,
    SCHEMA_VERSION,
};
use relayport_transport::{DuplexTransport, TransportError, TransportReceiver, TransportSender};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::error::{ChannelFailure, SessionError};
use crate::governor::AckOutcome;
use crate::handshake::{AgentHandshake, AgentStep, ClientHandshake, Negotiated};
use crate::sequencer::{unwrap_offset, wire_offset};
use crate::state::{ChannelPhase, ChannelState};

/// Which end of the handshake this channel plays
#[derive(Debug)]
pub enum Role {
    Initiator(ClientHandshake),
    Responder(AgentHandshake),
}

/// Delivered to whoever consumes the channel's inbound stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Segment(Segment),
    PeerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEnd {
    /// Local shutdown, drained and announced with `channel_closed`
    Shutdown,
    /// The peer sent `channel_closed`
    PeerClosed,
    /// Shutdown requested before the channel opened
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSummary {
    pub end: ChannelEnd,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub retransmissions: u64,
}

/// Point-in-time view of the coordinator's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub phase: ChannelPhase,
    pub in_flight: usize,
    pub max_window: usize,
    pub unacked: usize,
    pub acked: u64,
    pub outbound_next: u64,
    pub inbound_expected: u64,
}

impl ChannelSnapshot {
    fn of(state: &ChannelState) -> Self {
        Self {
            phase: state.phase(),
            in_flight: state.governor.in_flight(),
            max_window: state.governor.max_window(),
            unacked: state.governor.unacked_count(),
            acked: state.governor.acked_offset(),
            outbound_next: state.sequencer.outbound_next(),
            inbound_expected: state.sequencer.inbound_expected(),
        }
    }
}

#[derive(Debug)]
enum ReaderEvent {
    Message(Message),
    Corrupt(DecodeError),
    Closed,
    Failed(TransportError),
}

/// The coordinator task
pub struct ChannelTask(JoinHandle<Result<ChannelSummary, SessionError>>);

impl ChannelTask {
    /// Wait for the channel to close or fail
    pub async fn join(self) -> Result<ChannelSummary, SessionError> {
        match self.0.await {
            Ok(result) => result,
            Err(e) => Err(ChannelFailure::TaskAborted(e.to_string()).into()),
        }
    }
}

/// A channel whose handshake is still in progress
pub struct ChannelHandle {
    snapshots: watch::Receiver<ChannelSnapshot>,
    opened: oneshot::Receiver<Negotiated>,
    segments: mpsc::Sender<Segment>,
    events: mpsc::Receiver<ChannelEvent>,
    task: ChannelTask,
}

/// An open channel, ready to carry segments
pub struct OpenChannel {
    pub negotiated: Negotiated,
    /// Outbound segments, sequenced in the order they are queued
    pub segments: mpsc::Sender<Segment>,
    /// Inbound segments in offset order, then [`ChannelEvent::PeerClosed`]
    pub events: mpsc::Receiver<ChannelEvent>,
    pub snapshots: watch::Receiver<ChannelSnapshot>,
    pub task: ChannelTask,
}

impl ChannelHandle {
    pub fn snapshots(&self) -> watch::Receiver<ChannelSnapshot> {
        self.snapshots.clone()
    }

    /// Wait for the handshake to finish
    ///
    /// Fails with the channel's error if it never opened, or with
    /// [`SessionError::Cancelled`] if shutdown was requested first.
    pub async fn opened(self) -> Result<OpenChannel, SessionError> {
        match self.opened.await {
            Ok(negotiated) => Ok(OpenChannel {
                negotiated,
                segments: self.segments,
                events: self.events,
                snapshots: self.snapshots,
                task: self.task,
            }),
            Err(_) => match self.task.join().await {
                Ok(_) => Err(SessionError::Cancelled),
                Err(e) => Err(e),
            },
        }
    }
}

/// Start the reader, writer and coordinator tasks for `transport`
pub fn spawn_channel(
    transport: Box<dyn DuplexTransport>,
    role: Role,
    config: ChannelConfig,
    cancel: CancellationToken,
) -> ChannelHandle {
    let depth = config.queue_depth;
    debug!("Starting channel over {}", transport.describe());
    let (sender, receiver) = transport.split();

    let (frames_tx, frames_rx) = mpsc::channel(depth);
    let (inbound_tx, inbound_rx) = mpsc::channel(depth);
    let (segments_tx, segments_rx) = mpsc::channel(depth);
    let (events_tx, events_rx) = mpsc::channel(depth);
    let (opened_tx, opened_rx) = oneshot::channel();

    let state = ChannelState::new(&config, Instant::now());
    let (snapshot_tx, snapshot_rx) = watch::channel(ChannelSnapshot::of(&state));

    tokio::spawn(write_frames(sender, frames_rx));
    let reader = tokio::spawn(read_frames(receiver, inbound_tx));

    let coordinator = Coordinator {
        max_frame: config.max_frame_size,
        config,
        state,
        schema_version: SCHEMA_VERSION,
        frames: frames_tx,
        inbound: inbound_rx,
        segments: segments_rx,
        segments_open: true,
        events: events_tx,
        snapshots: snapshot_tx,
        cancel,
        ack_deadline: None,
        bytes_sent: 0,
        bytes_received: 0,
    };
    let task = tokio::spawn(coordinator.run(role, opened_tx, reader));

    ChannelHandle {
        snapshots: snapshot_rx,
        opened: opened_rx,
        segments: segments_tx,
        events: events_rx,
        task: ChannelTask(task),
    }
}

async fn write_frames(mut sender: Box<dyn TransportSender>, mut frames: mpsc::Receiver<Bytes>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = sender.send(frame).await {
            error!("Failed to write to transport: {}", e);
            return;
        }
    }
    if let Err(e) = sender.close().await {
        debug!("Error closing transport: {}", e);
    }
}

async fn read_frames(mut receiver: Box<dyn TransportReceiver>, inbound: mpsc::Sender<ReaderEvent>) {
    let mut buffer = BytesMut::new();
    let last = loop {
        match receiver.recv().await {
            Ok(Some(chunk)) => {
                buffer.extend_from_slice(&chunk);
                loop {
                    match FrameCodec::decode(&mut buffer) {
                        Ok(Some(msg)) => {
                            if inbound.send(ReaderEvent::Message(msg)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            let _ = inbound.send(ReaderEvent::Corrupt(e)).await;
                            return;
                        }
                    }
                }
            }
            Ok(None) => break ReaderEvent::Closed,
            Err(e) => break ReaderEvent::Failed(e),
        }
    };
    let _ = inbound.send(last).await;
}

async fn ack_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

type Opening = Option<(Negotiated, Option<Message>)>;

struct Coordinator {
    config: ChannelConfig,
    state: ChannelState,
    max_frame: usize,
    schema_version: u32,
    frames: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<ReaderEvent>,
    segments: mpsc::Receiver<Segment>,
    segments_open: bool,
    events: mpsc::Sender<ChannelEvent>,
    snapshots: watch::Sender<ChannelSnapshot>,
    cancel: CancellationToken,
    ack_deadline: Option<Instant>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Coordinator {
    async fn run(
        mut self,
        role: Role,
        opened: oneshot::Sender<Negotiated>,
        reader: JoinHandle<()>,
    ) -> Result<ChannelSummary, SessionError> {
        let result = self.drive(role, opened).await;
        reader.abort();

        match &result {
            Ok(summary) => {
                self.state.transition(ChannelPhase::Closed);
                info!(
                    "Channel closed ({:?}): {} bytes sent, {} bytes received, {} retransmissions",
                    summary.end, summary.bytes_sent, summary.bytes_received, summary.retransmissions
                );
            }
            Err(e) => {
                self.state.transition(ChannelPhase::Failed);
                error!("❌ Channel failed: {}", e);
                let closed = Message::channel_closed().with_schema_version(self.schema_version);
                if let Ok(frame) = FrameCodec::encode(&closed) {
                    let _ = self.frames.try_send(frame);
                }
            }
        }
        self.publish();
        result
    }

    async fn drive(
        &mut self,
        role: Role,
        opened: oneshot::Sender<Negotiated>,
    ) -> Result<ChannelSummary, SessionError> {
        self.state.transition(ChannelPhase::Handshaking);
        self.publish();

        let opening = match role {
            Role::Initiator(handshake) => self.initiate(handshake).await?,
            Role::Responder(handshake) => self.respond(handshake).await?,
        };
        let Some((negotiated, pending)) = opening else {
            info!("Shutdown requested during handshake");
            let closed = Message::channel_closed();
            if let Err(e) = self.send_control(closed).await {
                debug!("Could not announce channel close: {}", e);
            }
            return Ok(self.summary(ChannelEnd::Cancelled));
        };

        self.max_frame = negotiated.max_frame_size;
        self.schema_version = negotiated.schema_version;
        self.state.transition(ChannelPhase::Open);
        self.publish();
        if opened.send(negotiated).is_err() {
            debug!("Channel opened with nobody waiting for it");
        }

        let end = self.stream(pending).await?;
        Ok(self.summary(end))
    }

    fn summary(&self, end: ChannelEnd) -> ChannelSummary {
        ChannelSummary {
            end,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            retransmissions: self.state.governor.retransmissions(),
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(ChannelSnapshot::of(&self.state));
    }

    async fn initiate(&mut self, mut handshake: ClientHandshake) -> Result<Opening, SessionError> {
        let started = Instant::now();
        for msg in handshake.start(started)? {
            self.send_control(msg).await?;
        }

        let deadline = started + self.config.handshake_timeout;
        loop {
            let Some(msg) = self.next_handshake_message(deadline).await? else {
                return Ok(None);
            };
            if let Some((negotiated, complete)) = handshake.on_message(&msg, Instant::now())? {
                self.send_control(complete).await?;
                return Ok(Some((negotiated, None)));
            }
        }
    }

    async fn respond(&mut self, mut handshake: AgentHandshake) -> Result<Opening, SessionError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let Some(msg) = self.next_handshake_message(deadline).await? else {
                return Ok(None);
            };
            match handshake.on_message(msg)? {
                AgentStep::Continue => {}
                AgentStep::Reply(reply) => self.send_control(reply).await?,
                AgentStep::Refuse { reply, error } => {
                    self.send_control(reply).await?;
                    return Err(error.into());
                }
                AgentStep::Open {
                    negotiated,
                    pending,
                } => return Ok(Some((negotiated, pending))),
            }
        }
    }

    async fn next_handshake_message(
        &mut self,
        deadline: Instant,
    ) -> Result<Option<Message>, SessionError> {
        use crate::error::HandshakeError;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            _ = sleep_until(deadline) => {
                Err(HandshakeError::Timeout(self.config.handshake_timeout).into())
            }
            event = self.inbound.recv() => match event {
                Some(ReaderEvent::Message(msg)) => Ok(Some(msg)),
                Some(ReaderEvent::Corrupt(e)) => Err(HandshakeError::Malformed(e).into()),
                Some(ReaderEvent::Failed(e)) => Err(SessionError::Transport(e)),
                Some(ReaderEvent::Closed) | None => Err(HandshakeError::TransportClosed.into()),
            },
        }
    }

    async fn stream(&mut self, pending: Option<Message>) -> Result<ChannelEnd, SessionError> {
        if let Some(msg) = pending {
            if let Some(end) = self.on_message(msg).await? {
                return Ok(end);
            }
        }

        let period = self.config.retransmit_interval;
        let mut retransmit = interval_at(Instant::now() + period, period);
        retransmit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.publish();
            let room = self.segments_open && self.state.governor.has_room(self.max_frame);

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.drain(&mut retransmit).await,
                event = self.inbound.recv() => {
                    if let Some(end) = self.on_inbound(event).await? {
                        return Ok(end);
                    }
                }
                _ = retransmit.tick() => self.retransmit_due().await?,
                _ = ack_timer(self.ack_deadline) => self.send_ack().await?,
                segment = self.segments.recv(), if room => match segment {
                    Some(segment) => self.send_segment(segment).await?,
                    None => {
                        debug!("All segment producers finished");
                        self.segments_open = false;
                    }
                },
            }
        }
    }

    /// Flush outstanding data until acknowledged or the grace period ends
    async fn drain(&mut self, retransmit: &mut Interval) -> Result<ChannelEnd, SessionError> {
        self.state.transition(ChannelPhase::Draining);
        let deadline = Instant::now() + self.config.shutdown_grace;
        info!(
            "Draining channel ({} bytes awaiting acknowledgment)",
            self.state.governor.in_flight()
        );

        loop {
            self.publish();
            if !self.segments_open && self.state.governor.is_idle() {
                break;
            }
            let room = self.segments_open && self.state.governor.has_room(self.max_frame);

            tokio::select! {
                biased;
                _ = sleep_until(deadline) => {
                    warn!(
                        "Shutdown grace period elapsed with {} bytes unacknowledged",
                        self.state.governor.in_flight()
                    );
                    break;
                }
                event = self.inbound.recv() => {
                    if let Some(end) = self.on_inbound(event).await? {
                        return Ok(end);
                    }
                    if self.ack_deadline.is_some() {
                        self.send_ack().await?;
                    }
                }
                _ = retransmit.tick() => self.retransmit_due().await?,
                segment = self.segments.recv(), if room => match segment {
                    Some(segment) => self.send_segment(segment).await?,
                    None => self.segments_open = false,
                },
            }
        }

        let closed = Message::channel_closed().with_schema_version(self.schema_version);
        if let Err(e) = self.send_control(closed).await {
            debug!("Could not announce channel close: {}", e);
        }
        Ok(ChannelEnd::Shutdown)
    }

    async fn on_inbound(
        &mut self,
        event: Option<ReaderEvent>,
    ) -> Result<Option<ChannelEnd>, SessionError> {
        match event {
            Some(ReaderEvent::Message(msg)) => self.on_message(msg).await,
            Some(ReaderEvent::Corrupt(e)) => Err(ChannelFailure::Decode(e).into()),
            Some(ReaderEvent::Failed(e)) => Err(SessionError::Transport(e)),
            Some(ReaderEvent::Closed) | None => Err(SessionError::Transport(TransportError::Closed)),
        }
    }

    async fn on_message(&mut self, msg: Message) -> Result<Option<ChannelEnd>, SessionError> {
        match msg.message_type {
            MessageType::Data => {
                self.on_data(msg).await?;
                Ok(None)
            }
            MessageType::Acknowledge => {
                self.on_ack(msg.sequence_number);
                Ok(None)
            }
            MessageType::ChannelClosed => {
                info!("Peer closed the channel");
                if self.events.send(ChannelEvent::PeerClosed).await.is_err() {
                    debug!("No consumer for the peer close");
                }
                Ok(Some(ChannelEnd::PeerClosed))
            }
            other => {
                debug!("Ignoring late {} message", other);
                Ok(None)
            }
        }
    }

    async fn on_data(&mut self, msg: Message) -> Result<(), SessionError> {
        let wants_ack = msg.flags.requests_ack();
        let received = self
            .state
            .sequencer
            .receive(msg.sequence_number, msg.payload)?;
        let out_of_order = received.duplicate || received.buffered;
        if out_of_order {
            trace!(
                seq = msg.sequence_number,
                duplicate = received.duplicate,
                "Out-of-order data"
            );
        }

        self.bytes_received += received.delivered_len() as u64;
        for payload in received.delivered {
            let segment = Segment::decode(payload).map_err(ChannelFailure::from)?;
            trace!(
                conn_id = segment.conn_id,
                kind = ?segment.kind,
                len = segment.data.len(),
                "Delivering segment"
            );
            if self.events.send(ChannelEvent::Segment(segment)).await.is_err() {
                trace!("Segment consumer gone, dropping delivery");
            }
        }

        if out_of_order || wants_ack {
            self.send_ack().await?;
        } else if self.ack_deadline.is_none() {
            self.ack_deadline = Some(Instant::now() + self.config.ack_delay);
        }
        Ok(())
    }

    fn on_ack(&mut self, wire: u32) {
        let offset = unwrap_offset(self.state.governor.acked_offset(), wire);
        let sent = self.state.sequencer.outbound_next();
        match self.state.governor.on_ack(offset, sent, Instant::now()) {
            AckOutcome::Advanced { released } => {
                trace!(offset, released, "Acknowledgment advanced the window");
            }
            AckOutcome::Ignored => trace!(offset, sent, "Ignoring stale acknowledgment"),
        }
    }

    async fn send_ack(&mut self) -> Result<(), SessionError> {
        self.ack_deadline = None;
        let expected = self.state.sequencer.inbound_expected();
        let ack = Message::acknowledge(wire_offset(expected)).with_schema_version(self.schema_version);
        self.send_control(ack).await
    }

    async fn send_segment(&mut self, segment: Segment) -> Result<(), SessionError> {
        let payload = segment.encode();
        let len = payload.len();
        if len > self.max_frame {
            return Err(ChannelFailure::Encode(EncodeError::PayloadTooLarge(len)).into());
        }

        let mut flags = MessageFlags::new();
        if segment.is_final() {
            flags = flags.with_final();
        }
        let governor = &self.state.governor;
        if governor.in_flight() + len > governor.max_window() / 2 {
            flags = flags.with_ack_request();
        }

        let offset = self.state.sequencer.assign(len);
        let msg = Message::data(wire_offset(offset), payload)
            .with_flags(flags)
            .with_schema_version(self.schema_version);
        let frame = FrameCodec::encode(&msg).map_err(ChannelFailure::from)?;
        self.state
            .governor
            .track(offset, len, msg.message_id, frame.clone(), Instant::now())?;
        self.bytes_sent += len as u64;

        trace!(
            offset,
            len,
            conn_id = segment.conn_id,
            kind = ?segment.kind,
            "Sending segment"
        );
        self.write(frame).await
    }

    async fn retransmit_due(&mut self) -> Result<(), SessionError> {
        let frames = self.state.governor.poll_retransmit(Instant::now())?;
        for frame in frames {
            self.write(frame).await?;
        }
        Ok(())
    }

    async fn send_control(&mut self, msg: Message) -> Result<(), SessionError> {
        let frame = FrameCodec::encode(&msg).map_err(ChannelFailure::from)?;
        self.write(frame).await
    }

    async fn write(&mut self, frame: Bytes) -> Result<(), SessionError> {
        self.frames
            .send(frame)
            .await
            .map_err(|_| SessionError::Transport(TransportError::Closed))
    }
}
