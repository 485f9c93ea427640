//! Local connection multiplexing
//!
//! Each forwarded TCP connection gets one task that runs both directions:
//! - read local socket -> segments -> channel
//! - channel -> write queue -> local socket
//!
//! The multiplexer owns the connection table and dispatches inbound
//! segments to the right connection by id. Dispatch never waits on a local
//! socket: every connection has its own receive window, so its write queue
//! holds at most [`CONNECTION_WINDOW`] bytes and a slow local reader only
//! stops its own peer from sending.

use bytes::Bytes;
use relayport_proto::{ConnId, Segment, SegmentKind, CONNECTION_WINDOW, SINGLE_CONN_ID};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelEvent;
use crate::config::ForwardingMode;
use crate::handshake::Negotiated;

/// Written bytes are returned to the peer once this much has accumulated
const GRANT_THRESHOLD: usize = CONNECTION_WINDOW as usize / 4;

/// Inbound bytes tolerated before a connection counts as overrun
///
/// A reused id (single mode) can inherit late grants meant for the previous
/// connection, at most one window's worth.
const RECEIVE_LIMIT: usize = 2 * CONNECTION_WINDOW as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the connection to be announced or dialed
    Connecting,
    Streaming,
    /// One direction has finished
    HalfClosed,
    Closed,
}

#[derive(Debug)]
pub(crate) enum WriteCmd {
    Data(Bytes),
    Fin,
}

#[derive(Debug)]
pub(crate) enum PumpNotice {
    Started(ConnId),
    /// The local side reached EOF and a fin segment was queued
    ReadFinished(ConnId),
    /// The peer's fin was applied to the local socket
    WriteFinished(ConnId),
    /// The connection failed locally and a reset segment was queued
    Aborted(ConnId),
}

/// Bytes this side may still send on one connection
#[derive(Debug)]
pub(crate) struct SendCredit {
    available: AtomicUsize,
    notify: Notify,
}

impl SendCredit {
    fn new(initial: usize) -> Self {
        Self {
            available: AtomicUsize::new(initial),
            notify: Notify::new(),
        }
    }

    pub(crate) fn grant(&self, bytes: usize) {
        self.available.fetch_add(bytes, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Wait for credit and take up to `max` bytes of it
    ///
    /// Only the connection's reader takes credit.
    async fn take(&self, max: usize) -> usize {
        loop {
            let available = self.available.load(Ordering::Acquire);
            if available > 0 {
                let taken = available.min(max);
                self.available.fetch_sub(taken, Ordering::AcqRel);
                return taken;
            }
            self.notify.notified().await;
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }
}

/// Credit shared between a connection's table entry and its task
#[derive(Debug, Clone)]
pub(crate) struct ConnectionWindow {
    /// What we may send to the peer
    pub send: Arc<SendCredit>,
    /// What the peer may still send to us before we return credit
    pub receive: Arc<AtomicUsize>,
}

impl ConnectionWindow {
    pub(crate) fn new() -> Self {
        Self {
            send: Arc::new(SendCredit::new(CONNECTION_WINDOW as usize)),
            receive: Arc::new(AtomicUsize::new(RECEIVE_LIMIT)),
        }
    }

    /// Account for `len` inbound bytes; false if the peer overran its credit
    fn consume(&self, len: usize) -> bool {
        self.receive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(len))
            .is_ok()
    }
}

#[derive(Debug)]
pub struct ForwardingConnection {
    pub conn_id: ConnId,
    pub peer: Option<SocketAddr>,
    pub state: ConnectionState,
    local_done: bool,
    remote_done: bool,
    writes: mpsc::UnboundedSender<WriteCmd>,
    window: ConnectionWindow,
    task: JoinHandle<()>,
}

impl ForwardingConnection {
    pub(crate) fn new(
        conn_id: ConnId,
        peer: Option<SocketAddr>,
        writes: mpsc::UnboundedSender<WriteCmd>,
        window: ConnectionWindow,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            conn_id,
            peer,
            state: ConnectionState::Connecting,
            local_done: false,
            remote_done: false,
            writes,
            window,
            task,
        }
    }
}

/// Live connections keyed by connection id
#[derive(Debug, Default)]
pub(crate) struct ConnectionTable {
    connections: HashMap<ConnId, ForwardingConnection>,
}

impl ConnectionTable {
    pub(crate) fn insert(&mut self, connection: ForwardingConnection) {
        if let Some(previous) = self.connections.insert(connection.conn_id, connection) {
            warn!(conn_id = previous.conn_id, "Replacing a live connection");
            previous.task.abort();
        }
    }

    pub(crate) fn contains(&self, conn_id: ConnId) -> bool {
        self.connections.contains_key(&conn_id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Route an inbound segment to its connection without waiting on it
    pub(crate) fn dispatch(&mut self, segment: Segment, segments: &mpsc::Sender<Segment>) {
        let conn_id = segment.conn_id;
        match segment.kind {
            SegmentKind::Data => {
                let Some(conn) = self.connections.get(&conn_id) else {
                    debug!(conn_id, "Dropping data for unknown connection");
                    return;
                };
                let len = segment.data.len();
                if !conn.window.consume(len) {
                    warn!(conn_id, len, "Peer overran the connection window, resetting");
                    self.reset(conn_id, segments);
                    return;
                }
                trace!(conn_id, len, "Forwarding to local socket");
                if conn.writes.send(WriteCmd::Data(segment.data)).is_err() {
                    debug!(conn_id, "Connection writer already finished");
                }
            }
            SegmentKind::Window => {
                let Some(conn) = self.connections.get(&conn_id) else {
                    return;
                };
                match segment.window_grant() {
                    Ok(bytes) => {
                        trace!(conn_id, bytes, "Send credit returned");
                        conn.window.send.grant(bytes as usize);
                    }
                    Err(e) => {
                        warn!(conn_id, "Malformed window segment: {}", e);
                        self.reset(conn_id, segments);
                    }
                }
            }
            SegmentKind::Fin => {
                if let Some(conn) = self.connections.get(&conn_id) {
                    debug!(conn_id, "Peer finished sending");
                    let _ = conn.writes.send(WriteCmd::Fin);
                }
            }
            SegmentKind::Reset => {
                if let Some(conn) = self.connections.remove(&conn_id) {
                    info!(conn_id, "Connection reset by peer");
                    conn.task.abort();
                }
            }
            SegmentKind::Open => warn!(conn_id, "Ignoring unexpected open segment"),
        }
    }

    /// Drop one connection and tell the peer
    fn reset(&mut self, conn_id: ConnId, segments: &mpsc::Sender<Segment>) {
        if let Some(conn) = self.connections.remove(&conn_id) {
            conn.task.abort();
        }
        if segments.try_send(Segment::reset(conn_id)).is_err() {
            debug!(conn_id, "Could not queue reset");
        }
    }

    pub(crate) fn on_notice(&mut self, notice: PumpNotice) {
        match notice {
            PumpNotice::Started(conn_id) => {
                if let Some(conn) = self.connections.get_mut(&conn_id) {
                    if conn.state == ConnectionState::Connecting {
                        conn.state = ConnectionState::Streaming;
                    }
                }
            }
            PumpNotice::ReadFinished(conn_id) => self.finish(conn_id, true),
            PumpNotice::WriteFinished(conn_id) => self.finish(conn_id, false),
            PumpNotice::Aborted(conn_id) => {
                if let Some(conn) = self.connections.remove(&conn_id) {
                    debug!(conn_id, "Connection aborted locally");
                    conn.task.abort();
                }
            }
        }
    }

    fn finish(&mut self, conn_id: ConnId, local: bool) {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return;
        };
        if local {
            conn.local_done = true;
        } else {
            conn.remote_done = true;
        }

        if conn.local_done && conn.remote_done {
            conn.state = ConnectionState::Closed;
            info!(conn_id, "Connection closed");
            self.connections.remove(&conn_id);
        } else {
            conn.state = ConnectionState::HalfClosed;
        }
    }

    /// Reset every live connection and stop its task
    pub(crate) fn shutdown(&mut self, segments: &mpsc::Sender<Segment>) {
        for (conn_id, conn) in self.connections.drain() {
            if segments.try_send(Segment::reset(conn_id)).is_err() {
                debug!(conn_id, "Could not queue reset during shutdown");
            }
            conn.task.abort();
        }
    }

    /// Stop every connection task without telling the peer
    pub(crate) fn abort_all(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.task.abort();
        }
    }
}

/// Everything a connection task needs to reach the channel and the table
#[derive(Debug, Clone)]
pub(crate) struct PumpContext {
    pub conn_id: ConnId,
    pub chunk_size: usize,
    pub segments: mpsc::Sender<Segment>,
    pub notices: mpsc::UnboundedSender<PumpNotice>,
    pub window: ConnectionWindow,
}

impl PumpContext {
    fn notify(&self, notice: PumpNotice) {
        let _ = self.notices.send(notice);
    }

    /// Tell the peer the connection is gone and drop it from the table
    pub(crate) async fn abort(&self) {
        let _ = self.segments.send(Segment::reset(self.conn_id)).await;
        self.notify(PumpNotice::Aborted(self.conn_id));
    }
}

/// Pump bytes both ways for one local connection
///
/// With `announce` set an open segment is queued before any data.
pub(crate) async fn pump_connection(
    stream: TcpStream,
    announce: bool,
    writes: mpsc::UnboundedReceiver<WriteCmd>,
    ctx: PumpContext,
) {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    tokio::join!(
        read_local(read, announce, &ctx),
        write_local(write, writes, &ctx)
    );
}

async fn read_local(mut read: OwnedReadHalf, announce: bool, ctx: &PumpContext) {
    let conn_id = ctx.conn_id;
    if announce && ctx.segments.send(Segment::open(conn_id)).await.is_err() {
        return;
    }
    ctx.notify(PumpNotice::Started(conn_id));

    let credit = &ctx.window.send;
    let mut buffer = vec![0u8; ctx.chunk_size];
    loop {
        if credit.available() == 0 {
            trace!(conn_id, "Waiting for send credit");
        }
        let budget = credit.take(ctx.chunk_size).await;
        let result = read.read(&mut buffer[..budget]).await;
        let used = result.as_ref().map_or(0, |n| *n);
        if used < budget {
            credit.grant(budget - used);
        }

        match result {
            Ok(0) => {
                debug!(conn_id, "Local side finished sending");
                if ctx.segments.send(Segment::fin(conn_id)).await.is_ok() {
                    ctx.notify(PumpNotice::ReadFinished(conn_id));
                }
                return;
            }
            Ok(n) => {
                trace!(conn_id, len = n, "Read from local socket");
                let chunk = Bytes::copy_from_slice(&buffer[..n]);
                if ctx.segments.send(Segment::data(conn_id, chunk)).await.is_err() {
                    debug!(conn_id, "Channel gone, stopping reader");
                    return;
                }
            }
            Err(e) => {
                warn!(conn_id, "Local read failed: {}", e);
                ctx.abort().await;
                return;
            }
        }
    }
}

async fn write_local(
    mut write: OwnedWriteHalf,
    mut writes: mpsc::UnboundedReceiver<WriteCmd>,
    ctx: &PumpContext,
) {
    let conn_id = ctx.conn_id;
    let mut written = 0usize;
    while let Some(cmd) = writes.recv().await {
        match cmd {
            WriteCmd::Data(data) => {
                if let Err(e) = write.write_all(&data).await {
                    warn!(conn_id, "Local write failed: {}", e);
                    ctx.abort().await;
                    return;
                }
                written += data.len();
                if written >= GRANT_THRESHOLD {
                    // Reopen the window before the peer learns about it
                    ctx.window.receive.fetch_add(written, Ordering::AcqRel);
                    let grant = Segment::window(conn_id, written as u32);
                    written = 0;
                    if ctx.segments.send(grant).await.is_err() {
                        debug!(conn_id, "Channel gone, stopping writer");
                        return;
                    }
                }
            }
            WriteCmd::Fin => {
                if let Err(e) = write.shutdown().await {
                    debug!(conn_id, "Error shutting down local write half: {}", e);
                }
                ctx.notify(PumpNotice::WriteFinished(conn_id));
                return;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxSummary {
    pub connections: u64,
}

/// Initiating side: accepts local connections and announces them to the peer
pub struct Multiplexer {
    listener: TcpListener,
    mode: ForwardingMode,
    chunk_size: usize,
    segments: mpsc::Sender<Segment>,
    events: mpsc::Receiver<ChannelEvent>,
    table: ConnectionTable,
    next_id: ConnId,
    accepted: u64,
}

impl Multiplexer {
    pub fn new(
        listener: TcpListener,
        negotiated: &Negotiated,
        segments: mpsc::Sender<Segment>,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            listener,
            mode: negotiated.mode,
            chunk_size: negotiated.max_chunk(),
            segments,
            events,
            table: ConnectionTable::default(),
            next_id: 1,
            accepted: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> MuxSummary {
        let (notice_tx, mut notices) = mpsc::unbounded_channel();

        loop {
            let accepting = self.mode == ForwardingMode::Multiplexed || self.table.is_empty();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.table.shutdown(&self.segments);
                    break;
                }
                event = self.events.recv() => match event {
                    Some(ChannelEvent::Segment(segment)) => self.table.dispatch(segment, &self.segments),
                    Some(ChannelEvent::PeerClosed) | None => {
                        debug!("Channel ended, dropping local connections");
                        self.table.abort_all();
                        break;
                    }
                },
                Some(notice) = notices.recv() => self.table.on_notice(notice),
                accepted = self.listener.accept(), if accepting => match accepted {
                    Ok((stream, peer)) => self.start(stream, peer, &notice_tx),
                    Err(e) => warn!("Failed to accept local connection: {}", e),
                },
            }
        }

        MuxSummary {
            connections: self.accepted,
        }
    }

    fn allocate_id(&mut self) -> ConnId {
        match self.mode {
            ForwardingMode::Single => SINGLE_CONN_ID,
            ForwardingMode::Multiplexed => {
                let id = self.next_id;
                self.next_id = self.next_id.checked_add(1).unwrap_or(1);
                id
            }
        }
    }

    fn start(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        notices: &mpsc::UnboundedSender<PumpNotice>,
    ) {
        let conn_id = self.allocate_id();
        info!(conn_id, peer = %peer, "🔗 Accepted local connection");

        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let window = ConnectionWindow::new();
        let ctx = PumpContext {
            conn_id,
            chunk_size: self.chunk_size,
            segments: self.segments.clone(),
            notices: notices.clone(),
            window: window.clone(),
        };
        let task = tokio::spawn(pump_connection(stream, true, writes_rx, ctx));
        self.table.insert(ForwardingConnection::new(
            conn_id,
            Some(peer),
            writes_tx,
            window,
            task,
        ));
        self.accepted += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn negotiated(mode: ForwardingMode) -> Negotiated {
        Negotiated {
            schema_version: 1,
            max_frame_size: 5 + 4,
            mode,
        }
    }

    fn wide(mode: ForwardingMode) -> Negotiated {
        Negotiated {
            schema_version: 1,
            max_frame_size: 5 + 16 * 1024,
            mode,
        }
    }

    async fn next_segment(rx: &mut mpsc::Receiver<Segment>) -> Segment {
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_accepted_connection_is_announced_and_chunked() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (segments_tx, mut segments_rx) = mpsc::channel(64);
        let (_events_tx, events_rx) = mpsc::channel(64);
        let mux = Multiplexer::new(
            listener,
            &negotiated(ForwardingMode::Multiplexed),
            segments_tx,
            events_rx,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(mux.run(cancel.clone()));

        let mut local = TcpStream::connect(addr).await.unwrap();
        local.write_all(b"abcdefghij").await.unwrap();
        local.shutdown().await.unwrap();

        assert_eq!(next_segment(&mut segments_rx).await, Segment::open(1));
        let mut payload = Vec::new();
        loop {
            let segment = next_segment(&mut segments_rx).await;
            assert_eq!(segment.conn_id, 1);
            match segment.kind {
                SegmentKind::Data => {
                    assert!(segment.data.len() <= 4);
                    payload.extend_from_slice(&segment.data);
                }
                SegmentKind::Fin => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(payload, b"abcdefghij");

        cancel.cancel();
        assert_eq!(task.await.unwrap().connections, 1);
    }

    #[tokio::test]
    async fn test_inbound_segments_reach_local_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (segments_tx, mut segments_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let mux = Multiplexer::new(
            listener,
            &negotiated(ForwardingMode::Multiplexed),
            segments_tx,
            events_rx,
        );
        let task = tokio::spawn(mux.run(CancellationToken::new()));

        let mut local = TcpStream::connect(addr).await.unwrap();
        assert_eq!(next_segment(&mut segments_rx).await, Segment::open(1));

        events_tx
            .send(ChannelEvent::Segment(Segment::data(1, Bytes::from_static(b"pong"))))
            .await
            .unwrap();
        events_tx
            .send(ChannelEvent::Segment(Segment::fin(1)))
            .await
            .unwrap();

        let mut received = Vec::new();
        local.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"pong");

        events_tx.send(ChannelEvent::PeerClosed).await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_mode_serializes_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (segments_tx, mut segments_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let mux = Multiplexer::new(
            listener,
            &negotiated(ForwardingMode::Single),
            segments_tx,
            events_rx,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(mux.run(cancel.clone()));

        let first = TcpStream::connect(addr).await.unwrap();
        assert_eq!(next_segment(&mut segments_rx).await, Segment::open(SINGLE_CONN_ID));

        let _second = TcpStream::connect(addr).await.unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(100), segments_rx.recv()).await;
        assert!(pending.is_err(), "second connection must wait");

        events_tx
            .send(ChannelEvent::Segment(Segment::reset(SINGLE_CONN_ID)))
            .await
            .unwrap();
        drop(first);
        assert_eq!(next_segment(&mut segments_rx).await, Segment::open(SINGLE_CONN_ID));

        cancel.cancel();
        assert_eq!(task.await.unwrap().connections, 2);
    }

    #[tokio::test]
    async fn test_shutdown_resets_live_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (segments_tx, mut segments_rx) = mpsc::channel(64);
        let (_events_tx, events_rx) = mpsc::channel(64);
        let mux = Multiplexer::new(
            listener,
            &negotiated(ForwardingMode::Multiplexed),
            segments_tx,
            events_rx,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(mux.run(cancel.clone()));

        let _local = TcpStream::connect(addr).await.unwrap();
        assert_eq!(next_segment(&mut segments_rx).await, Segment::open(1));

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(next_segment(&mut segments_rx).await, Segment::reset(1));
    }

    #[tokio::test]
    async fn test_send_credit_waits_for_grant() {
        let credit = Arc::new(SendCredit::new(10));
        assert_eq!(credit.take(4).await, 4);
        assert_eq!(credit.take(100).await, 6);
        assert_eq!(credit.available(), 0);

        let waiter = tokio::spawn({
            let credit = credit.clone();
            async move { credit.take(100).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        credit.grant(7);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_reader_stops_at_window_until_granted() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (segments_tx, mut segments_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(64);
        let mux = Multiplexer::new(
            listener,
            &wide(ForwardingMode::Multiplexed),
            segments_tx,
            events_rx,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(mux.run(cancel.clone()));

        let mut local = TcpStream::connect(addr).await.unwrap();
        let writer = tokio::spawn(async move {
            let payload = vec![7u8; CONNECTION_WINDOW as usize + 32 * 1024];
            local.write_all(&payload).await.unwrap();
            local
        });
        assert_eq!(next_segment(&mut segments_rx).await, Segment::open(1));

        let window = CONNECTION_WINDOW as usize;
        let mut sent = 0;
        while sent < window {
            let segment = next_segment(&mut segments_rx).await;
            assert_eq!(segment.kind, SegmentKind::Data);
            sent += segment.data.len();
        }
        assert_eq!(sent, window);
        let stalled =
            tokio::time::timeout(std::time::Duration::from_millis(100), segments_rx.recv()).await;
        assert!(stalled.is_err(), "reader must wait for credit");

        events_tx
            .send(ChannelEvent::Segment(Segment::window(1, 32 * 1024)))
            .await
            .unwrap();
        let mut resumed = 0;
        while resumed < 32 * 1024 {
            resumed += next_segment(&mut segments_rx).await.data.len();
        }
        assert_eq!(resumed, 32 * 1024);

        let _local = writer.await.unwrap();
        cancel.cancel();
        task.await.unwrap();
    }

    fn idle_connection(
        conn_id: ConnId,
    ) -> (ForwardingConnection, mpsc::UnboundedReceiver<WriteCmd>) {
        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(std::future::pending::<()>());
        let window = ConnectionWindow::new();
        let conn = ForwardingConnection::new(conn_id, None, writes_tx, window, task);
        (conn, writes_rx)
    }

    #[tokio::test]
    async fn test_overrun_resets_only_that_connection() {
        let (segments_tx, mut segments_rx) = mpsc::channel(8);
        let mut table = ConnectionTable::default();
        // Neither write queue is drained
        let (stalled, _stalled_writes) = idle_connection(1);
        let (healthy, mut healthy_writes) = idle_connection(2);
        table.insert(stalled);
        table.insert(healthy);

        let chunk = Bytes::from(vec![1u8; 64 * 1024]);
        for _ in 0..(RECEIVE_LIMIT / chunk.len()) {
            table.dispatch(Segment::data(1, chunk.clone()), &segments_tx);
        }
        assert!(table.contains(1));
        assert!(segments_rx.try_recv().is_err());

        table.dispatch(Segment::data(1, Bytes::from_static(b"x")), &segments_tx);
        assert!(!table.contains(1));
        assert_eq!(segments_rx.try_recv().unwrap(), Segment::reset(1));

        table.dispatch(Segment::data(2, Bytes::from_static(b"ok")), &segments_tx);
        match healthy_writes.try_recv().unwrap() {
            WriteCmd::Data(data) => assert_eq!(&data[..], b"ok"),
            other => panic!("unexpected {:?}", other),
        }
        table.abort_all();
    }

    #[tokio::test]
    async fn test_window_segments_return_credit() {
        let (segments_tx, mut segments_rx) = mpsc::channel(8);
        let mut table = ConnectionTable::default();
        let (conn, _writes) = idle_connection(4);
        let credit = conn.window.send.clone();
        table.insert(conn);

        assert_eq!(credit.take(usize::MAX).await, CONNECTION_WINDOW as usize);
        table.dispatch(Segment::window(4, 1000), &segments_tx);
        assert_eq!(credit.available(), 1000);

        // A malformed grant drops the connection
        table.dispatch(
            Segment {
                conn_id: 4,
                kind: SegmentKind::Window,
                data: Bytes::from_static(b"12"),
            },
            &segments_tx,
        );
        assert!(!table.contains(4));
        assert_eq!(segments_rx.try_recv().unwrap(), Segment::reset(4));
    }
}
