//! Responding side of a forwarding channel
//!
//! Every open segment from the peer becomes a TCP connection to the target
//! service. Bytes are then pumped both ways exactly as on the initiating
//! side; a failed dial is reported back with a reset segment.

use relayport_proto::{ConnId, Segment, SegmentKind};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::ChannelEvent;
use crate::config::ChannelConfig;
use crate::handshake::Negotiated;
use crate::multiplexer::{
    pump_connection, ConnectionTable, ConnectionWindow, ForwardingConnection, MuxSummary,
    PumpContext, PumpNotice,
};

pub struct Forwarder {
    target: String,
    connect_timeout: Duration,
    chunk_size: usize,
    segments: mpsc::Sender<Segment>,
    events: mpsc::Receiver<ChannelEvent>,
    table: ConnectionTable,
    opened: u64,
}

impl Forwarder {
    pub fn new(
        target: impl Into<String>,
        config: &ChannelConfig,
        negotiated: &Negotiated,
        segments: mpsc::Sender<Segment>,
        events: mpsc::Receiver<ChannelEvent>,
    ) -> Self {
        Self {
            target: target.into(),
            connect_timeout: config.connect_timeout,
            chunk_size: negotiated.max_chunk(),
            segments,
            events,
            table: ConnectionTable::default(),
            opened: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> MuxSummary {
        let (notice_tx, mut notices) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.table.shutdown(&self.segments);
                    break;
                }
                event = self.events.recv() => match event {
                    Some(ChannelEvent::Segment(segment)) if segment.kind == SegmentKind::Open => {
                        self.open(segment.conn_id, &notice_tx);
                    }
                    Some(ChannelEvent::Segment(segment)) => self.table.dispatch(segment, &self.segments),
                    Some(ChannelEvent::PeerClosed) | None => {
                        debug!("Channel ended, dropping target connections");
                        self.table.abort_all();
                        break;
                    }
                },
                Some(notice) = notices.recv() => self.table.on_notice(notice),
            }
        }

        MuxSummary {
            connections: self.opened,
        }
    }

    fn open(&mut self, conn_id: ConnId, notices: &mpsc::UnboundedSender<PumpNotice>) {
        if self.table.contains(conn_id) {
            warn!(conn_id, "Ignoring open for a live connection");
            return;
        }

        let (writes_tx, writes_rx) = mpsc::unbounded_channel();
        let window = ConnectionWindow::new();
        let ctx = PumpContext {
            conn_id,
            chunk_size: self.chunk_size,
            segments: self.segments.clone(),
            notices: notices.clone(),
            window: window.clone(),
        };
        let target = self.target.clone();
        let connect_timeout = self.connect_timeout;

        let task = tokio::spawn(async move {
            match tokio::time::timeout(connect_timeout, TcpStream::connect(&target)).await {
                Ok(Ok(stream)) => {
                    info!(conn_id, target = %target, "🔗 Connected to target");
                    pump_connection(stream, false, writes_rx, ctx).await;
                }
                Ok(Err(e)) => {
                    error!(conn_id, target = %target, "Failed to connect to target: {}", e);
                    ctx.abort().await;
                }
                Err(_) => {
                    error!(
                        conn_id,
                        target = %target,
                        "Timed out connecting to target after {:?}",
                        connect_timeout
                    );
                    ctx.abort().await;
                }
            }
        });

        self.table
            .insert(ForwardingConnection::new(conn_id, None, writes_tx, window, task));
        self.opened += 1;
    }
}
