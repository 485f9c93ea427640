//! In-process duplex transport
//!
//! Two connected endpoints backed by bounded channels. A send filter can drop
//! chunks on the way out, which is how loss is simulated in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::{DuplexTransport, TransportError, TransportReceiver, TransportResult, TransportSender};

/// Decides whether an outgoing chunk is delivered (`true`) or dropped
pub type FrameFilter = Arc<dyn Fn(&Bytes) -> bool + Send + Sync>;

/// One endpoint of an in-memory transport pair
pub struct MemoryTransport {
    name: String,
    tx: mpsc::Sender<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    filter: Option<FrameFilter>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("name", &self.name)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Create two connected endpoints; `capacity` bounds the chunks in flight per direction
pub fn memory_pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::channel(capacity);
    let (b_tx, a_rx) = mpsc::channel(capacity);

    (
        MemoryTransport {
            name: "memory-a".to_string(),
            tx: a_tx,
            rx: a_rx,
            filter: None,
        },
        MemoryTransport {
            name: "memory-b".to_string(),
            tx: b_tx,
            rx: b_rx,
            filter: None,
        },
    )
}

impl MemoryTransport {
    /// Drop outgoing chunks for which `filter` returns false
    pub fn with_send_filter(mut self, filter: FrameFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl DuplexTransport for MemoryTransport {
    fn split(self: Box<Self>) -> (Box<dyn TransportSender>, Box<dyn TransportReceiver>) {
        let this = *self;
        (
            Box::new(MemorySender {
                name: this.name,
                tx: Some(this.tx),
                filter: this.filter,
            }),
            Box::new(MemoryReceiver { rx: this.rx }),
        )
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

struct MemorySender {
    name: String,
    tx: Option<mpsc::Sender<Bytes>>,
    filter: Option<FrameFilter>,
}

#[async_trait]
impl TransportSender for MemorySender {
    async fn send(&mut self, data: Bytes) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;

        if let Some(filter) = &self.filter {
            if !filter(&data) {
                trace!("[{}] dropped {} bytes", self.name, data.len());
                return Ok(());
            }
        }

        tx.send(data).await.map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.tx.take();
        Ok(())
    }
}

struct MemoryReceiver {
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl TransportReceiver for MemoryReceiver {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}
