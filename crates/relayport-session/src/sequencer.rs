//! Byte-offset sequencing for both directions of the channel
//!
//! Outbound data is numbered by its absolute offset in the sent stream.
//! Inbound data is delivered strictly in offset order: fragments that arrive
//! ahead of a gap are held in a bounded reorder buffer and duplicates are
//! dropped.
//!
//! Every payload is one whole segment and retransmissions repeat it byte for
//! byte, so fragment boundaries never shift. A fragment that partially
//! overlaps data already seen would split a segment header and fails the
//! channel with [`ChannelFailure::PartialOverlap`].
//!
//! Offsets are tracked as `u64`; the wire carries the low 32 bits and the
//! receiving side unwraps them against the offset it expects next.

use bytes::Bytes;
use std::collections::BTreeMap;

use crate::error::ChannelFailure;

const WRAP_SPAN: u64 = 1 << 32;
const HALF_SPAN: u64 = 1 << 31;

/// Truncate an absolute offset to its wire representation
pub fn wire_offset(offset: u64) -> u32 {
    offset as u32
}

/// Recover the absolute offset closest to `reference` whose low 32 bits are `wire`
pub fn unwrap_offset(reference: u64, wire: u32) -> u64 {
    let candidate = (reference & !(WRAP_SPAN - 1)) | u64::from(wire);
    if candidate + HALF_SPAN <= reference {
        candidate + WRAP_SPAN
    } else if candidate > reference + HALF_SPAN && candidate >= WRAP_SPAN {
        candidate - WRAP_SPAN
    } else {
        candidate
    }
}

/// Result of accepting one inbound data payload
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Received {
    /// Payloads now deliverable, in offset order
    pub delivered: Vec<Bytes>,
    /// Every byte of the payload had already been delivered or buffered
    pub duplicate: bool,
    /// The payload arrived ahead of a gap and is waiting in the reorder buffer
    pub buffered: bool,
}

impl Received {
    pub fn delivered_len(&self) -> usize {
        self.delivered.iter().map(Bytes::len).sum()
    }
}

#[derive(Debug)]
pub struct Sequencer {
    outbound_next: u64,
    inbound_expected: u64,
    inbound_buffer: BTreeMap<u64, Bytes>,
    buffered_bytes: usize,
    buffer_limit: usize,
}

impl Sequencer {
    pub fn new(buffer_limit: usize) -> Self {
        Self {
            outbound_next: 0,
            inbound_expected: 0,
            inbound_buffer: BTreeMap::new(),
            buffered_bytes: 0,
            buffer_limit,
        }
    }

    /// Offset the next outbound payload will start at
    pub fn outbound_next(&self) -> u64 {
        self.outbound_next
    }

    /// Every inbound byte below this offset has been delivered
    pub fn inbound_expected(&self) -> u64 {
        self.inbound_expected
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Reserve `len` bytes of the outbound stream, returning their start offset
    pub fn assign(&mut self, len: usize) -> u64 {
        let start = self.outbound_next;
        self.outbound_next += len as u64;
        start
    }

    /// Accept a data payload whose wire sequence number is `wire_seq`
    pub fn receive(&mut self, wire_seq: u32, payload: Bytes) -> Result<Received, ChannelFailure> {
        let mut received = Received::default();
        if payload.is_empty() {
            return Ok(received);
        }

        let offset = unwrap_offset(self.inbound_expected, wire_seq);
        let end = offset + payload.len() as u64;

        if end <= self.inbound_expected {
            received.duplicate = true;
            return Ok(received);
        }

        if offset > self.inbound_expected {
            if let Some(existing) = self.inbound_buffer.get(&offset) {
                if existing.len() != payload.len() {
                    return Err(ChannelFailure::PartialOverlap { offset });
                }
                received.duplicate = true;
                return Ok(received);
            }
            if self.buffered_bytes + payload.len() > self.buffer_limit {
                return Err(ChannelFailure::InboundOverflow {
                    limit: self.buffer_limit,
                });
            }
            self.buffered_bytes += payload.len();
            self.inbound_buffer.insert(offset, payload);
            received.buffered = true;
            return Ok(received);
        }

        if offset < self.inbound_expected {
            return Err(ChannelFailure::PartialOverlap { offset });
        }

        received.delivered.push(payload);
        self.inbound_expected = end;
        self.drain_buffer(&mut received.delivered)?;
        Ok(received)
    }

    fn drain_buffer(&mut self, delivered: &mut Vec<Bytes>) -> Result<(), ChannelFailure> {
        while let Some(entry) = self.inbound_buffer.first_entry() {
            let start = *entry.key();
            if start > self.inbound_expected {
                break;
            }
            if start < self.inbound_expected {
                return Err(ChannelFailure::PartialOverlap { offset: start });
            }
            let chunk = entry.remove();
            self.buffered_bytes -= chunk.len();
            self.inbound_expected = start + chunk.len() as u64;
            delivered.push(chunk);
        }
        Ok(())
    }
}
