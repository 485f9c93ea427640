//! Per-connection sub-header carried at the front of every data payload
//!
//! Several local connections share the single channel byte stream. Each data
//! payload is a segment: `[conn_id: u32][kind: u8][bytes]`.
//!
//! Each connection also carries its own receive window. A sender starts with
//! [`CONNECTION_WINDOW`] bytes of credit and may only send more data once the
//! receiver returns credit with a window segment, so a stalled local reader
//! only ever stalls its own connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Identifier of a forwarded connection, unique within one session
pub type ConnId = u32;

/// Connection id used when the session forwards one connection at a time
pub const SINGLE_CONN_ID: ConnId = 0;

/// Initial per-connection send credit, in data bytes
pub const CONNECTION_WINDOW: u32 = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    /// A new connection was accepted on the sending side
    Open = 0,
    Data = 1,
    /// The sender will write no more bytes for this connection
    Fin = 2,
    /// The connection was aborted
    Reset = 3,
    /// Returns send credit: `[bytes: u32]`
    Window = 4,
}

impl TryFrom<u8> for SegmentKind {
    type Error = SegmentError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SegmentKind::Open),
            1 => Ok(SegmentKind::Data),
            2 => Ok(SegmentKind::Fin),
            3 => Ok(SegmentKind::Reset),
            4 => Ok(SegmentKind::Window),
            _ => Err(SegmentError::InvalidKind(value)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("Invalid segment kind: {0}")]
    InvalidKind(u8),

    #[error("Segment shorter than its header ({0} bytes)")]
    Incomplete(usize),

    #[error("Window segment carries {0} bytes instead of 4")]
    InvalidWindow(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub conn_id: ConnId,
    pub kind: SegmentKind,
    pub data: Bytes,
}

impl Segment {
    /// Sub-header size: conn_id (4) + kind (1)
    pub const HEADER_SIZE: usize = 5;

    pub fn open(conn_id: ConnId) -> Self {
        Self {
            conn_id,
            kind: SegmentKind::Open,
            data: Bytes::new(),
        }
    }

    pub fn data(conn_id: ConnId, data: Bytes) -> Self {
        Self {
            conn_id,
            kind: SegmentKind::Data,
            data,
        }
    }

    pub fn fin(conn_id: ConnId) -> Self {
        Self {
            conn_id,
            kind: SegmentKind::Fin,
            data: Bytes::new(),
        }
    }

    pub fn reset(conn_id: ConnId) -> Self {
        Self {
            conn_id,
            kind: SegmentKind::Reset,
            data: Bytes::new(),
        }
    }

    /// Give the peer `bytes` more credit on `conn_id`
    pub fn window(conn_id: ConnId, bytes: u32) -> Self {
        Self {
            conn_id,
            kind: SegmentKind::Window,
            data: Bytes::copy_from_slice(&bytes.to_be_bytes()),
        }
    }

    /// Credit carried by a window segment
    pub fn window_grant(&self) -> Result<u32, SegmentError> {
        let bytes: [u8; 4] = self.data[..]
            .try_into()
            .map_err(|_| SegmentError::InvalidWindow(self.data.len()))?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Whether this segment ends the sender's half of the connection
    pub fn is_final(&self) -> bool {
        matches!(self.kind, SegmentKind::Fin | SegmentKind::Reset)
    }

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.data.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32(self.conn_id);
        buf.put_u8(self.kind as u8);
        buf.put(self.data.clone());
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, SegmentError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(SegmentError::Incomplete(buf.len()));
        }

        let conn_id = buf.get_u32();
        let kind = SegmentKind::try_from(buf.get_u8())?;

        Ok(Self {
            conn_id,
            kind,
            data: buf,
        })
    }
}
