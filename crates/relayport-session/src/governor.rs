//! Window flow control and retransmission bookkeeping
//!
//! Every data fragment sent is kept, already encoded, until a cumulative
//! acknowledgment covers it. Unacknowledged bytes never exceed the window.
//! Fragments whose retransmission timer expires are resent verbatim with
//! exponential backoff per fragment.

use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::error::ChannelFailure;

#[derive(Debug, Clone)]
pub struct RetransmitPolicy {
    pub timeout: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
    pub max_stall: Duration,
}

impl From<&ChannelConfig> for RetransmitPolicy {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            timeout: config.retransmit_timeout,
            max_backoff: config.max_retransmit_backoff,
            max_retries: config.max_retries,
            max_stall: config.max_stall,
        }
    }
}

/// A sent fragment awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct Unacked {
    pub seq_start: u64,
    pub length: usize,
    pub message_id: Uuid,
    /// The encoded frame, resent as-is
    pub frame: Bytes,
    pub sent_at: Instant,
    /// Transmissions so far, including the first
    pub attempts: u32,
    pub rto: Duration,
}

impl Unacked {
    fn end(&self) -> u64 {
        self.seq_start + self.length as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The acknowledgment moved the window forward
    Advanced { released: usize },
    /// Stale, duplicate, or ahead of anything sent
    Ignored,
}

#[derive(Debug)]
pub struct Governor {
    unacked: VecDeque<Unacked>,
    in_flight: usize,
    max_window: usize,
    acked: u64,
    last_progress: Instant,
    policy: RetransmitPolicy,
    retransmissions: u64,
}

impl Governor {
    pub fn new(max_window: usize, policy: RetransmitPolicy, now: Instant) -> Self {
        Self {
            unacked: VecDeque::new(),
            in_flight: 0,
            max_window,
            acked: 0,
            last_progress: now,
            policy,
            retransmissions: 0,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn max_window(&self) -> usize {
        self.max_window
    }

    /// Highest cumulative acknowledgment received
    pub fn acked_offset(&self) -> u64 {
        self.acked
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn retransmissions(&self) -> u64 {
        self.retransmissions
    }

    /// Whether nothing is waiting for acknowledgment
    pub fn is_idle(&self) -> bool {
        self.unacked.is_empty()
    }

    /// Whether `len` more bytes fit in the window
    pub fn has_room(&self, len: usize) -> bool {
        self.in_flight + len <= self.max_window
    }

    /// Record a freshly sent fragment
    pub fn track(
        &mut self,
        seq_start: u64,
        length: usize,
        message_id: Uuid,
        frame: Bytes,
        now: Instant,
    ) -> Result<(), ChannelFailure> {
        if !self.has_room(length) {
            return Err(ChannelFailure::WindowOverflow {
                in_flight: self.in_flight + length,
                max_window: self.max_window,
            });
        }

        if self.unacked.is_empty() {
            // The stall clock only runs while something is outstanding
            self.last_progress = now;
        }

        self.unacked.push_back(Unacked {
            seq_start,
            length,
            message_id,
            frame,
            sent_at: now,
            attempts: 1,
            rto: self.policy.timeout,
        });
        self.in_flight += length;
        Ok(())
    }

    /// Apply a cumulative acknowledgment for every byte below `offset`
    ///
    /// `sent_limit` is the end of the outbound stream; acknowledgments past it
    /// are ignored, as are ones at or below the current acknowledged offset.
    pub fn on_ack(&mut self, offset: u64, sent_limit: u64, now: Instant) -> AckOutcome {
        if offset <= self.acked || offset > sent_limit {
            return AckOutcome::Ignored;
        }

        self.acked = offset;
        let mut released = 0;
        while let Some(front) = self.unacked.front() {
            if front.end() > offset {
                break;
            }
            released += front.length;
            self.unacked.pop_front();
        }
        self.in_flight -= released;
        self.last_progress = now;

        AckOutcome::Advanced { released }
    }

    /// Collect the frames whose retransmission timer expired
    pub fn poll_retransmit(&mut self, now: Instant) -> Result<Vec<Bytes>, ChannelFailure> {
        if self.unacked.is_empty() {
            return Ok(Vec::new());
        }

        let stalled = now.saturating_duration_since(self.last_progress);
        if stalled >= self.policy.max_stall {
            return Err(ChannelFailure::Stalled(stalled));
        }

        let mut due = Vec::new();
        for entry in self.unacked.iter_mut() {
            if now.saturating_duration_since(entry.sent_at) < entry.rto {
                continue;
            }
            if entry.attempts > self.policy.max_retries {
                return Err(ChannelFailure::RetriesExhausted {
                    offset: entry.seq_start,
                    attempts: entry.attempts,
                });
            }

            entry.attempts += 1;
            entry.sent_at = now;
            entry.rto = (entry.rto * 2).min(self.policy.max_backoff);
            debug!(
                offset = entry.seq_start,
                length = entry.length,
                attempt = entry.attempts,
                message_id = %entry.message_id,
                "Retransmitting fragment"
            );
            due.push(entry.frame.clone());
        }

        self.retransmissions += due.len() as u64;
        Ok(due)
    }
}
