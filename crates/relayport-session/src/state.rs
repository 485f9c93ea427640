//! Channel lifecycle state

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ChannelConfig;
use crate::governor::{Governor, RetransmitPolicy};
use crate::sequencer::Sequencer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Init,
    Handshaking,
    Open,
    Draining,
    Closed,
    Failed,
}

impl ChannelPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelPhase::Closed | ChannelPhase::Failed)
    }

    fn can_enter(&self, next: ChannelPhase) -> bool {
        use ChannelPhase::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Init, Handshaking) => true,
            (Handshaking, Open) => true,
            (Open, Draining) => true,
            (Init | Handshaking | Open | Draining, Closed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ChannelPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChannelPhase::Init => "init",
            ChannelPhase::Handshaking => "handshaking",
            ChannelPhase::Open => "open",
            ChannelPhase::Draining => "draining",
            ChannelPhase::Closed => "closed",
            ChannelPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything the coordinator owns about one channel
#[derive(Debug)]
pub struct ChannelState {
    phase: ChannelPhase,
    pub sequencer: Sequencer,
    pub governor: Governor,
}

impl ChannelState {
    pub fn new(config: &ChannelConfig, now: Instant) -> Self {
        Self {
            phase: ChannelPhase::Init,
            sequencer: Sequencer::new(config.inbound_buffer_limit),
            governor: Governor::new(config.max_window, RetransmitPolicy::from(config), now),
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    /// Move to `next`, returning false if the transition is not allowed
    pub fn transition(&mut self, next: ChannelPhase) -> bool {
        if self.phase == next {
            return true;
        }
        if !self.phase.can_enter(next) {
            warn!("Ignoring channel transition {} -> {}", self.phase, next);
            return false;
        }
        debug!("Channel {} -> {}", self.phase, next);
        self.phase = next;
        true
    }
}
