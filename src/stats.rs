//! Per-agent forwarding metrics.
//!
//! ```text
//! Frame handed to backend    --> frames_sent
//! Retry timer fired, resent  --> retransmissions
//! Ack emitted / matched      --> acks_sent / acks_received
//! Ack for unknown id         --> unmatched_acks
//! Attempts exhausted         --> given_up
//! Inbound published/refused  --> inbound_published / inbound_rejected
//! Shadow or foreign message  --> outbound_skipped
//! Backend send error         --> send_failures
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lifecycle of an agent's link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Starting,
    Up,
    Failed(String),
    Stopped,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkStatus::Starting => write!(f, "starting"),
            LinkStatus::Up => write!(f, "up"),
            LinkStatus::Failed(reason) => write!(f, "failed: {}", reason),
            LinkStatus::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    FramesSent,
    Retransmissions,
    AcksSent,
    AcksReceived,
    UnmatchedAcks,
    GivenUp,
    InboundPublished,
    InboundRejected,
    OutboundSkipped,
    SendFailures,
}

#[derive(Debug)]
pub struct AgentStats {
    frames_sent: AtomicU64,
    retransmissions: AtomicU64,
    acks_sent: AtomicU64,
    acks_received: AtomicU64,
    unmatched_acks: AtomicU64,
    given_up: AtomicU64,
    inbound_published: AtomicU64,
    inbound_rejected: AtomicU64,
    outbound_skipped: AtomicU64,
    send_failures: AtomicU64,
    status: Mutex<LinkStatus>,
    last_activity: Mutex<Option<DateTime<Utc>>>,
}

impl AgentStats {
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            acks_sent: AtomicU64::new(0),
            acks_received: AtomicU64::new(0),
            unmatched_acks: AtomicU64::new(0),
            given_up: AtomicU64::new(0),
            inbound_published: AtomicU64::new(0),
            inbound_rejected: AtomicU64::new(0),
            outbound_skipped: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            status: Mutex::new(LinkStatus::Starting),
            last_activity: Mutex::new(None),
        }
    }

    fn counter(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::FramesSent => &self.frames_sent,
            Counter::Retransmissions => &self.retransmissions,
            Counter::AcksSent => &self.acks_sent,
            Counter::AcksReceived => &self.acks_received,
            Counter::UnmatchedAcks => &self.unmatched_acks,
            Counter::GivenUp => &self.given_up,
            Counter::InboundPublished => &self.inbound_published,
            Counter::InboundRejected => &self.inbound_rejected,
            Counter::OutboundSkipped => &self.outbound_skipped,
            Counter::SendFailures => &self.send_failures,
        }
    }

    /// Bump a counter and stamp the activity time.
    pub fn record(&self, counter: Counter) {
        self.counter(counter).fetch_add(1, Ordering::Relaxed);
        *self
            .last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Utc::now());
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counter(counter).load(Ordering::Relaxed)
    }

    pub fn set_status(&self, status: LinkStatus) {
        *self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = status;
    }

    pub fn status(&self) -> LinkStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Take a point-in-time snapshot for serialization.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            status: self.status(),
            frames_sent: self.get(Counter::FramesSent),
            retransmissions: self.get(Counter::Retransmissions),
            acks_sent: self.get(Counter::AcksSent),
            acks_received: self.get(Counter::AcksReceived),
            unmatched_acks: self.get(Counter::UnmatchedAcks),
            given_up: self.get(Counter::GivenUp),
            inbound_published: self.get(Counter::InboundPublished),
            inbound_rejected: self.get(Counter::InboundRejected),
            outbound_skipped: self.get(Counter::OutboundSkipped),
            send_failures: self.get(Counter::SendFailures),
            last_activity: *self
                .last_activity
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        }
    }
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of agent metrics for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub status: LinkStatus,
    pub frames_sent: u64,
    pub retransmissions: u64,
    pub acks_sent: u64,
    pub acks_received: u64,
    pub unmatched_acks: u64,
    pub given_up: u64,
    pub inbound_published: u64,
    pub inbound_rejected: u64,
    pub outbound_skipped: u64,
    pub send_failures: u64,
    pub last_activity: Option<DateTime<Utc>>,
}
