//! Event bus payloads published by the connection manager and the transfer engine.

use std::time::Duration;

use duo_core::Envelope;

use crate::connection::ConnectFailure;

/// Capacity of each broadcast channel. Slow subscribers observe `Lagged` and skip ahead.
pub const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub failure: Option<ConnectFailure>,
    /// Peer display name once the handshake has identified it.
    pub peer: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Status(ConnectionStatus),
    /// Decrypted inbound envelope.
    Message(Envelope),
}

/// Ordered, lossless feed for the single consumer that acts on session traffic.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Message(Envelope),
    /// The session carrying in-flight transfers is gone.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started {
        id: String,
        name: String,
        size: u64,
        direction: Direction,
    },
    Progress {
        id: String,
        percent: u8,
        bytes_per_sec: f64,
        eta: Option<Duration>,
    },
    /// Integrity verdict: reported by the receiver, echoed to the sender.
    Finished {
        id: String,
        direction: Direction,
        verified: bool,
    },
    Failed {
        id: String,
        direction: Direction,
        reason: String,
    },
    Cancelled {
        id: String,
        direction: Direction,
        by_peer: bool,
    },
}
