//! Transport configuration, outcomes and statistics.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DispatchFailure;

/// Configuration for the dispatch transport.
///
/// These are deployment constants, never per-request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Maximum number of simultaneously open relay connections
    pub max_connections: usize,

    /// Messages sent over one connection before it is closed and reopened
    pub max_messages_per_connection: usize,

    /// Deadline for opening a connection (TCP connect through login)
    pub connect_timeout_ms: u64,

    /// Deadline for each protocol exchange, including the server greeting
    pub greeting_timeout_ms: u64,

    /// Deadline for transmitting one complete message
    pub socket_timeout_ms: u64,

    /// A connection unused for this long is closed instead of reused, since
    /// the relay may have dropped it
    pub max_idle_ms: u64,

    /// Number of sends that may wait for a connection before callers block
    pub queue_capacity: usize,

    /// Interval for logging transport status; None disables it
    pub status_log_interval_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_connections: 1,
            max_messages_per_connection: 30,
            connect_timeout_ms: 15_000,
            greeting_timeout_ms: 8_000,
            socket_timeout_ms: 20_000,
            max_idle_ms: 30_000,
            queue_capacity: 64,
            status_log_interval_ms: Some(60_000),
        }
    }
}

impl TransportConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn greeting_timeout(&self) -> Duration {
        Duration::from_millis(self.greeting_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_millis(self.max_idle_ms)
    }
}

/// Identifier of a relay connection opened by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Details of a successful send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReceipt {
    pub connection: ConnectionId,
    /// Time spent waiting in the queue for a connection
    pub queued_for: Duration,
    /// Time spent connecting (if needed) and transmitting
    pub elapsed: Duration,
}

/// Terminal result of one send. Produced exactly once per message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent(DispatchReceipt),
    Failed(DispatchFailure),
}

impl DispatchOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchOutcome::Sent(_))
    }

    /// Low-cardinality label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Sent(_) => "sent",
            DispatchOutcome::Failed(failure) => failure.label(),
        }
    }
}

/// Point-in-time transport statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    /// Sends waiting for a connection
    pub queued: usize,
    /// Sends currently transmitting
    pub in_flight: usize,
    pub sent: u64,
    pub failed: u64,
    pub connections_opened: u64,
    /// Connections closed because they reached the per-connection message ceiling
    pub connections_rotated: u64,
    /// Connections closed because they sat unused past `max_idle_ms`
    pub connections_expired: u64,
}
