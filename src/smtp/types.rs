use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::error::SmtpError;
use super::message::Message;

pub(crate) const EVENT_CAPACITY: usize = 64;

/// Lifecycle notifications published by a connection.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A command went out or a reply came in.
    Active,
    /// The server sent a reply nobody was waiting for.
    Unsolicited(Message),
    /// The connection hit a terminal failure.
    Error(SmtpError),
    Closed,
}

/// A session able to probe recipients of one domain.
#[async_trait]
pub trait SmtpConnection: Send + Sync + fmt::Debug {
    fn hostname(&self) -> &str;

    /// `RCPT TO` probe; returns the final reply (250, 550 or 540).
    async fn send_verify_recipient(&self, address: &str) -> Result<Message, SmtpError>;

    /// `false` when the server accepts a recipient that cannot exist.
    async fn is_reliable(&self) -> Result<bool, SmtpError>;

    fn close(&self);

    fn is_closed(&self) -> bool;

    /// The error that ended the session, if it ended on one.
    fn terminal_failure(&self) -> Option<SmtpError> {
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Opens connections for a domain.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, hostname: &str) -> Result<Arc<dyn SmtpConnection>, SmtpError>;
}

/// Process-unique connection number, used to key per-connection lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Lane {
    /// One command in flight at a time.
    Commands,
    /// One verification (with its QUIT/init/reset preamble) at a time.
    Verifications,
}

/// Key of a per-connection lane in the shared queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneKey {
    connection: ConnectionId,
    lane: Lane,
}

impl LaneKey {
    pub(crate) fn new(connection: ConnectionId, lane: Lane) -> Self {
        Self { connection, lane }
    }
}
