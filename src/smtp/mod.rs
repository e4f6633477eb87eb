//! SMTP side of verification: MX lookup, sessions, reconnection and pooling.
//!
//! [`Connector`] opens a [`Connection`] to the best MX host of a domain,
//! [`ConnectionPool`] keeps a bounded set of [`ReconnectingConnection`]s per
//! domain and hands out [`UnreliableConnection`] for catch-all hosts.

mod command;
mod connection;
mod connector;
mod dial;
mod error;
mod message;
mod pool;
mod reconnect;
mod resolver;
mod socks;
mod types;

pub use command::Command;
pub use connection::Connection;
pub use connector::{Connector, DEFAULT_CONNECT_TIMEOUT, SMTP_PORT};
pub use dial::{BoxedStream, Dial, DirectDialer, SmtpStream};
pub use error::SmtpError;
pub use message::{
    CODE_ACTION_NOT_TAKEN, CODE_ADDRESS_INACTIVE, CODE_CLOSING, CODE_OK, CODE_SERVICE_READY,
    Message, ReplyState,
};
pub use pool::{ConnectionPool, UnreliableConnection};
pub use reconnect::ReconnectingConnection;
pub use resolver::{MxLookup, MxRecord, system_resolver};
pub use socks::Socks5Dialer;
pub use types::{Connect, ConnectionEvent, ConnectionId, LaneKey, SmtpConnection};
