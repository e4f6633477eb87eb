use std::io;
use std::sync::Arc;

use thiserror::Error;
use trust_dns_resolver::error::ResolveError;

use super::message::Message;

/// Everything that can go wrong between an address and its SMTP verdict.
///
/// Causes are held in `Arc` so one failure can be handed to every waiter of
/// a closed connection or a shared probe.
#[derive(Debug, Clone, Error)]
pub enum SmtpError {
    #[error("no MX records for {hostname}")]
    NoMxRecords { hostname: String },
    #[error("MX lookup for {hostname} failed: {source}")]
    Lookup {
        hostname: String,
        #[source]
        source: Arc<ResolveError>,
    },
    #[error("resolver initialization failed: {source}")]
    ResolverInit {
        #[source]
        source: Arc<ResolveError>,
    },
    #[error("connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("unable to connect to any MX server for {hostname}")]
    Unreachable {
        hostname: String,
        #[source]
        last: Box<SmtpError>,
    },
    #[error("connection to proxy {proxy} failed: {reason}")]
    ProxyConnect { proxy: String, reason: String },
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        reason: String,
        #[source]
        source: Option<Arc<io::Error>>,
    },
    #[error("authentication required: {0}")]
    AuthenticationRequired(Message),
    #[error("over quota: {0}")]
    OverQuota(Message),
    #[error("sender blocked: {0}")]
    SenderBlocked(Message),
    #[error("too many recipients: {0}")]
    TooManyRecipients(Message),
    #[error("unexpected reply \"{message}\", expected one of {expected:?}")]
    UnexpectedReply { message: Message, expected: Vec<u16> },
    #[error("malformed SMTP reply {line:?}")]
    MalformedReply { line: String },
    #[error("invalid recipient address {address:?}")]
    InvalidRecipient { address: String },
}

impl SmtpError {
    pub(crate) fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn broken(reason: impl Into<String>, source: io::Error) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub(crate) fn connect(target: impl Into<String>, source: io::Error) -> Self {
        Self::Connect {
            target: target.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn proxy(proxy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ProxyConnect {
            proxy: proxy.into(),
            reason: reason.into(),
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }

    /// The proxy in front of every connection is down, so nothing that
    /// follows can be trusted. Looks through [`SmtpError::Unreachable`].
    pub fn is_proxy_failure(&self) -> bool {
        match self {
            Self::ProxyConnect { .. } => true,
            Self::Unreachable { last, .. } => last.is_proxy_failure(),
            _ => false,
        }
    }

    /// Server reply carried by the error, if any.
    pub fn reply(&self) -> Option<&Message> {
        match self {
            Self::AuthenticationRequired(message)
            | Self::OverQuota(message)
            | Self::SenderBlocked(message)
            | Self::TooManyRecipients(message)
            | Self::UnexpectedReply { message, .. } => Some(message),
            _ => None,
        }
    }
}
