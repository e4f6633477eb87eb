use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::concurrency::ConcurrencyQueue;
use crate::settings::HostsSettings;

use super::connection::Connection;
use super::dial::{BoxedStream, Dial};
use super::error::SmtpError;
use super::resolver::{MxLookup, resolve_exchanges};
use super::types::{Connect, LaneKey, SmtpConnection};

pub const SMTP_PORT: u16 = 25;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves a domain's MX hosts and opens a [`Connection`] to the first one
/// that answers.
#[derive(Clone)]
pub struct Connector {
    lookup: Arc<dyn MxLookup>,
    dialer: Arc<dyn Dial>,
    settings: Arc<HostsSettings>,
    queue: Arc<ConcurrencyQueue<LaneKey>>,
    connect_timeout: Option<Duration>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("dialer", &self.dialer)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl Connector {
    pub fn new(
        lookup: Arc<dyn MxLookup>,
        dialer: Arc<dyn Dial>,
        settings: Arc<HostsSettings>,
    ) -> Self {
        Self {
            lookup,
            dialer,
            settings,
            queue: Arc::new(ConcurrencyQueue::serial()),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }

    /// Bound on each connect attempt, `None` to wait for the OS.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout.filter(|limit| !limit.is_zero());
        self
    }

    /// Try each MX host in preference order. A proxy failure stops the walk.
    pub async fn open(&self, hostname: &str) -> Result<Connection, SmtpError> {
        let hostname = hostname.to_lowercase();
        let records = resolve_exchanges(self.lookup.as_ref(), &hostname).await?;
        debug!(
            hostname = %hostname,
            mx = ?records.iter().map(|r| r.exchange.as_str()).collect::<Vec<_>>(),
            "MX hosts found"
        );

        let mut last = None;
        for record in &records {
            let target = format!("{}:{SMTP_PORT}", record.exchange);
            match self.dial(&record.exchange, &target).await {
                Ok(stream) => {
                    debug!(hostname = %hostname, remote = %target, "connected");
                    return Ok(Connection::new(
                        stream,
                        &hostname,
                        &target,
                        self.settings.find_for_hostname(&hostname),
                        Arc::clone(&self.queue),
                    ));
                }
                Err(err) if err.is_proxy_failure() => return Err(err),
                Err(err) => {
                    debug!(hostname = %hostname, remote = %target, error = %err, "unable to connect");
                    last = Some(err);
                }
            }
        }

        Err(SmtpError::Unreachable {
            last: Box::new(last.unwrap_or_else(|| SmtpError::NoMxRecords {
                hostname: hostname.clone(),
            })),
            hostname,
        })
    }

    async fn dial(&self, exchange: &str, target: &str) -> Result<BoxedStream, SmtpError> {
        let attempt = self.dialer.dial(exchange, SMTP_PORT);
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, attempt).await.unwrap_or_else(|_| {
                Err(SmtpError::connect(
                    target,
                    io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                ))
            }),
            None => attempt.await,
        }
    }
}

#[async_trait]
impl Connect for Connector {
    async fn connect(&self, hostname: &str) -> Result<Arc<dyn SmtpConnection>, SmtpError> {
        let connection = self.open(hostname).await?;
        Ok(Arc::new(connection))
    }
}
