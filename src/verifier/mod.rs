//! Turns an address into a [`VerifyStatus`] using pooled SMTP connections.
//!
//! Every expected SMTP failure is folded into a status. The one exception is
//! a dead SOCKS proxy: [`Verifier::verify`] returns it as an error so a whole
//! batch stops instead of being misclassified.

mod status;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::settings::HostsSettings;
use crate::smtp::{
    CODE_OK, Connect, ConnectionPool, Connector, DEFAULT_CONNECT_TIMEOUT, Dial, DirectDialer,
    MxLookup, Socks5Dialer, SmtpError, system_resolver,
};
use crate::validator::{ValidationMode, normalize_email};

pub use status::{UnknownStatus, VerifyStatus};

#[derive(Clone)]
pub struct Verifier {
    connector: Arc<dyn Connect>,
}

impl fmt::Debug for Verifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Verifier").finish_non_exhaustive()
    }
}

impl Verifier {
    /// Verify through `connector`, normally a [`ConnectionPool`].
    pub fn new(connector: Arc<dyn Connect>) -> Self {
        Self { connector }
    }

    pub fn builder() -> VerifierBuilder {
        VerifierBuilder::default()
    }

    /// Status of `address`. Only a proxy failure is returned as `Err`.
    pub async fn verify(&self, address: &str) -> Result<VerifyStatus, SmtpError> {
        debug!(address, "verifying");
        let email = match normalize_email(address, ValidationMode::Strict) {
            Ok(email) if email.valid => email,
            _ => {
                info!(address, "address is invalid");
                return Ok(VerifyStatus::Invalid);
            }
        };

        match self.probe(&email.ascii_domain, &email.wire_address()).await {
            Ok(status) => Ok(status),
            Err(err) => handle_failure(address, err),
        }
    }

    async fn probe(&self, hostname: &str, address: &str) -> Result<VerifyStatus, SmtpError> {
        let connection = self.connector.connect(hostname).await?;
        if !connection.is_reliable().await? {
            info!(address, "cannot verify, unreliable server");
            return Ok(VerifyStatus::SmtpCheckImpossible);
        }

        let reply = connection.send_verify_recipient(address).await?;
        if reply.code() == CODE_OK {
            info!(address, "verified");
            Ok(VerifyStatus::SmtpVerified)
        } else {
            info!(address, code = reply.code(), "not verified");
            Ok(VerifyStatus::SmtpUserNotFound)
        }
    }
}

fn handle_failure(address: &str, err: SmtpError) -> Result<VerifyStatus, SmtpError> {
    if err.is_proxy_failure() {
        error!(address, error = %err, "proxy failure, aborting");
        return Err(err);
    }

    let (status, outcome) = match &err {
        SmtpError::AuthenticationRequired(_) => (
            VerifyStatus::SmtpCheckImpossible,
            "cannot verify (authentication required)",
        ),
        SmtpError::OverQuota(_) => (VerifyStatus::SmtpRetryLater, "over quota while verifying"),
        SmtpError::SenderBlocked(_) => (
            VerifyStatus::SmtpRetryLater,
            "sender blocked while verifying",
        ),
        SmtpError::ConnectionClosed { .. } => (
            VerifyStatus::SmtpRetryLater,
            "connection closed while verifying",
        ),
        SmtpError::TooManyRecipients(_) => (
            VerifyStatus::SmtpRetryLater,
            "too many recipients while verifying",
        ),
        SmtpError::NoMxRecords { .. } => (VerifyStatus::NoMxRecords, "no MX records"),
        SmtpError::UnexpectedReply { .. } => (
            VerifyStatus::SmtpUnexpectedReply,
            "unexpected reply while verifying",
        ),
        _ => {
            error!(address, error = %err, "error while verifying");
            return Ok(VerifyStatus::Unknown);
        }
    };
    info!(address, status = %status, "{outcome}");
    debug!(address, error = %err, "verification failure");
    Ok(status)
}

/// Wires resolver, dialer, settings and pool into a [`Verifier`].
pub struct VerifierBuilder {
    settings: HostsSettings,
    proxy: Option<String>,
    connect_timeout: Option<Duration>,
    resolver: Option<Arc<dyn MxLookup>>,
    dialer: Option<Arc<dyn Dial>>,
}

impl Default for VerifierBuilder {
    fn default() -> Self {
        Self {
            settings: HostsSettings::default(),
            proxy: None,
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            resolver: None,
            dialer: None,
        }
    }
}

impl VerifierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(mut self, settings: HostsSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Dial every MX host through the SOCKS5 proxy at `host:port`. Ignored
    /// when a dialer is set explicitly.
    pub fn with_socks_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// `None` (or zero) waits as long as the OS does.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// MX lookup to use instead of the system resolver.
    pub fn with_resolver(mut self, resolver: Arc<dyn MxLookup>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dial>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn build(self) -> Result<Verifier, SmtpError> {
        let resolver: Arc<dyn MxLookup> = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(system_resolver()?),
        };
        let dialer: Arc<dyn Dial> = match (self.dialer, self.proxy) {
            (Some(dialer), _) => dialer,
            (None, Some(proxy)) => Arc::new(Socks5Dialer::new(proxy)),
            (None, None) => Arc::new(DirectDialer),
        };
        debug!(dialer = ?dialer, "building verifier");

        let settings = Arc::new(self.settings);
        let connector = Connector::new(resolver, dialer, Arc::clone(&settings))
            .with_connect_timeout(self.connect_timeout);
        let pool = ConnectionPool::new(Arc::new(connector), settings);
        Ok(Verifier::new(Arc::new(pool)))
    }
}

#[cfg(test)]
mod tests;
