use std::time::Duration;

use crate::settings::error::SettingsError;
use crate::validator::is_valid_email;

/// Name of the entry every unknown hostname falls back to.
pub const DEFAULT_HOSTNAME: &str = "default";

const DEFAULT_RANDOM_USER: &str = "mo4rahpheix8ti7ohT0eoku0oisien6ohKaenuutareiCei3ad9Ibedoogh6quie";

/// Per-domain SMTP policy.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSettings {
    pub hostname: String,
    /// Upper bound on live pooled connections for the host.
    pub max_connections: usize,
    /// Consecutive reconnects allowed before a pooled connection gives up (0 = no limit).
    pub max_reconnects: u32,
    /// Send `RSET`/`HELO`/`MAIL FROM` again after every N verifications (0 = never).
    pub reset_after: u32,
    /// `QUIT` and reopen after N verifications (0 = never).
    pub close_after: u32,
    /// Close an idle pooled connection after this long (zero disables).
    pub inactive_timeout: Duration,
    /// Local part that should never exist, used for the catch-all probe.
    pub random_user: String,
    pub from_email: String,
    pub from_host: String,
    /// Never connect; every address of the host is reported as unverifiable.
    pub unreliable: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            max_connections: 1,
            max_reconnects: 10,
            reset_after: 1,
            close_after: 0,
            inactive_timeout: Duration::from_secs(10),
            random_user: DEFAULT_RANDOM_USER.to_string(),
            from_email: "test@example.com".to_string(),
            from_host: "localhost".to_string(),
            unreliable: false,
        }
    }
}

impl HostSettings {
    /// Copy of `base` that applies to `hostname`.
    pub fn inherit(hostname: &str, base: &HostSettings) -> Self {
        Self {
            hostname: hostname.to_lowercase(),
            ..base.clone()
        }
    }

    pub fn is_default(&self) -> bool {
        self.hostname == DEFAULT_HOSTNAME
    }

    /// Return the inactivity timeout, `None` when disabled.
    pub fn inactivity(&self) -> Option<Duration> {
        if self.inactive_timeout.is_zero() {
            None
        } else {
            Some(self.inactive_timeout)
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SettingsError> {
        if self.max_connections == 0 {
            return Err(SettingsError::invalid(
                &self.hostname,
                "maxConnections must be at least 1",
            ));
        }
        if self.random_user.trim().is_empty() {
            return Err(SettingsError::invalid(&self.hostname, "randomUser is empty"));
        }
        if self.from_host.trim().is_empty() {
            return Err(SettingsError::invalid(&self.hostname, "fromHost is empty"));
        }
        if !is_valid_email(&self.from_email) {
            return Err(SettingsError::invalid(
                &self.hostname,
                format!("invalid fromEmail {}", self.from_email),
            ));
        }
        Ok(())
    }
}
