use async_trait::async_trait;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};

use crate::verifier::VerifyStatus;

use super::error::BoxError;

/// An item flowing through the pipeline: an address plus whatever the caller
/// keeps next to it.
pub trait AddressRecord: Send + 'static {
    fn address(&self) -> &str;

    /// Record the verification outcome. Called with every status, including
    /// [`VerifyStatus::Unknown`], which must not replace a known one.
    fn apply_status(&mut self, status: VerifyStatus);
}

/// Plain address with its last known status.
#[cfg_attr(feature = "with-serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailRecord {
    pub address: String,
    pub status: VerifyStatus,
}

impl EmailRecord {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            status: VerifyStatus::Unknown,
        }
    }
}

impl AddressRecord for EmailRecord {
    fn address(&self) -> &str {
        &self.address
    }

    fn apply_status(&mut self, status: VerifyStatus) {
        if !status.is_unknown() {
            self.status = status;
        }
    }
}

/// Destination of verified records.
#[async_trait]
pub trait AddressSink<R: Send + 'static>: Send {
    async fn write(&mut self, record: R, status: VerifyStatus) -> Result<(), BoxError>;

    /// Resolve once everything written so far is durable.
    async fn flush(&mut self) -> Result<(), BoxError>;

    async fn close(&mut self) -> Result<(), BoxError> {
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_never_overwrites_a_status() {
        let mut record = EmailRecord::new("alice@example.com");
        record.apply_status(VerifyStatus::SmtpVerified);
        record.apply_status(VerifyStatus::Unknown);
        assert_eq!(record.status, VerifyStatus::SmtpVerified);

        record.apply_status(VerifyStatus::SmtpRetryLater);
        assert_eq!(record.status, VerifyStatus::SmtpRetryLater);
    }
}
