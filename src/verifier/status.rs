use std::fmt;
use std::str::FromStr;

#[cfg(feature = "with-serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of verifying one address.
#[cfg_attr(
    feature = "with-serde",
    derive(Serialize, Deserialize),
    serde(rename_all = "snake_case")
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VerifyStatus {
    /// Nothing is known (an unexpected failure). Never stored over a real status.
    #[default]
    Unknown,
    Invalid,
    NoMxRecords,
    #[cfg_attr(feature = "with-serde", serde(rename = "smtp_user_exists"))]
    SmtpVerified,
    SmtpUserNotFound,
    SmtpCheckImpossible,
    SmtpRetryLater,
    SmtpUnexpectedReply,
}

const ALL: [VerifyStatus; 8] = [
    VerifyStatus::Unknown,
    VerifyStatus::Invalid,
    VerifyStatus::NoMxRecords,
    VerifyStatus::SmtpVerified,
    VerifyStatus::SmtpUserNotFound,
    VerifyStatus::SmtpCheckImpossible,
    VerifyStatus::SmtpRetryLater,
    VerifyStatus::SmtpUnexpectedReply,
];

impl VerifyStatus {
    pub fn all() -> &'static [VerifyStatus] {
        &ALL
    }

    /// Stable code, as stored and printed.
    pub fn code(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Invalid => "invalid",
            Self::NoMxRecords => "no_mx_records",
            Self::SmtpVerified => "smtp_user_exists",
            Self::SmtpUserNotFound => "smtp_user_not_found",
            Self::SmtpCheckImpossible => "smtp_check_impossible",
            Self::SmtpRetryLater => "smtp_retry_later",
            Self::SmtpUnexpectedReply => "smtp_unexpected_reply",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Unknown => "No data",
            Self::Invalid => "Email address is invalid",
            Self::NoMxRecords => "Email domain has no MX records",
            Self::SmtpVerified => "Email account exists",
            Self::SmtpUserNotFound => "Email account not found",
            Self::SmtpCheckImpossible => {
                "Not possible to check email using SMTP RCPT TO reply. \
                 Usually this means that server accepts any email, sent by RCPT TO"
            }
            Self::SmtpRetryLater => {
                "Too many SMTP messages or connections from IP address \
                 or IP address is banned by server"
            }
            Self::SmtpUnexpectedReply => {
                "Server reply has unexpected reply code. Verify this address again \
                 with debug logging to see the server reply"
            }
        }
    }

    pub fn is_unknown(self) -> bool {
        self == Self::Unknown
    }
}

impl fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a valid verify status")]
pub struct UnknownStatus(pub String);

impl FromStr for VerifyStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL.iter()
            .copied()
            .find(|status| status.code() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_parse_back() {
        for status in VerifyStatus::all() {
            assert_eq!(status.code().parse::<VerifyStatus>(), Ok(*status));
            assert!(!status.description().is_empty());
        }
    }

    #[test]
    fn verified_uses_the_stored_code() {
        assert_eq!(VerifyStatus::SmtpVerified.to_string(), "smtp_user_exists");
    }

    #[test]
    fn rejects_unknown_codes() {
        let err = "smtp_verified".parse::<VerifyStatus>().unwrap_err();
        assert_eq!(err.to_string(), "'smtp_verified' is not a valid verify status");
    }

    #[test]
    fn default_is_unknown() {
        assert!(VerifyStatus::default().is_unknown());
        assert!(!VerifyStatus::Invalid.is_unknown());
    }

    #[cfg(feature = "with-serde")]
    #[test]
    fn serializes_as_code() {
        let json = serde_json::to_string(&VerifyStatus::SmtpVerified).unwrap();
        assert_eq!(json, "\"smtp_user_exists\"");
        let back: VerifyStatus = serde_json::from_str("\"smtp_retry_later\"").unwrap();
        assert_eq!(back, VerifyStatus::SmtpRetryLater);
    }
}
