#![forbid(unsafe_code)]
//! Bulk e-mail verification over SMTP `RCPT TO`.
//!
//! Addresses are checked syntactically, their domain's MX hosts are dialled
//! through a per-host [`ConnectionPool`], and each probe reply becomes a
//! [`VerifyStatus`]. [`Pipeline`] runs a whole stream of addresses with a
//! global concurrency bound.

pub mod concurrency;
pub mod pipeline;
pub mod settings;
pub mod smtp;
pub mod validator;
pub mod verifier;

pub use concurrency::{CallableOnce, ConcurrencyQueue, SingleFlight};
pub use pipeline::{
    AddressRecord, AddressSink, EmailRecord, Pipeline, PipelineError, PipelineOptions,
    PipelineReport, Progress,
};
pub use settings::{HostSettings, HostsSettings, SettingsError};
pub use smtp::{
    Connect, ConnectionPool, Connector, Message, SmtpConnection, SmtpError, Socks5Dialer,
};
pub use validator::{EmailError, ValidationMode, is_valid_email, normalize_email, validate_email};
pub use verifier::{Verifier, VerifierBuilder, VerifyStatus};
