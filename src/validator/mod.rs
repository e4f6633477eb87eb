//! Syntactic address checks used before any network I/O.

mod domain;
mod local;
mod types;

pub use types::{EmailError, NormalizedEmail, ValidationMode, ValidationReport};

use domain::{check_domain, normalize_domain};
use local::{is_local_relaxed, is_local_strict};

const MAX_ADDRESS_LEN: usize = 254;
const MAX_LOCAL_LEN: usize = 64;

/// Check `email` and list every reason it is not a usable recipient.
///
/// Fails outright only for input that cannot be an address at all: an empty
/// string or one spanning several lines.
pub fn validate_email(email: &str, mode: ValidationMode) -> Result<ValidationReport, EmailError> {
    let input = email.trim();
    if input.is_empty() {
        return Err(EmailError::Empty);
    }
    if input.contains(['\r', '\n']) {
        return Err(EmailError::LineBreak);
    }

    let mut reasons = Vec::new();
    if input.len() > MAX_ADDRESS_LEN {
        reasons.push(format!("total length {} > {MAX_ADDRESS_LEN}", input.len()));
    }
    let Some((local, domain)) = split_address(input) else {
        reasons.push("must contain exactly one '@'".to_string());
        return Ok(ValidationReport::from_reasons(reasons));
    };

    if local.len() > MAX_LOCAL_LEN {
        reasons.push(format!("local part length {} > {MAX_LOCAL_LEN}", local.len()));
    }
    let local_ok = match mode {
        ValidationMode::Strict => is_local_strict(local),
        ValidationMode::Relaxed => is_local_relaxed(local),
    };
    if !local_ok {
        reasons.push(format!("invalid local part ({mode} rules)"));
    }
    check_domain(domain, &mut reasons);

    Ok(ValidationReport::from_reasons(reasons))
}

/// Validate `email` and return the forms the SMTP exchange needs (domain
/// lower-cased and in ASCII).
pub fn normalize_email(email: &str, mode: ValidationMode) -> Result<NormalizedEmail, EmailError> {
    let ValidationReport { ok, reasons } = validate_email(email, mode)?;
    let input = email.trim();
    // split invalid addresses too, keeping whatever parts are usable
    let (local, domain) = input.rsplit_once('@').unwrap_or((input, ""));
    let (domain, ascii_domain) = normalize_domain(domain);

    Ok(NormalizedEmail {
        original: email.to_string(),
        local: local.to_string(),
        domain,
        ascii_domain,
        mode,
        valid: ok,
        reasons,
    })
}

/// Strict check, the gate in front of every `RCPT TO`.
pub fn is_valid_email(email: &str) -> bool {
    validate_email(email, ValidationMode::Strict).is_ok_and(|report| report.ok)
}

fn split_address(input: &str) -> Option<(&str, &str)> {
    match input.split_once('@') {
        Some((local, domain)) if !domain.contains('@') => Some((local, domain)),
        _ => None,
    }
}
