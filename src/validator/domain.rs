const MAX_DOMAIN_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Checks the domain in its IDNA (ASCII) form and pushes every problem found
/// into `reasons`.
pub(crate) fn check_domain(domain: &str, reasons: &mut Vec<String>) {
    let Ok(ascii) = idna::domain_to_ascii(domain) else {
        reasons.push("domain punycode conversion failed".to_string());
        return;
    };
    if ascii.is_empty() {
        reasons.push("domain is empty".to_string());
        return;
    }
    if ascii.len() > MAX_DOMAIN_LEN {
        reasons.push(format!("domain length {} > {MAX_DOMAIN_LEN}", ascii.len()));
    }
    // MX lookups need a registrable name
    if !ascii.contains('.') {
        reasons.push("domain must contain at least one dot".to_string());
    }
    reasons.extend(ascii.split('.').filter_map(label_problem));
}

fn label_problem(label: &str) -> Option<String> {
    if label.is_empty() {
        Some("empty domain label".to_string())
    } else if label.len() > MAX_LABEL_LEN {
        Some(format!("domain label '{label}' longer than {MAX_LABEL_LEN}"))
    } else if label.starts_with('-') || label.ends_with('-') {
        Some(format!("domain label '{label}' starts or ends with '-'"))
    } else if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        Some(format!("domain label '{label}' has invalid chars"))
    } else {
        None
    }
}

/// Returns `(lowercase, ascii)` forms of `domain`. The ASCII form is empty
/// when IDNA conversion fails.
pub(crate) fn normalize_domain(domain: &str) -> (String, String) {
    let lower = domain.trim().trim_end_matches('.').to_lowercase();
    let ascii = idna::domain_to_ascii(&lower).unwrap_or_default();
    (lower, ascii)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problems(domain: &str) -> Vec<String> {
        let mut reasons = Vec::new();
        check_domain(domain, &mut reasons);
        reasons
    }

    #[test]
    fn mail_domains_pass() {
        for domain in ["example.com", "mx-1.mail.example.org", "bücher.de"] {
            assert!(problems(domain).is_empty(), "{domain}: {:?}", problems(domain));
        }
    }

    #[test]
    fn long_label_is_reported() {
        let reasons = problems(&format!("{}.com", "a".repeat(64)));
        assert!(reasons.iter().any(|r| r.contains("longer than 63")), "{reasons:?}");
    }

    #[test]
    fn bare_hostname_is_rejected() {
        assert!(
            problems("localhost")
                .iter()
                .any(|r| r.contains("at least one dot"))
        );
    }

    #[test]
    fn hyphen_edges_and_empty_labels() {
        assert!(!problems("-mx.example.com").is_empty());
        assert!(!problems("mx..example.com").is_empty());
    }

    #[test]
    fn normalize_lowercases_and_punycodes() {
        let (lower, ascii) = normalize_domain("ExÄmple.COM.");
        assert_eq!(lower, "exämple.com");
        assert!(ascii.starts_with("xn--"), "{ascii}");
        assert!(ascii.ends_with(".com"), "{ascii}");
    }
}
