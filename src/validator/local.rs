/// RFC 5322 `atext` characters allowed besides ASCII alphanumerics.
const ATEXT_SPECIALS: &str = "!#$%&'*+-/=?^_`{|}~";

fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric() || ATEXT_SPECIALS.contains(c)
}

/// Dot-atom: non-empty atoms separated by single dots.
pub(crate) fn is_local_strict(local: &str) -> bool {
    !local.is_empty()
        && local
            .split('.')
            .all(|atom| !atom.is_empty() && atom.chars().all(is_atext))
}

/// Also accepts a quoted string, as long as it holds no CR or LF (either
/// would end the `RCPT TO` command).
pub(crate) fn is_local_relaxed(local: &str) -> bool {
    match local
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    {
        Some(quoted) => !quoted.contains(['\r', '\n']),
        None => is_local_strict(local),
    }
}
