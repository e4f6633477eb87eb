use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use super::error::SmtpError;

pub const CODE_SERVICE_READY: u16 = 220;
pub const CODE_CLOSING: u16 = 221;
pub const CODE_OK: u16 = 250;
pub const CODE_ADDRESS_INACTIVE: u16 = 540;
pub const CODE_ACTION_NOT_TAKEN: u16 = 550;

const CODE_LENGTH: usize = 3;
const CONTINUATION_MARKER: u8 = b'-';

fn pattern(source: &str) -> Regex {
    Regex::new(source).expect("static reply pattern compiles")
}

static OVER_QUOTA: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)\b(over quota|OverQuotaTemp|too many concurrent|try again later)\b")
});
static SENDER_BLOCKED: LazyLock<Regex> = LazyLock::new(|| {
    pattern(
        r"(?i)\b(spamhaus|blocked|abuseat|refused|not allowed|black ?listed|not permitted)\b",
    )
});
static SENDER_VERIFY_FAILED: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\bsender verify failed\b"));
static LOGIN_NEEDED: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b(unknown user account|should log in)\b"));
static TOO_MANY_RECIPIENTS: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\btoo many recipients\b"));
static ABOUT_TO_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)\b(not accepting network messages|timeout)\b"));

/// What a reply says about the session, beyond its code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Ok,
    SenderBlocked,
    AuthNeeded,
    OverQuota,
    TooManyRecipients,
    AboutToClose,
}

/// One logical SMTP reply, continuation lines already merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    code: u16,
    text: String,
    raw: String,
    state: ReplyState,
    closing: bool,
}

impl Message {
    /// Parse `<3-digit code>[ |-]<text>`.
    pub fn parse(raw: &str) -> Result<Self, SmtpError> {
        let code = raw
            .get(..CODE_LENGTH)
            .filter(|digits| digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u16>().ok())
            .ok_or_else(|| SmtpError::MalformedReply {
                line: raw.to_string(),
            })?;
        let text = raw.get(CODE_LENGTH + 1..).unwrap_or_default().to_string();
        let closing = is_about_to_close(code, raw);
        Ok(Self {
            code,
            text,
            raw: raw.to_string(),
            state: classify(code, raw, closing),
            closing,
        })
    }

    /// Reply handed out for hosts that accept every recipient.
    pub(crate) fn accepted() -> Self {
        Self {
            code: CODE_OK,
            text: "accepted without verification".to_string(),
            raw: "250 accepted without verification".to_string(),
            state: ReplyState::Ok,
            closing: false,
        }
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn is_ok(&self) -> bool {
        self.code == CODE_OK
    }

    /// The server is going away, whatever else the reply says.
    pub fn is_about_to_close(&self) -> bool {
        self.closing
    }

    /// Error matching the classification, `None` for [`ReplyState::Ok`].
    pub fn failure(&self) -> Option<SmtpError> {
        let error = match self.state {
            ReplyState::Ok => return None,
            ReplyState::SenderBlocked => SmtpError::SenderBlocked(self.clone()),
            ReplyState::AuthNeeded => SmtpError::AuthenticationRequired(self.clone()),
            ReplyState::OverQuota => SmtpError::OverQuota(self.clone()),
            ReplyState::TooManyRecipients => SmtpError::TooManyRecipients(self.clone()),
            ReplyState::AboutToClose => {
                SmtpError::closed(format!("server reply: {}", self.raw))
            }
        };
        Some(error)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// Sender-blocked and auth-needed win outright; otherwise the last matching
// flag among over-quota, too-many-recipients and about-to-close is kept.
fn classify(code: u16, raw: &str, closing: bool) -> ReplyState {
    let mut state = ReplyState::Ok;
    if code >= 400 && OVER_QUOTA.is_match(raw) {
        state = ReplyState::OverQuota;
    }
    if code >= 400 && SENDER_BLOCKED.is_match(raw) {
        return ReplyState::SenderBlocked;
    }
    if is_auth_needed(code, raw) {
        return ReplyState::AuthNeeded;
    }
    if code >= 400 && TOO_MANY_RECIPIENTS.is_match(raw) {
        state = ReplyState::TooManyRecipients;
    }
    if closing {
        state = ReplyState::AboutToClose;
    }
    state
}

fn is_auth_needed(code: u16, raw: &str) -> bool {
    if code < 400 {
        return false;
    }
    if SENDER_VERIFY_FAILED.is_match(raw) {
        return true;
    }
    code < 500 && LOGIN_NEEDED.is_match(raw)
}

fn is_about_to_close(code: u16, raw: &str) -> bool {
    code == CODE_CLOSING || (code >= 400 && ABOUT_TO_CLOSE.is_match(raw))
}

/// Turns raw socket bytes into complete replies.
///
/// Partial lines are buffered until `\r\n` arrives. Continuation lines
/// (`250-...`) are folded into the final line of the reply: the result keeps
/// the final line's code and separator, followed by each continuation text
/// terminated by `\n`, followed by the final line's own text.
#[derive(Debug, Default)]
pub(crate) struct ReplyAssembler {
    buffer: Vec<u8>,
    continuation: Vec<u8>,
}

impl ReplyAssembler {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut replies = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|pair| pair == b"\r\n") {
            let mut line: Vec<u8> = self.buffer.drain(..end + 2).collect();
            line.truncate(end);

            let head = line.len().min(CODE_LENGTH + 1);
            if line.get(CODE_LENGTH) == Some(&CONTINUATION_MARKER) {
                self.continuation.extend_from_slice(&line[head..]);
                self.continuation.push(b'\n');
                continue;
            }

            let mut reply = Vec::with_capacity(line.len() + self.continuation.len());
            reply.extend_from_slice(&line[..head]);
            reply.append(&mut self.continuation);
            reply.extend_from_slice(&line[head..]);
            replies.push(String::from_utf8_lossy(&reply).into_owned());
        }
        replies
    }
}
