use std::fmt;

/// The commands a probing session needs. No DATA, no AUTH, no STARTTLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo { hostname: String },
    MailFrom { from: String },
    RcptTo { to: String },
    Rset,
    Quit,
}

impl Command {
    /// Bytes sent on the wire, CRLF included.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = self.to_string().into_bytes();
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo { hostname } => write!(f, "HELO {hostname}"),
            Self::MailFrom { from } => write!(f, "MAIL FROM:<{from}>"),
            Self::RcptTo { to } => write!(f, "RCPT TO:<{to}>"),
            Self::Rset => f.write_str("RSET"),
            Self::Quit => f.write_str("QUIT"),
        }
    }
}
