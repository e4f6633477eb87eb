//! SOCKS5 client (RFC 1928), no authentication, CONNECT by domain name.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::dial::{BoxedStream, Dial};
use super::error::SmtpError;

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const RESERVED: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;

/// Dials every MX host through a SOCKS5 proxy.
///
/// Failing to reach or talk to the proxy is reported as
/// [`SmtpError::ProxyConnect`]; the proxy refusing a particular target is an
/// ordinary [`SmtpError::Connect`].
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: String,
}

impl Socks5Dialer {
    /// `proxy` is `host:port`; a `socks5://` prefix is accepted.
    pub fn new(proxy: impl AsRef<str>) -> Self {
        let proxy = proxy.as_ref();
        let proxy = proxy
            .strip_prefix("socks5://")
            .or_else(|| proxy.strip_prefix("socks://"))
            .unwrap_or(proxy);
        Self {
            proxy: proxy.to_string(),
        }
    }

    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    fn proxy_error(&self, reason: impl Into<String>) -> SmtpError {
        SmtpError::proxy(self.proxy.clone(), reason)
    }
}

#[async_trait]
impl Dial for Socks5Dialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SmtpError> {
        let mut stream = TcpStream::connect(self.proxy.as_str())
            .await
            .map_err(|err| self.proxy_error(err.to_string()))?;
        debug!(proxy = %self.proxy, host, port, "SOCKS5 connect");
        match handshake(&mut stream, host, port).await {
            Ok(()) => Ok(Box::new(stream)),
            Err(Handshake::Proxy(err)) => Err(self.proxy_error(err.to_string())),
            Err(Handshake::Refused(code)) => Err(SmtpError::connect(
                format!("{host}:{port}"),
                io::Error::new(io::ErrorKind::ConnectionRefused, reply_reason(code)),
            )),
        }
    }
}

#[derive(Debug)]
enum Handshake {
    /// The proxy misbehaved or went away.
    Proxy(io::Error),
    /// The proxy answered but could not reach the target.
    Refused(u8),
}

impl From<io::Error> for Handshake {
    fn from(err: io::Error) -> Self {
        Self::Proxy(err)
    }
}

fn invalid(message: &str) -> Handshake {
    Handshake::Proxy(io::Error::new(io::ErrorKind::InvalidData, message.to_string()))
}

async fn handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<(), Handshake>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&[VERSION, 1, AUTH_NONE]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(invalid("invalid SOCKS version"));
    }
    if choice[1] != AUTH_NONE {
        return Err(invalid("proxy requires authentication"));
    }

    let name = host.as_bytes();
    let Ok(name_len) = u8::try_from(name.len()) else {
        return Err(Handshake::Refused(0x04));
    };
    let mut request = Vec::with_capacity(7 + name.len());
    request.extend_from_slice(&[VERSION, CMD_CONNECT, RESERVED, ATYP_DOMAIN, name_len]);
    request.extend_from_slice(name);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(invalid("invalid SOCKS version in reply"));
    }
    if head[1] != REPLY_SUCCESS {
        return Err(Handshake::Refused(head[1]));
    }

    let bound = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => usize::from(stream.read_u8().await?),
        _ => return Err(invalid("unsupported address type in reply")),
    };
    let mut skip = vec![0u8; bound + 2];
    stream.read_exact(&mut skip).await?;
    Ok(())
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown SOCKS failure",
    }
}
