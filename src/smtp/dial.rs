use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::error::SmtpError;

/// Byte stream to an SMTP server.
pub trait SmtpStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SmtpStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn SmtpStream>;

/// Opens the raw stream to `host:port`.
#[async_trait]
pub trait Dial: Send + Sync + fmt::Debug {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SmtpError>;
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait]
impl Dial for DirectDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream, SmtpError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|err| SmtpError::connect(format!("{host}:{port}"), err))?;
        stream
            .set_nodelay(true)
            .map_err(|err| SmtpError::connect(format!("{host}:{port}"), err))?;
        Ok(Box::new(stream))
    }
}
