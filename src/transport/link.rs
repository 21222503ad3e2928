//! Physical link to the presence gateway
//!
//! Newline-delimited JSON over TCP or a Unix socket. One link is opened per
//! device by the shared connection; nothing else touches it.

use crate::error::{PresenceError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

/// Default Unix socket path for a local gateway.
pub fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("readmark.sock")
}

/// Strip a single trailing slash from a gateway URL.
pub fn normalize_url(url: &str) -> String {
    url.trim().strip_suffix('/').unwrap_or(url.trim()).to_string()
}

/// Where the gateway lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse `tcp://host:port`, `host:port` or `unix:/path/to.sock`.
    pub fn parse(url: &str) -> Result<Self> {
        let url = normalize_url(url);
        if let Some(path) = url.strip_prefix("unix://").or_else(|| url.strip_prefix("unix:")) {
            if path.is_empty() {
                return Err(PresenceError::InvalidEndpoint(url));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let addr = url.strip_prefix("tcp://").unwrap_or(&url);
        let Some((host, port)) = addr.rsplit_once(':') else {
            return Err(PresenceError::InvalidEndpoint(url));
        };
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(PresenceError::InvalidEndpoint(url));
        }
        Ok(Self::Tcp(addr.to_string()))
    }

    /// Open a stream to the endpoint.
    pub async fn connect(&self) -> Result<Box<dyn LinkStream>> {
        match self {
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Self::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr.to_string())
    }
}

/// Byte stream a link runs over
pub trait LinkStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkStream for T {}
