//! TCP transport for device sessions.
//!
//! The worker talks to a boxed [`DeviceStream`] obtained from a [`Connector`], so
//! tests can hand it an in-memory duplex pipe instead of a real socket.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::SessionError;

/// Byte stream to one appliance
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

/// Opens streams to an appliance endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `addr`, giving up after `timeout`
    async fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceStream>, SessionError>;
}

/// Plain TCP connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceStream>, SessionError> {
        let stream = connect_tcp(addr, timeout).await?;
        Ok(Box::new(stream))
    }
}

/// Connect to a TCP address with a deadline
pub async fn connect_tcp(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, SessionError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| SessionError::Timeout("connect"))??;
    stream.set_nodelay(true)?;
    debug!("Connected to {}", addr);
    Ok(stream)
}
