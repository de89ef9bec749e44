use std::{
    net::SocketAddr,
    ops::DerefMut,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    counters,
    error::{ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

use super::tls::TlsConfig;
#[cfg(feature = "rustls-tls")]
use super::tls::tls_connect;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// A TCP byte stream to one server, optionally wrapped in TLS. All reads and writes go through
/// the owning [`Connection`](crate::cmap::conn::Connection)'s deadline helpers; the stream itself
/// is deadline-free.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    #[cfg(feature = "rustls-tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Drop for AsyncStream {
    fn drop(&mut self) {
        counters::decr(&counters::STREAMS_ACTIVE);
        counters::incr(&counters::STREAMS_DISPOSED);
    }
}

async fn try_connect(address: &SocketAddr, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = runtime::timeout(connect_timeout, TcpStream::connect(address)).await??;
    stream.set_nodelay(true)?;

    // tokio doesn't expose keepalive configuration, so round-trip through socket2.
    let socket = socket2::Socket::from(stream.into_std()?);
    let conf = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    socket.set_tcp_keepalive(&conf)?;
    let std_stream = std::net::TcpStream::from(socket);
    let stream = TcpStream::from_std(std_stream)?;

    Ok(stream)
}

async fn tcp_connect(address: &ServerAddress, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let timeout = match connect_timeout {
        Some(d) if !d.is_zero() => d,
        _ => DEFAULT_CONNECT_TIMEOUT,
    };

    let mut socket_addrs: Vec<_> = tokio::net::lookup_host((address.host(), address.port()))
        .await?
        .collect();

    if socket_addrs.is_empty() {
        return Err(ErrorKind::Io(std::sync::Arc::new(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("failed to resolve any addresses for {}", address),
        )))
        .into());
    }

    // Try each of the resolved addresses in sequence, preferring IPv4, as the other drivers do.
    socket_addrs.sort_by_key(|addr| if addr.is_ipv4() { 0 } else { 1 });

    let mut connect_error = None;

    for socket_addr in &socket_addrs {
        match try_connect(socket_addr, timeout).await {
            Ok(stream) => return Ok(stream),
            Err(err) => connect_error = Some(err),
        }
    }

    Err(connect_error.unwrap_or_else(|| {
        ErrorKind::Internal {
            message: format!("connecting to {} produced neither stream nor error", address),
        }
        .into()
    }))
}

impl AsyncStream {
    /// Creates a new stream connected to `address`, performing the TLS handshake when a TLS
    /// configuration is supplied.
    pub(crate) async fn connect(
        address: &ServerAddress,
        connect_timeout: Option<Duration>,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let inner = tcp_connect(address, connect_timeout).await?;

        counters::incr(&counters::STREAMS_ACTIVE);

        #[cfg(feature = "rustls-tls")]
        if let Some(cfg) = tls_config {
            let session = tls_connect(address.host(), inner, cfg).await?;
            return Ok(Self::Tls(Box::new(session)));
        }

        #[cfg(not(feature = "rustls-tls"))]
        let _ = tls_config;

        Ok(Self::Tcp(inner))
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.deref_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_shutdown(cx),
        }
    }
}
