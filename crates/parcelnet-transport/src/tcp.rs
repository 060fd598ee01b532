use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::NetStream;

/// TCP listening endpoint.
///
/// Provides bind/accept/connect. Socket options beyond `TCP_NODELAY` are
/// left to the operating system defaults.
pub struct TcpEndpoint {
    listener: TcpListener,
    addr: SocketAddr,
}

impl TcpEndpoint {
    /// Bind and listen on `addr`. Port 0 picks an ephemeral port.
    pub fn bind(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        let label = format!("{addr:?}");
        let listener = TcpListener::bind(&addr).map_err(|e| TransportError::Bind {
            addr: label.clone(),
            source: e,
        })?;
        let addr = listener.local_addr().map_err(|e| TransportError::Bind {
            addr: label,
            source: e,
        })?;

        info!(%addr, "listening on tcp endpoint");
        Ok(Self { listener, addr })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<NetStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        NetStream::from_tcp(stream)
    }

    /// Connect to a listening endpoint (blocking).
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<NetStream> {
        let stream = TcpStream::connect(&addr).map_err(|e| TransportError::Connect {
            addr: format!("{addr:?}"),
            source: e,
        })?;
        debug!(?addr, "connected to tcp endpoint");
        NetStream::from_tcp(stream)
    }

    /// Connect with an upper bound on the TCP handshake duration.
    pub fn connect_timeout(
        addr: impl ToSocketAddrs + std::fmt::Debug,
        timeout: Duration,
    ) -> Result<NetStream> {
        let label = format!("{addr:?}");
        let resolved = addr
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect {
                addr: label.clone(),
                source: e,
            })?
            .next()
            .ok_or_else(|| TransportError::Unresolved(label.clone()))?;

        let stream = TcpStream::connect_timeout(&resolved, timeout).map_err(|e| {
            TransportError::Connect {
                addr: label,
                source: e,
            }
        })?;
        debug!(addr = %resolved, "connected to tcp endpoint");
        NetStream::from_tcp(stream)
    }

    /// The address this endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }
}
