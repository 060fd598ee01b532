use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use parcelnet_transport::TcpEndpoint;

use crate::codec::ObjectCodec;
use crate::connection::{Connection, ConnectionBuilder};
use crate::engine::Engine;
use crate::error::Result;
use crate::event::ConnectionListener;
use crate::file_agglom::SpaceProbe;
use crate::handshake::handshake_client;
use crate::params::ConnectionParameters;

/// Connects to a [`crate::Server`] and starts the resulting connection.
#[derive(Clone)]
pub struct Client {
    builder: ConnectionBuilder,
    connect_timeout: Option<Duration>,
}

impl Client {
    pub fn new(engine: &Engine) -> Self {
        Self {
            builder: ConnectionBuilder::new(engine),
            connect_timeout: None,
        }
    }

    /// The alive period is replaced by the one the server requests.
    pub fn with_parameters(mut self, params: ConnectionParameters) -> Self {
        self.builder = self.builder.with_parameters(params);
        self
    }

    pub fn with_codec(mut self, codec: impl ObjectCodec + 'static) -> Self {
        self.builder = self.builder.with_codec(codec);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.builder = self.builder.with_listener(listener);
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.builder = self.builder.with_space_probe(probe);
        self
    }

    /// Bound the TCP connect; the handshake is bounded separately.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn connect(&self, addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Connection> {
        let mut stream = match self.connect_timeout {
            Some(timeout) => TcpEndpoint::connect_timeout(addr, timeout)?,
            None => TcpEndpoint::connect(addr)?,
        };
        let handshake_timeout = self.builder.parameters().handshake_timeout;
        stream.set_read_timeout(Some(handshake_timeout))?;
        let accepted = match handshake_client(&mut stream, handshake_timeout) {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(peer = ?stream.peer_addr().ok(), error = %err, "handshake failed");
                if let Err(err) = stream.shutdown() {
                tracing::debug!(error = %err, "socket shutdown after failed handshake");
            }
                return Err(err);
            }
        };

        let mut builder = self.builder.clone();
        builder.parameters_mut().alive_period = accepted.alive_period;
        let conn = builder.build()?;
        conn.start(stream)?;
        Ok(conn)
    }
}
