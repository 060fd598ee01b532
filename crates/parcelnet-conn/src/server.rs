use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use parcelnet_transport::TcpEndpoint;

use crate::codec::ObjectCodec;
use crate::connection::{Connection, ConnectionBuilder};
use crate::engine::Engine;
use crate::error::Result;
use crate::event::ConnectionListener;
use crate::file_agglom::SpaceProbe;
use crate::handshake::{handshake_server, Verdict, REJECT_CAPACITY, REJECT_SHUTDOWN};
use crate::params::ConnectionParameters;

/// Accepts peers on a TCP endpoint and starts a connection for each.
pub struct Server {
    endpoint: TcpEndpoint,
    builder: ConnectionBuilder,
    max_connections: Option<usize>,
}

impl Server {
    /// Bind to `addr`. Port 0 picks an ephemeral port.
    pub fn bind(engine: &Engine, addr: impl ToSocketAddrs + std::fmt::Debug) -> Result<Self> {
        Ok(Self {
            endpoint: TcpEndpoint::bind(addr)?,
            builder: ConnectionBuilder::new(engine),
            max_connections: None,
        })
    }

    pub fn with_parameters(mut self, params: ConnectionParameters) -> Self {
        self.builder = self.builder.with_parameters(params);
        self
    }

    pub fn with_codec(mut self, codec: impl ObjectCodec + 'static) -> Self {
        self.builder = self.builder.with_codec(codec);
        self
    }

    /// Listener attached to every accepted connection.
    pub fn with_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.builder = self.builder.with_listener(listener);
        self
    }

    /// Reject peers while the engine already runs this many connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn with_space_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.builder = self.builder.with_space_probe(probe);
        self
    }

    /// Accept the next peer, run the handshake and start its connection.
    ///
    /// A peer turned away for capacity or shutdown is reported as
    /// [`crate::ConnError::Rejected`].
    pub fn accept(&self) -> Result<Connection> {
        let mut stream = self.endpoint.accept()?;
        let params = self.builder.parameters();
        let engine = self.builder.engine();

        let verdict = if engine.is_shut_down() {
            Verdict::Reject {
                cause: REJECT_SHUTDOWN,
            }
        } else if self
            .max_connections
            .is_some_and(|max| engine.connection_count() >= max)
        {
            Verdict::Reject {
                cause: REJECT_CAPACITY,
            }
        } else {
            Verdict::Accept {
                alive_period: params.alive_period,
            }
        };

        stream.set_read_timeout(Some(params.handshake_timeout))?;
        if let Err(err) = handshake_server(&mut stream, verdict, params.handshake_timeout) {
            tracing::warn!(peer = ?stream.peer_addr().ok(), error = %err, "handshake failed");
            if let Err(err) = stream.shutdown() {
                tracing::debug!(error = %err, "socket shutdown after failed handshake");
            }
            return Err(err);
        }

        let conn = self.builder.build()?;
        conn.start(stream)?;
        Ok(conn)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::client::Client;
    use crate::error::ConnError;

    fn quiet() -> ConnectionParameters {
        ConnectionParameters {
            alive_period: Duration::ZERO,
            confirm_timeout: Duration::from_secs(2),
            ..ConnectionParameters::default()
        }
    }

    #[test]
    fn accept_rejects_when_at_capacity() {
        let engine = Engine::start().unwrap();
        let server = Server::bind(&engine, "127.0.0.1:0")
            .unwrap()
            .with_parameters(quiet())
            .with_max_connections(1);
        let addr = server.local_addr();

        let accepting = thread::spawn(move || {
            let first = server.accept();
            let second = server.accept();
            (first.map(|c| c.id()), second.map(|c| c.id()))
        });

        let client_engine = Engine::start().unwrap();
        let client = Client::new(&client_engine).with_parameters(quiet());
        let kept = client.connect(addr).unwrap();
        let refused = client.connect(addr);
        assert!(matches!(refused, Err(ConnError::Rejected { cause: REJECT_CAPACITY })));

        let (first, second) = accepting.join().unwrap();
        assert!(first.is_ok());
        assert!(matches!(second, Err(ConnError::Rejected { cause: REJECT_CAPACITY })));

        kept.close();
        assert!(kept.wait_closed(Duration::from_secs(5)));
        engine.shutdown(Duration::from_secs(5));
        client_engine.shutdown(Duration::from_secs(5));
    }

    #[test]
    fn client_adopts_server_alive_period() {
        let engine = Engine::start().unwrap();
        let server = Server::bind(&engine, "127.0.0.1:0").unwrap().with_parameters(
            ConnectionParameters {
                alive_period: Duration::from_secs(7),
                ..quiet()
            },
        );
        let addr = server.local_addr();
        let accepting = thread::spawn(move || server.accept().unwrap());

        let client_engine = Engine::start().unwrap();
        let conn = Client::new(&client_engine)
            .with_parameters(quiet())
            .connect(addr)
            .unwrap();
        let accepted = accepting.join().unwrap();
        assert_eq!(conn.alive_period(), Duration::from_secs(7));
        assert_eq!(accepted.alive_period(), Duration::from_secs(7));
        assert_eq!(engine.connection_count(), 1);

        conn.close();
        assert!(accepted.wait_closed(Duration::from_secs(5)));
        assert!(conn.wait_closed(Duration::from_secs(5)));
        assert_eq!(engine.connection_count(), 0);
        engine.shutdown(Duration::from_secs(5));
        client_engine.shutdown(Duration::from_secs(5));
    }
}
