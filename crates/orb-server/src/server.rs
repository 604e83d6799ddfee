use std::future::Future;
use std::net::SocketAddr;

use orb_rpc::Connection;
use orb_types::Value;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerResult;

/// Accepts connections and serves one fixed root object on each.
pub struct ObjectServer {
    config: ServerConfig,
    exported: Value,
    listener: TcpListener,
    connections: Vec<Connection>,
}

impl ObjectServer {
    /// Bind the configured address.
    pub async fn bind(config: ServerConfig, exported: Value) -> ServerResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(addr = %listener.local_addr()?, "orb server listening");
        Ok(Self {
            config,
            exported,
            listener,
            connections: Vec::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Address actually bound (useful when the configured port is 0).
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Connections still alive.
    pub fn connection_count(&mut self) -> usize {
        self.connections.retain(Connection::is_alive);
        self.connections.len()
    }

    /// Accept connections indefinitely.
    pub async fn serve(self) -> ServerResult<()> {
        self.serve_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes, then close every open
    /// connection.
    pub async fn serve_until<F>(mut self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.admit(stream, peer),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
        info!(open = self.connections.len(), "orb server shutting down");
        for conn in self.connections.drain(..) {
            conn.close();
        }
        Ok(())
    }

    fn admit(&mut self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        if self.connection_count() >= self.config.max_connections {
            warn!(%peer, max = self.config.max_connections, "connection limit reached, closing");
            return;
        }
        let opened = stream
            .into_std()
            .and_then(|s| {
                s.set_nonblocking(false)?;
                Ok(s)
            })
            .map_err(Into::into)
            .and_then(|s| Connection::accept(s, self.exported.clone()));
        match opened {
            Ok(conn) => {
                debug!(%peer, "accepted");
                self.connections.push(conn);
            }
            Err(e) => warn!(%peer, error = %e, "could not start connection"),
        }
    }
}
