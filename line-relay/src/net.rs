//! TCP front door of the broker: one listener for the server, one for the
//! clients.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::connection::{Endpoint, ServerEndpoint};

pub struct Listeners {
    server: TcpListener,
    clients: TcpListener,
}

impl Listeners {
    pub async fn bind(server: SocketAddr, clients: SocketAddr) -> Result<Self> {
        let server = TcpListener::bind(server)
            .await
            .with_context(|| format!("failed to bind server listener on {server}"))?;
        let clients = TcpListener::bind(clients)
            .await
            .with_context(|| format!("failed to bind client listener on {clients}"))?;

        let listeners = Self { server, clients };
        info!("server listener bound on {}", listeners.server_addr()?);
        info!("client listener bound on {}", listeners.client_addr()?);
        Ok(listeners)
    }

    pub fn server_addr(&self) -> std::io::Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn client_addr(&self) -> std::io::Result<SocketAddr> {
        self.clients.local_addr()
    }

    /// Waits for the server to connect. With `replies` set, the server's
    /// outbound direction is read for responses.
    pub async fn accept_server(&self, replies: bool) -> Result<ServerEndpoint> {
        let (stream, peer) = self
            .server
            .accept()
            .await
            .context("failed to accept server connection")?;
        info!(%peer, "server connected");

        let endpoint = endpoint(stream)?;
        Ok(if replies {
            ServerEndpoint::with_replies(endpoint)
        } else {
            ServerEndpoint::send_only(endpoint.writer)
        })
    }

    /// Waits for `count` clients, in connection order. A client's position
    /// here is its origin index.
    pub async fn accept_clients(&self, count: usize) -> Result<Vec<Endpoint>> {
        let mut clients = Vec::with_capacity(count);
        while clients.len() < count {
            let (stream, peer) = self
                .clients
                .accept()
                .await
                .context("failed to accept client connection")?;
            info!(%peer, session = clients.len(), "client connected");
            clients.push(endpoint(stream)?);
        }
        Ok(clients)
    }
}

fn endpoint(stream: TcpStream) -> Result<Endpoint> {
    stream
        .set_nodelay(true)
        .context("failed to configure connection")?;
    Ok(Endpoint::from_stream(stream))
}
