//! A WebSocket-fronted router server.
//!
//! Binds a TCP listener, performs the WebSocket handshake per connection,
//! and runs one responder endpoint per connection over a shared
//! [`RouterCore`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, error, info};

use weft::server::Responder;
use weft::transport::ws::WsTransport;
use weft::Status;

use crate::core::{RouterConfig, RouterCore};
use crate::service::router_contract;

/// Knobs of a [`RouterServer`].
#[derive(Clone, Debug)]
pub struct RouterServerConfig {
    pub host: String,
    pub port: u16,
    pub router: RouterConfig,
}

impl Default for RouterServerConfig {
    fn default() -> Self {
        RouterServerConfig {
            host: "127.0.0.1".to_string(),
            port: 7400,
            router: RouterConfig::default(),
        }
    }
}

/// Accepts WebSocket connections and serves the `router` contract on each.
pub struct RouterServer {
    core: Arc<RouterCore>,
    config: RouterServerConfig,
}

impl RouterServer {
    pub fn new(config: RouterServerConfig) -> Self {
        let core = Arc::new(RouterCore::new(config.router.clone()));
        RouterServer { core, config }
    }

    /// The shared core, for embedding or inspection.
    pub fn core(&self) -> Arc<RouterCore> {
        self.core.clone()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn serve(self) -> Result<(), Status> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&address).await?;
        self.serve_on(listener).await
    }

    /// Serve on an already-bound listener (useful with an ephemeral port).
    pub async fn serve_on(self, listener: TcpListener) -> Result<(), Status> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "router listening");

        let _monitor = self.core.spawn_monitor();

        loop {
            let (socket, peer) = listener.accept().await?;
            debug!(%peer, "accepted router connection");
            tokio::spawn(handle_connection(self.core.clone(), socket, peer));
        }
    }
}

async fn handle_connection(core: Arc<RouterCore>, socket: tokio::net::TcpStream, peer: SocketAddr) {
    let transport = match WsTransport::accept_io(socket).await {
        Ok(transport) => transport,
        Err(status) => {
            debug!(%peer, "websocket handshake failed: {}", status);
            return;
        }
    };

    match Responder::new(Arc::new(transport)).add_service(router_contract(core)) {
        Ok(responder) => responder.serve().await,
        Err(status) => error!("failed to build router endpoint: {}", status),
    }

    debug!(%peer, "router connection closed");
}
