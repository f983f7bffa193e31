/// portero - a protocol-aware proxy that presents a Redis/Valkey Cluster
/// as a single logical server
///
/// Clients speak plain RESP against one address; portero routes each
/// command to the shard owning its hash slot, follows MOVED/ASK
/// redirections, splits multi-key commands across shards and recoalesces
/// the replies, and pools backend connections behind the scenes.
pub mod cluster;
pub mod config;
pub mod error;
pub mod proxy;
pub mod resp;
pub mod utils;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::PorteroResult;
use crate::proxy::session::Session;
use crate::proxy::ProxyContext;

/// TCP front-end: accepts clients and hands each one to a session
pub struct ProxyServer {
    addr: String,
    ctx: Arc<ProxyContext>,
}

impl ProxyServer {
    pub fn new(addr: String, ctx: Arc<ProxyContext>) -> Self {
        Self { addr, ctx }
    }

    /// Accept loop; returns only on listen failure
    pub async fn run(&self) -> PorteroResult<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("proxy listens on {}", self.addr);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("accept client: {}", peer);
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(Session::run(stream, ctx));
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }
}
