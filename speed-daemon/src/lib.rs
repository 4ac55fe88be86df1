//! Speed Daemon: average-speed road enforcement over a binary TCP
//! protocol. See the module docs on [`codec`], [`registry`] and
//! [`engine`] for the wire format, fan-out, and ticketing rule.

mod codec;
mod connection;
mod engine;
mod registry;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use engine::EngineHandle;
use registry::RegistryHandle;

pub async fn serve(address: SocketAddr, shutdown: CancellationToken) -> std::io::Result<()> {
    info!(%address, "starting");
    let listener = TcpListener::bind(address).await?;

    let registry = RegistryHandle::start();
    let engine = EngineHandle::start(registry.clone());

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        info!(client = %addr, "connection received");
                        let registry = registry.clone();
                        let engine = engine.clone();
                        tokio::spawn(connection::handle(stream, registry, engine));
                    }
                    Err(e) => {
                        error!(error = ?e, "accept failed");
                    }
                }
            }
        }
    }
}
