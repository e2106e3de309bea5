//! TCP forwarding over a [`ConnectionManager`].
//!
//! The client side turns every accepted local TCP stream into a new connection; the server side
//! turns every accepted connection into a TCP stream to one fixed destination.

use std::net::SocketAddr;

use p2ptun_core::ConnectionManager;
use tokio::net::{TcpListener, TcpStream};

use crate::bridge::pass_through;
use crate::config::BridgeConfig;
use crate::error::Result;

/// Accept local TCP streams and bridge each one through [`ConnectionManager::connect`].
/// Returns `Ok` once the channel is closed.
pub async fn serve_client(
    listener: TcpListener,
    manager: ConnectionManager,
    config: BridgeConfig,
) -> Result<()> {
    config.check()?;
    loop {
        let (stream, addr) = tokio::select! {
            rs = listener.accept() => rs?,
            _ = manager.closed() => return Ok(()),
        };
        let connection = match manager.connect() {
            Ok(connection) => connection,
            Err(e) if e.is_closed() => {
                log::info!("channel closed, stop accepting tcp");
                return Ok(());
            }
            Err(e) => {
                log::warn!("tcp {addr}: {e}");
                continue;
            }
        };
        log::info!("tcp {addr} -> connection {}", connection.id());
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("set_nodelay {e:?}");
        }
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = pass_through(connection, stream, &config).await {
                log::debug!("tcp {addr}: {e}");
            }
        });
    }
}

/// Accept connections from the peer and bridge each one to `destination`.
/// Returns `Ok` once the channel is closed.
pub async fn serve_server(
    manager: ConnectionManager,
    destination: SocketAddr,
    config: BridgeConfig,
) -> Result<()> {
    config.check()?;
    loop {
        let connection = match manager.accept().await {
            Ok(connection) => connection,
            Err(e) if e.is_closed() => {
                log::info!("channel closed, stop accepting connections");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let config = config.clone();
        tokio::spawn(async move {
            let id = connection.id();
            let stream = match TcpStream::connect(destination).await {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("connection {id}: connect {destination}: {e}");
                    connection.close();
                    return;
                }
            };
            log::info!("connection {id} -> tcp {destination}");
            if let Err(e) = stream.set_nodelay(true) {
                log::warn!("set_nodelay {e:?}");
            }
            if let Err(e) = pass_through(connection, stream, &config).await {
                log::debug!("connection {id}: {e}");
            }
        });
    }
}
