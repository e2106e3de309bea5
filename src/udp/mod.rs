//! UDP flows over a channel.
//!
//! The client half listens on a local port and gives every remote address a random 31-bit
//! session id; the server half owns one outbound socket per session id, talking to a fixed
//! destination. Both halves forget idle sessions through a [`p2ptun_core::TimeoutCache`].

use std::net::SocketAddr;

use anyhow::Context;
use socket2::Protocol;
use tokio::net::UdpSocket;

mod client;
mod server;

pub use client::UdpClientBridge;
pub use server::UdpServerBridge;

pub(crate) fn bind_udp(addr: SocketAddr, only_v6: bool) -> anyhow::Result<UdpSocket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket
            .set_only_v6(only_v6)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
        socket
    };
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind udp {addr}"))?;
    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use p2ptun_core::channel::memory;
    use tokio::net::UdpSocket;

    use super::{UdpClientBridge, UdpServerBridge};
    use crate::config::UdpBridgeConfig;

    #[tokio::test]
    async fn datagram_round_trip_through_tunnel() {
        let destination = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let destination_addr = destination.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            while let Ok((len, from)) = destination.recv_from(&mut buf).await {
                let mut reply = b"pong:".to_vec();
                reply.extend_from_slice(&buf[..len]);
                _ = destination.send_to(&reply, from).await;
            }
        });

        let ((client_tx, client_rx), (server_tx, server_rx)) = memory::pair();
        let config = UdpBridgeConfig::default().set_use_v6(false);
        let client = UdpClientBridge::start(client_tx, client_rx, 0, config.clone()).unwrap();
        let _server =
            UdpServerBridge::start(server_tx, server_rx, destination_addr, config).unwrap();
        let port = client.local_addrs()[0].port();
        let entry = SocketAddr::from(([127, 0, 0, 1], port));

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"ping", entry).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"pong:ping");
        assert_eq!(from.port(), port);
        assert_eq!(client.session_count(), 1);
    }
}
