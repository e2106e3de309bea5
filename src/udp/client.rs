use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use p2ptun_core::channel::{ChannelReceiver, ChannelSender};
use p2ptun_core::TimeoutCache;
use tokio::net::UdpSocket;

use crate::config::UdpBridgeConfig;
use crate::error::Result;
use crate::protocol::{random_session_id, Builder, SessionPacket};
use crate::udp::bind_udp;

/// Local half of the UDP bridge.
///
/// Datagrams arriving on the local port are framed with the session id of their source
/// address; frames from the channel go back to whichever address owns their session id.
/// Dropping the bridge closes the channel.
pub struct UdpClientBridge {
    shared: Arc<ClientShared>,
}

struct ClientShared {
    sockets: Vec<Arc<UdpSocket>>,
    // (socket index, peer address) -> session id
    sessions: TimeoutCache<(usize, SocketAddr), u32>,
    channel: Box<dyn ChannelSender>,
    shutdown_manager: ShutdownManager<()>,
    recv_buffer_size: usize,
}

impl UdpClientBridge {
    /// Bind `port` on IPv4 (and IPv6 when enabled) and start relaying.
    pub fn start<S, R>(
        sender: S,
        mut receiver: R,
        port: u16,
        config: UdpBridgeConfig,
    ) -> Result<Self>
    where
        S: ChannelSender,
        R: ChannelReceiver,
    {
        config.check()?;
        let v4 = bind_udp(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)), true)?;
        let port = v4.local_addr()?.port();
        let mut sockets = vec![Arc::new(v4)];
        if config.use_v6 {
            let v6 = bind_udp(SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)), true)?;
            sockets.push(Arc::new(v6));
        }
        let shared = Arc::new(ClientShared {
            sockets,
            sessions: TimeoutCache::with_reverse(config.sweep_interval),
            channel: Box::new(sender),
            shutdown_manager: ShutdownManager::new(),
            recv_buffer_size: config.recv_buffer_size,
        });
        for index in 0..shared.sockets.len() {
            let fut = shared
                .shutdown_manager
                .wrap_cancel(recv_loop(shared.clone(), index));
            tokio::spawn(async move {
                match fut.await {
                    Ok(Err(e)) => log::warn!("udp socket {index}: {e:?}"),
                    Ok(Ok(())) => {}
                    Err(_) => log::debug!("recv shutdown signal: udp socket {index} is shutdown"),
                }
            });
        }
        let reader = shared.clone();
        let fut = shared.shutdown_manager.wrap_cancel(async move {
            while let Some(buf) = receiver.recv().await {
                reader.dispatch(&buf).await;
            }
            reader.handle_channel_close();
        });
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: udp channel reader is shutdown");
            }
        });
        log::info!("udp client listening on port {port}");
        Ok(Self { shared })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.shared
            .sockets
            .iter()
            .filter_map(|socket| socket.local_addr().ok())
            .collect()
    }
    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }
    /// Handle one frame from the channel, waiting for the local socket to accept the reply.
    pub async fn dispatch(&self, buf: &[u8]) {
        self.shared.dispatch(buf).await
    }
    pub fn handle_channel_close(&self) {
        self.shared.handle_channel_close()
    }
    pub fn close(&self) {
        self.shared.channel.close();
        self.shared.handle_channel_close();
    }
}

impl Drop for UdpClientBridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientShared {
    fn session_id(&self, index: usize, addr: SocketAddr) -> u32 {
        let key = (index, addr);
        if let Some(id) = self.sessions.get(&key, true) {
            return id;
        }
        let mut id = random_session_id();
        while self.sessions.has_value(&id) {
            id = random_session_id();
        }
        self.sessions.set(key, id);
        log::debug!("udp session {id:#x} for {addr}");
        id
    }

    async fn dispatch(&self, buf: &[u8]) {
        let packet = match SessionPacket::new(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("drop udp frame: {e}");
                return;
            }
        };
        let id = packet.session_id();
        let Some((index, addr)) = self.sessions.get_key(&id, true) else {
            log::debug!("udp session {id:#x} unknown, dropped");
            return;
        };
        if let Err(e) = self.sockets[index].send_to(packet.payload(), addr).await {
            log::debug!("udp session {id:#x} send to {addr}: {e:?}");
        }
    }

    fn handle_channel_close(&self) {
        if self.shutdown_manager.is_shutdown_triggered() {
            return;
        }
        _ = self.shutdown_manager.trigger_shutdown(());
        let count = self.sessions.len();
        self.sessions.terminate();
        log::info!("udp client stopped, {count} session(s) dropped");
    }
}

async fn recv_loop(shared: Arc<ClientShared>, index: usize) -> io::Result<()> {
    let socket = shared.sockets[index].clone();
    let mut buf = vec![0u8; shared.recv_buffer_size];
    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;
        let id = shared.session_id(index, addr);
        if let Err(e) = shared.channel.send(Builder::build(id, &buf[..len])) {
            log::debug!("udp {addr}: channel send {e:?}");
        }
    }
}
