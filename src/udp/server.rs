use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use bytes::Bytes;
use p2ptun_core::channel::{ChannelReceiver, ChannelSender};
use p2ptun_core::error::Error as CoreError;
use p2ptun_core::TimeoutCache;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::config::UdpBridgeConfig;
use crate::error::Result;
use crate::protocol::{Builder, SessionPacket};
use crate::udp::bind_udp;

/// Datagrams waiting for a session socket; later ones are dropped when it is full.
const SESSION_QUEUE_LEN: usize = 1024;

/// Remote half of the UDP bridge: one outbound socket per session id, all talking to
/// `destination`. Dropping the bridge closes the channel and every session socket.
pub struct UdpServerBridge {
    shared: Arc<ServerShared>,
}

struct ServerShared {
    destination: SocketAddr,
    sessions: TimeoutCache<u32, Arc<UdpSession>>,
    channel: Arc<dyn ChannelSender>,
    shutdown_manager: ShutdownManager<()>,
    recv_buffer_size: usize,
}

struct UdpSession {
    outbound: flume::Sender<Bytes>,
    handle: JoinHandle<()>,
}

impl UdpSession {
    fn close(&self) {
        self.handle.abort();
    }
}

impl Drop for UdpSession {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl UdpServerBridge {
    pub fn start<S, R>(
        sender: S,
        mut receiver: R,
        destination: SocketAddr,
        config: UdpBridgeConfig,
    ) -> Result<Self>
    where
        S: ChannelSender,
        R: ChannelReceiver,
    {
        config.check()?;
        let sessions = TimeoutCache::new(config.sweep_interval);
        sessions.set_on_delete(|id, session: Arc<UdpSession>| {
            log::debug!("udp session {id:#x} closed");
            session.close();
        });
        let shared = Arc::new(ServerShared {
            destination,
            sessions,
            channel: Arc::new(sender),
            shutdown_manager: ShutdownManager::new(),
            recv_buffer_size: config.recv_buffer_size,
        });
        let reader = shared.clone();
        let fut = shared.shutdown_manager.wrap_cancel(async move {
            while let Some(buf) = receiver.recv().await {
                reader.dispatch(&buf);
            }
            reader.handle_channel_close();
        });
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: udp channel reader is shutdown");
            }
        });
        log::info!("udp server relaying to {destination}");
        Ok(Self { shared })
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }
    /// Handle one frame from the channel.
    pub fn dispatch(&self, buf: &[u8]) {
        self.shared.dispatch(buf)
    }
    /// Close every session socket at once.
    pub fn handle_channel_close(&self) {
        self.shared.handle_channel_close()
    }
    pub fn close(&self) {
        self.shared.channel.close();
        self.shared.handle_channel_close();
    }
}

impl Drop for UdpServerBridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl ServerShared {
    fn dispatch(&self, buf: &[u8]) {
        let packet = match SessionPacket::new(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("drop udp frame: {e}");
                return;
            }
        };
        let id = packet.session_id();
        let session = match self.session(id) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("udp session {id:#x}: {e}");
                return;
            }
        };
        if let Err(e) = session
            .outbound
            .try_send(Bytes::copy_from_slice(packet.payload()))
        {
            log::debug!("udp session {id:#x}: datagram dropped, {e}");
        }
    }

    fn session(&self, id: u32) -> Result<Arc<UdpSession>> {
        if let Some(session) = self.sessions.get(&id, true) {
            return Ok(session);
        }
        if self.sessions.is_terminated() {
            return Err(CoreError::ChannelClosed.into());
        }
        let bind = if self.destination.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = bind_udp(bind, false)?;
        log::debug!("udp session {id:#x} created on {:?}", socket.local_addr());
        let (outbound, queued) = flume::bounded(SESSION_QUEUE_LEN);
        let handle = tokio::spawn(session_loop(
            socket,
            id,
            self.destination,
            queued,
            self.channel.clone(),
            self.recv_buffer_size,
        ));
        let session = Arc::new(UdpSession { outbound, handle });
        self.sessions.set(id, session.clone());
        Ok(session)
    }

    fn handle_channel_close(&self) {
        if self.shutdown_manager.is_shutdown_triggered() {
            return;
        }
        _ = self.shutdown_manager.trigger_shutdown(());
        let count = self.sessions.len();
        self.sessions.terminate();
        log::info!("udp server stopped, {count} session(s) closed");
    }
}

async fn session_loop(
    socket: UdpSocket,
    id: u32,
    destination: SocketAddr,
    queued: flume::Receiver<Bytes>,
    channel: Arc<dyn ChannelSender>,
    recv_buffer_size: usize,
) {
    let mut buf = vec![0u8; recv_buffer_size];
    loop {
        tokio::select! {
            rs = socket.recv_from(&mut buf) => {
                let (len, from) = match rs {
                    Ok(rs) => rs,
                    Err(e) => {
                        log::debug!("udp session {id:#x} recv: {e:?}");
                        return;
                    }
                };
                // only replies from the destination port belong to this session
                if from.port() != destination.port() {
                    log::trace!("udp session {id:#x}: datagram from {from} ignored");
                } else if let Err(e) = channel.send(Builder::build(id, &buf[..len])) {
                    log::debug!("udp session {id:#x}: channel send {e:?}");
                }
            }
            rs = queued.recv_async() => {
                let Ok(payload) = rs else {
                    return;
                };
                if let Err(e) = socket.send_to(&payload, destination).await {
                    log::debug!("udp session {id:#x} send to {destination}: {e:?}");
                }
            }
        }
    }
}
