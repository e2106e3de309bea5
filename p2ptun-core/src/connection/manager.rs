use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_shutdown::ShutdownManager;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::channel::{ChannelReceiver, ChannelSender};
use crate::connection::{Connection, MuxConfig};
use crate::error::{Error, Result};
use crate::protocol::{Builder, Command, MuxPacket, CONNECTION_ID_SPACE, MAX_CONNECTION_ID};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    /// Opens connections with [`ConnectionManager::connect`].
    Client,
    /// Receives connections with [`ConnectionManager::accept`].
    Server,
}

type Completion = oneshot::Sender<io::Result<()>>;

#[derive(Default)]
struct SendQueue {
    frames: VecDeque<(Bytes, Completion)>,
    draining: bool,
}

/// Demultiplexes one channel into connections.
///
/// The handle is cheap to clone. When built with [`ConnectionManager::start`] the reader task
/// keeps the manager alive until the channel closes or [`ConnectionManager::close`] is called.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    role: Role,
    config: MuxConfig,
    channel: Box<dyn ChannelSender>,
    serial: AtomicU32,
    connections: DashMap<u32, Connection>,
    send_queue: Mutex<SendQueue>,
    accept_sender: Mutex<Option<flume::Sender<Connection>>>,
    accept_receiver: flume::Receiver<Connection>,
    shutdown_manager: ShutdownManager<()>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Build a manager over `sender`. Inbound messages must be fed to
    /// [`ConnectionManager::dispatch`] and the end of the channel reported with
    /// [`ConnectionManager::handle_channel_close`].
    pub fn new<S: ChannelSender>(sender: S, role: Role, config: MuxConfig) -> Result<Self> {
        config.check()?;
        let (accept_sender, accept_receiver) = flume::bounded(config.accept_backlog);
        let inner = ManagerInner {
            role,
            config,
            channel: Box::new(sender),
            serial: AtomicU32::new(1),
            connections: DashMap::new(),
            send_queue: Mutex::new(SendQueue::default()),
            accept_sender: Mutex::new(Some(accept_sender)),
            accept_receiver,
            shutdown_manager: ShutdownManager::new(),
            closed: AtomicBool::new(false),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Build a manager and spawn the task reading `receiver` into it.
    pub fn start<S, R>(sender: S, mut receiver: R, role: Role, config: MuxConfig) -> Result<Self>
    where
        S: ChannelSender,
        R: ChannelReceiver,
    {
        let manager = Self::new(sender, role, config)?;
        let inner = manager.inner.clone();
        let fut = manager.inner.shutdown_manager.wrap_cancel(async move {
            while let Some(buf) = receiver.recv().await {
                inner.dispatch(buf);
            }
            inner.handle_channel_close();
        });
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: channel reader is shutdown");
            }
        });
        Ok(manager)
    }

    /// Open a new connection. The OPEN frame is sent without waiting for the peer.
    pub fn connect(&self) -> Result<Connection> {
        if self.inner.role != Role::Client {
            return Err(Error::RoleViolation("connect on server side"));
        }
        if self.inner.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let connection = self.inner.register_next()?;
        if let Err(e) = self.inner.submit(Builder::open(connection.id())) {
            connection.teardown();
            self.inner.remove(&connection);
            return Err(e);
        }
        log::debug!("connection {} opened", connection.id());
        Ok(connection)
    }

    /// Next connection opened by the peer.
    pub async fn accept(&self) -> Result<Connection> {
        if self.inner.role != Role::Server {
            return Err(Error::RoleViolation("accept on client side"));
        }
        self.inner
            .accept_receiver
            .recv_async()
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// Handle one inbound channel message.
    pub fn dispatch(&self, buf: Bytes) {
        self.inner.dispatch(buf)
    }

    /// Close the channel and tear down every connection. The reader task calls this when the
    /// channel ends; later calls do nothing.
    pub fn handle_channel_close(&self) {
        self.inner.handle_channel_close()
    }

    pub fn close(&self) {
        self.inner.handle_channel_close();
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }
    /// Frames waiting for the channel to drop under its high-water mark.
    pub fn queued_frames(&self) -> usize {
        self.inner.send_queue.lock().frames.len()
    }
    pub fn role(&self) -> Role {
        self.inner.role
    }
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.inner.shutdown_manager.wait_shutdown_triggered().await;
    }
}

impl ManagerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn register_next(self: &Arc<Self>) -> Result<Connection> {
        for _ in 0..CONNECTION_ID_SPACE {
            let id = self.serial.fetch_add(1, Ordering::Relaxed) & MAX_CONNECTION_ID;
            if let Entry::Vacant(entry) = self.connections.entry(id) {
                let connection = Connection::new(id, Arc::downgrade(self));
                entry.insert(connection.clone());
                return Ok(connection);
            }
        }
        Err(Error::IdExhausted(CONNECTION_ID_SPACE))
    }

    fn accept_connection(self: &Arc<Self>, id: u32) {
        let connection = match self.connections.entry(id) {
            Entry::Occupied(_) => {
                log::debug!("open for live connection {id}, ignored");
                return;
            }
            Entry::Vacant(entry) => {
                let connection = Connection::new(id, Arc::downgrade(self));
                entry.insert(connection.clone());
                connection
            }
        };
        let rs = match self.accept_sender.lock().as_ref() {
            Some(sender) => sender.try_send(connection.clone()).map_err(|e| e.to_string()),
            None => Err("acceptor is gone".to_string()),
        };
        match rs {
            Ok(()) => log::debug!("connection {id} accepted"),
            Err(e) => {
                log::warn!("reject connection {id}: {e}");
                connection.close();
            }
        }
    }

    pub(crate) fn dispatch(self: &Arc<Self>, buf: Bytes) {
        if self.is_closed() {
            return;
        }
        let packet = match MuxPacket::new(buf) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("drop frame: {e}");
                return;
            }
        };
        let id = packet.connection_id();
        match packet.command() {
            Command::Open => {
                if self.role == Role::Server {
                    self.accept_connection(id);
                } else {
                    log::debug!("open for {id} on client side, ignored");
                }
            }
            Command::Close => match self.connections.remove(&id) {
                Some((_, connection)) => connection.handle_close(),
                None => log::trace!("close for unknown connection {id}"),
            },
            Command::Data => {
                let connection = self.connections.get(&id).map(|entry| entry.value().clone());
                match connection {
                    Some(connection) => connection.deliver(packet.into_payload()),
                    None => log::debug!("data for unknown connection {id}, dropped"),
                }
            }
            Command::Unknown => {
                log::debug!("unknown command {}, dropped", packet.buffer()[0]);
            }
        }
    }

    pub(crate) fn handle_channel_close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        _ = self.shutdown_manager.trigger_shutdown(());
        self.channel.close();
        let frames = {
            let mut queue = self.send_queue.lock();
            queue.draining = false;
            std::mem::take(&mut queue.frames)
        };
        // waiting senders see their completion dropped
        drop(frames);
        self.accept_sender.lock().take();
        let connections: Vec<Connection> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.connections.clear();
        for connection in &connections {
            connection.handle_close();
        }
        log::info!(
            "channel closed, {} connection(s) torn down",
            connections.len()
        );
    }

    pub(crate) fn remove(&self, connection: &Connection) {
        self.connections
            .remove_if(&connection.id(), |_, live| live.ptr_eq(connection));
    }

    /// Write `frame` to the channel, or queue it behind earlier frames while the channel is
    /// over its high-water mark. A queued frame returns the receiver of its write result.
    pub(crate) fn submit(
        self: &Arc<Self>,
        frame: Bytes,
    ) -> Result<Option<oneshot::Receiver<io::Result<()>>>> {
        let mut queue = self.send_queue.lock();
        // teardown flips `closed` before it empties the queue under this lock
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        if queue.frames.is_empty() && self.channel.buffered_amount() <= self.config.high_water_mark
        {
            self.channel.send(frame)?;
            return Ok(None);
        }
        let (sender, receiver) = oneshot::channel();
        queue.frames.push_back((frame, sender));
        if !queue.draining {
            queue.draining = true;
            drop(queue);
            self.start_drain();
        }
        Ok(Some(receiver))
    }

    fn start_drain(self: &Arc<Self>) {
        log::debug!(
            "channel buffered amount over {}, queueing frames",
            self.config.high_water_mark
        );
        let fut = self
            .shutdown_manager
            .wrap_cancel(drain_loop(Arc::downgrade(self), self.config.drain_interval));
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: drain task is shutdown");
            }
        });
    }

    /// Returns false once the queue is empty.
    fn drain_once(&self) -> bool {
        let mut queue = self.send_queue.lock();
        while self.channel.buffered_amount() <= self.config.high_water_mark {
            let Some((frame, completion)) = queue.frames.pop_front() else {
                break;
            };
            let rs = self.channel.send(frame);
            // nobody waits on CLOSE frames or nowait sends
            if let Err(Err(e)) = completion.send(rs) {
                log::debug!("queued frame: {e:?}");
            }
        }
        if queue.frames.is_empty() {
            queue.draining = false;
            log::debug!("send queue drained");
            return false;
        }
        true
    }
}

async fn drain_loop(inner: Weak<ManagerInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.drain_once() {
            return;
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        _ = self.shutdown_manager.trigger_shutdown(());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::{ConnectionManager, Role};
    use crate::channel::memory;
    use crate::channel::ChannelSender;
    use crate::connection::MuxConfig;
    use crate::error::Error;
    use crate::protocol::{Builder, MAX_CONNECTION_ID};

    #[derive(Clone, Default)]
    struct RecordingChannel {
        frames: Arc<Mutex<Vec<Bytes>>>,
        buffered: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
    }

    impl RecordingChannel {
        fn set_buffered(&self, amount: usize) {
            self.buffered.store(amount, Ordering::Release);
        }
        fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().clone()
        }
    }

    impl ChannelSender for RecordingChannel {
        fn send(&self, buf: Bytes) -> io::Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::from(io::ErrorKind::NotConnected));
            }
            self.frames.lock().push(buf);
            Ok(())
        }
        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::Acquire)
        }
        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    fn recording(role: Role, config: MuxConfig) -> (ConnectionManager, RecordingChannel) {
        let channel = RecordingChannel::default();
        let manager = ConnectionManager::new(channel.clone(), role, config).unwrap();
        (manager, channel)
    }

    #[test]
    fn connect_sends_open() {
        let (manager, channel) = recording(Role::Client, MuxConfig::default());
        let connection = manager.connect().unwrap();
        assert_eq!(connection.id(), 1);
        assert_eq!(&channel.frames()[0][..], &[0, 0, 0, 1]);
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test]
    async fn role_violations() {
        let (server, _) = recording(Role::Server, MuxConfig::default());
        assert!(matches!(server.connect(), Err(Error::RoleViolation(_))));
        let (client, _) = recording(Role::Client, MuxConfig::default());
        assert!(matches!(
            client.accept().await,
            Err(Error::RoleViolation(_))
        ));
    }

    #[tokio::test]
    async fn end_to_end_over_memory_pair() {
        _ = env_logger::builder().is_test(true).try_init();
        let ((client_tx, client_rx), (server_tx, server_rx)) = memory::pair();
        let client =
            ConnectionManager::start(client_tx, client_rx, Role::Client, MuxConfig::default())
                .unwrap();
        let server =
            ConnectionManager::start(server_tx, server_rx, Role::Server, MuxConfig::default())
                .unwrap();

        let outbound = client.connect().unwrap();
        assert_eq!(outbound.id(), 1);
        let inbound = server.accept().await.unwrap();
        assert_eq!(inbound.id(), 1);

        outbound.send(b"ping").await.unwrap();
        assert_eq!(inbound.read().await.unwrap(), Bytes::from_static(b"ping"));
        inbound.send_str("pong").await.unwrap();
        assert_eq!(outbound.read().await.unwrap(), Bytes::from_static(b"pong"));

        outbound.close();
        assert!(matches!(inbound.read().await, Err(Error::ConnectionClosed)));
        assert_eq!(client.connection_count(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn queued_data_survives_peer_close() {
        let ((client_tx, client_rx), (server_tx, server_rx)) = memory::pair();
        let client =
            ConnectionManager::start(client_tx, client_rx, Role::Client, MuxConfig::default())
                .unwrap();
        let server =
            ConnectionManager::start(server_tx, server_rx, Role::Server, MuxConfig::default())
                .unwrap();
        let outbound = client.connect().unwrap();
        outbound.send(b"a").await.unwrap();
        outbound.send(b"b").await.unwrap();
        outbound.close();
        let inbound = server.accept().await.unwrap();
        assert_eq!(inbound.read().await.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(inbound.read().await.unwrap(), Bytes::from_static(b"b"));
        assert!(matches!(inbound.read().await, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn malformed_and_unknown_frames_are_dropped() {
        let (manager, channel) = recording(Role::Client, MuxConfig::default());
        manager.dispatch(Bytes::from_static(&[2, 0]));
        manager.dispatch(Bytes::from_static(&[9, 0, 0, 1, 1]));
        manager.dispatch(Builder::data(42, b"lost"));
        manager.dispatch(Builder::close(42));
        // client side ignores OPEN
        manager.dispatch(Builder::open(5));
        assert_eq!(manager.connection_count(), 0);
        assert!(channel.frames().is_empty());
    }

    #[tokio::test]
    async fn duplicate_open_is_ignored() {
        let (manager, _) = recording(Role::Server, MuxConfig::default());
        manager.dispatch(Builder::open(5));
        manager.dispatch(Builder::data(5, b"x"));
        manager.dispatch(Builder::open(5));
        assert_eq!(manager.connection_count(), 1);
        let connection = manager.accept().await.unwrap();
        assert_eq!(connection.id(), 5);
        assert_eq!(connection.read().await.unwrap(), Bytes::from_static(b"x"));
        assert!(manager.inner.accept_receiver.is_empty());
    }

    #[tokio::test]
    async fn reopened_id_is_a_new_connection() {
        let (manager, _) = recording(Role::Server, MuxConfig::default());
        manager.dispatch(Builder::open(5));
        let first = manager.accept().await.unwrap();
        manager.dispatch(Builder::close(5));
        assert!(first.is_closed());
        manager.dispatch(Builder::open(5));
        let second = manager.accept().await.unwrap();
        assert!(!second.is_closed());
        assert!(!second.ptr_eq(&first));
    }

    #[tokio::test]
    async fn full_backlog_rejects_with_close() {
        let config = MuxConfig::default().set_accept_backlog(1);
        let (manager, channel) = recording(Role::Server, config);
        manager.dispatch(Builder::open(1));
        manager.dispatch(Builder::open(2));
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(&channel.frames()[0][..], &Builder::close(2)[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn backpressure_keeps_fifo_across_connections() {
        let config = MuxConfig::default().set_high_water_mark(10);
        let (manager, channel) = recording(Role::Client, config);
        let first = manager.connect().unwrap();
        let second = manager.connect().unwrap();

        channel.set_buffered(100);
        first.send_nowait(b"a").unwrap();
        second.send_nowait(b"b").unwrap();
        first.send_nowait(b"c").unwrap();
        assert_eq!(manager.queued_frames(), 3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.frames().len(), 2);

        channel.set_buffered(0);
        // queue not empty yet, so this one lines up behind the others
        second.send_nowait(b"d").unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.queued_frames(), 0);
        let expected = vec![
            Builder::open(1),
            Builder::open(2),
            Builder::data(1, b"a"),
            Builder::data(2, b"b"),
            Builder::data(1, b"c"),
            Builder::data(2, b"d"),
        ];
        assert_eq!(channel.frames(), expected);

        first.send_nowait(b"e").unwrap();
        assert_eq!(manager.queued_frames(), 0);
        assert_eq!(channel.frames().len(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn send_waits_for_drain() {
        let config = MuxConfig::default().set_high_water_mark(10);
        let (manager, channel) = recording(Role::Client, config);
        let connection = manager.connect().unwrap();
        channel.set_buffered(11);
        let sending = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send(b"x").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sending.is_finished());
        channel.set_buffered(10);
        sending.await.unwrap().unwrap();
        assert_eq!(channel.frames().last().unwrap(), &Builder::data(1, b"x"));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_close_fails_queued_sends() {
        let config = MuxConfig::default().set_high_water_mark(0);
        let (manager, channel) = recording(Role::Client, config);
        let connection = manager.connect().unwrap();
        channel.set_buffered(1);
        let sending = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send(b"x").await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.handle_channel_close();
        assert!(matches!(sending.await.unwrap(), Err(Error::ChannelClosed)));
        assert_eq!(manager.queued_frames(), 0);
        assert!(connection.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sends_racing_channel_close_all_resolve() {
        for _ in 0..200 {
            let config = MuxConfig::default().set_high_water_mark(0);
            let (manager, channel) = recording(Role::Client, config);
            channel.set_buffered(1);
            let connections: Vec<_> = (0..4).map(|_| manager.connect().unwrap()).collect();
            let senders: Vec<_> = connections
                .into_iter()
                .map(|connection| tokio::spawn(async move { connection.send(b"x").await }))
                .collect();
            let closer = tokio::spawn({
                let manager = manager.clone();
                async move { manager.handle_channel_close() }
            });
            for sender in senders {
                let rs = tokio::time::timeout(Duration::from_secs(5), sender)
                    .await
                    .unwrap()
                    .unwrap();
                assert!(rs.is_err());
            }
            closer.await.unwrap();
            assert_eq!(manager.queued_frames(), 0);
        }
    }

    #[tokio::test]
    async fn channel_close_tears_everything_down() {
        let ((client_tx, client_rx), (server_tx, server_rx)) = memory::pair();
        let client =
            ConnectionManager::start(client_tx, client_rx, Role::Client, MuxConfig::default())
                .unwrap();
        let server =
            ConnectionManager::start(server_tx, server_rx, Role::Server, MuxConfig::default())
                .unwrap();
        let outbound = client.connect().unwrap();
        let inbound = server.accept().await.unwrap();
        let reader = tokio::spawn({
            let inbound = inbound.clone();
            async move { inbound.read().await }
        });

        client.close();
        assert!(matches!(reader.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(outbound.is_closed());
        assert!(matches!(server.accept().await, Err(Error::ChannelClosed)));
        assert!(matches!(client.connect(), Err(Error::ChannelClosed)));
        assert_eq!(server.connection_count(), 0);
        assert!(server.is_closed());
    }

    #[test]
    fn id_wrap_skips_live_ids() {
        let (manager, _) = recording(Role::Client, MuxConfig::default());
        manager
            .inner
            .serial
            .store(MAX_CONNECTION_ID - 1, Ordering::Relaxed);
        let a = manager.connect().unwrap();
        let b = manager.connect().unwrap();
        let c = manager.connect().unwrap();
        assert_eq!(
            (a.id(), b.id(), c.id()),
            (MAX_CONNECTION_ID - 1, MAX_CONNECTION_ID, 0)
        );
        b.close();
        manager
            .inner
            .serial
            .store(MAX_CONNECTION_ID - 1, Ordering::Relaxed);
        assert_eq!(manager.connect().unwrap().id(), MAX_CONNECTION_ID);
        assert_eq!(manager.connect().unwrap().id(), 1);
    }

    #[test]
    fn concurrent_connects_get_unique_ids() {
        let (manager, _) = recording(Role::Client, MuxConfig::default());
        let ids = Mutex::new(HashSet::new());
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        let id = manager.connect().unwrap().id();
                        assert!(ids.lock().insert(id));
                    }
                });
            }
        });
        assert_eq!(ids.lock().len(), 1600);
        assert_eq!(manager.connection_count(), 1600);
    }
}
