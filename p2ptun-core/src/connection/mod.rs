//! Logical byte streams multiplexed over one channel.
//!
//! A [`Connection`] is a cheap handle; clones refer to the same stream. Inbound chunks are kept
//! in arrival order and handed to readers one chunk per [`Connection::read`]. Once closed, a
//! connection never reopens. A later OPEN for the same id is a new connection.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::Builder;

pub mod config;
mod manager;

pub use config::MuxConfig;
pub use manager::{ConnectionManager, Role};

use manager::ManagerInner;

#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    id: u32,
    manager: Weak<ManagerInner>,
    state: Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    closed: bool,
    // at most one of `pending` and `waiters` is non-empty
    pending: VecDeque<Bytes>,
    waiters: VecDeque<oneshot::Sender<Bytes>>,
}

impl Connection {
    pub(crate) fn new(id: u32, manager: Weak<ManagerInner>) -> Connection {
        Self {
            shared: Arc::new(ConnectionShared {
                id,
                manager,
                state: Mutex::new(ConnectionState::default()),
            }),
        }
    }
    pub fn id(&self) -> u32 {
        self.shared.id
    }
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
    pub(crate) fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Send one DATA frame.
    ///
    /// Returns once the frame is handed to the channel. While the channel is over its high-water
    /// mark that means waiting for the send queue to drain up to this frame.
    pub async fn send(&self, buf: &[u8]) -> Result<()> {
        let receiver = {
            let manager = self.manager()?;
            manager.submit(Builder::data(self.id(), buf))?
        };
        if let Some(receiver) = receiver {
            receiver.await.map_err(|_| Error::ChannelClosed)??;
        }
        Ok(())
    }
    /// Like [`Connection::send`] but does not wait for a queued frame to reach the channel.
    pub fn send_nowait(&self, buf: &[u8]) -> Result<()> {
        self.manager()?.submit(Builder::data(self.id(), buf))?;
        Ok(())
    }
    pub async fn send_str(&self, s: &str) -> Result<()> {
        self.send(s.as_bytes()).await
    }

    /// Next inbound chunk. Chunks queued before the close are still returned; after that
    /// every call fails with [`Error::ConnectionClosed`].
    pub async fn read(&self) -> Result<Bytes> {
        let receiver = {
            let mut state = self.shared.state.lock();
            if let Some(buf) = state.pending.pop_front() {
                return Ok(buf);
            }
            if state.closed {
                return Err(Error::ConnectionClosed);
            }
            state.waiters.retain(|waiter| !waiter.is_closed());
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };
        receiver.await.map_err(|_| Error::ConnectionClosed)
    }

    /// Send CLOSE to the peer and release the id. Calling it again does nothing.
    pub fn close(&self) {
        if !self.teardown() {
            return;
        }
        log::debug!("connection {} closed", self.id());
        if let Some(manager) = self.shared.manager.upgrade() {
            if let Err(e) = manager.submit(Builder::close(self.id())) {
                log::debug!("send close for connection {}: {e}", self.id());
            }
            manager.remove(self);
        }
    }

    /// The peer closed the connection or the channel went away.
    pub(crate) fn handle_close(&self) {
        if !self.teardown() {
            return;
        }
        log::debug!("connection {} closed by peer", self.id());
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.remove(self);
        }
    }

    pub(crate) fn deliver(&self, mut buf: Bytes) {
        let mut state = self.shared.state.lock();
        if state.closed {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(buf) {
                Ok(()) => return,
                // reader went away
                Err(returned) => buf = returned,
            }
        }
        state.pending.push_back(buf);
    }

    fn teardown(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        // dropping the senders fails every pending read
        state.waiters.clear();
        true
    }

    fn manager(&self) -> Result<Arc<ManagerInner>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        self.shared.manager.upgrade().ok_or(Error::ChannelClosed)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use bytes::Bytes;

    use super::Connection;
    use crate::error::Error;

    fn detached(id: u32) -> Connection {
        Connection::new(id, Weak::new())
    }

    #[tokio::test]
    async fn reads_preserve_order_and_boundaries() {
        let connection = detached(3);
        connection.deliver(Bytes::from_static(b"ab"));
        connection.deliver(Bytes::from_static(b"c"));
        assert_eq!(connection.read().await.unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(connection.read().await.unwrap(), Bytes::from_static(b"c"));
    }

    #[tokio::test]
    async fn waiting_readers_are_served_in_order() {
        let connection = detached(3);
        let first = tokio::spawn({
            let connection = connection.clone();
            async move { connection.read().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = tokio::spawn({
            let connection = connection.clone();
            async move { connection.read().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        connection.deliver(Bytes::from_static(b"1"));
        connection.deliver(Bytes::from_static(b"2"));
        assert_eq!(first.await.unwrap().unwrap(), Bytes::from_static(b"1"));
        assert_eq!(second.await.unwrap().unwrap(), Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn cancelled_reader_does_not_lose_data() {
        let connection = detached(3);
        let cancelled =
            tokio::time::timeout(Duration::from_millis(5), connection.read()).await;
        assert!(cancelled.is_err());
        connection.deliver(Bytes::from_static(b"kept"));
        assert_eq!(connection.read().await.unwrap(), Bytes::from_static(b"kept"));
    }

    #[tokio::test]
    async fn close_fails_pending_read() {
        let connection = detached(7);
        let reader = tokio::spawn({
            let connection = connection.clone();
            async move { connection.read().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        connection.close();
        assert!(matches!(
            reader.await.unwrap(),
            Err(Error::ConnectionClosed)
        ));
        assert!(connection.is_closed());
        // second close is a no-op
        connection.close();
    }

    #[tokio::test]
    async fn data_after_close_is_ignored() {
        let connection = detached(7);
        connection.deliver(Bytes::from_static(b"before"));
        connection.handle_close();
        connection.deliver(Bytes::from_static(b"after"));
        assert_eq!(
            connection.read().await.unwrap(),
            Bytes::from_static(b"before")
        );
        assert!(matches!(
            connection.read().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn send_errors() {
        let connection = detached(1);
        assert!(matches!(
            connection.send(b"x").await,
            Err(Error::ChannelClosed)
        ));
        connection.close();
        assert!(matches!(
            connection.send_nowait(b"x"),
            Err(Error::ConnectionClosed)
        ));
    }
}
