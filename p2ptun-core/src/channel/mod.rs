//! The data channel the multiplexer runs over.
//!
//! A channel carries opaque binary messages between two peers. The sending half exposes how
//! many bytes it still holds in its outgoing buffer so callers can apply backpressure; the
//! receiving half yields messages until the channel closes.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub mod memory;
pub mod stream;

pub trait ChannelSender: Send + Sync + 'static {
    /// Queue one message. Must not block.
    fn send(&self, buf: Bytes) -> io::Result<()>;
    /// Bytes accepted by [`ChannelSender::send`] but not yet written out.
    fn buffered_amount(&self) -> usize;
    /// Close both directions of the channel.
    fn close(&self) {}
}

impl<T: ChannelSender + ?Sized> ChannelSender for Arc<T> {
    fn send(&self, buf: Bytes) -> io::Result<()> {
        (**self).send(buf)
    }
    fn buffered_amount(&self) -> usize {
        (**self).buffered_amount()
    }
    fn close(&self) {
        (**self).close()
    }
}

#[async_trait]
pub trait ChannelReceiver: Send + 'static {
    /// Next message, `None` once the channel is closed.
    async fn recv(&mut self) -> Option<Bytes>;
}

#[async_trait]
impl ChannelReceiver for tokio::sync::mpsc::Receiver<Bytes> {
    async fn recv(&mut self) -> Option<Bytes> {
        tokio::sync::mpsc::Receiver::recv(self).await
    }
}

#[async_trait]
impl ChannelReceiver for flume::Receiver<Bytes> {
    async fn recv(&mut self) -> Option<Bytes> {
        self.recv_async().await.ok()
    }
}
