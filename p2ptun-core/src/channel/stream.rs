//! Channel over any reliable byte stream, e.g. a plain TCP link between the two peers.
//!
//! Every message is written as a 4-byte big-endian length followed by the message bytes.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::channel::{ChannelReceiver, ChannelSender};

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Split `stream` into the two halves of a channel. Writes happen on a background task that
/// ends when the sender is closed or dropped, or when the stream fails.
pub fn framed<S>(stream: S) -> (StreamSender, StreamReceiver)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    let (sender, receiver) = flume::unbounded();
    let shared = Arc::new(Shared {
        buffered: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
    });
    let writer_shared = shared.clone();
    tokio::spawn(async move {
        if let Err(e) = write_loop(write, receiver, &writer_shared).await {
            log::debug!("stream channel write: {e:?}");
        }
        writer_shared.closed.store(true, Ordering::Release);
    });
    (
        StreamSender {
            sender: Arc::new(Mutex::new(Some(sender))),
            shared,
        },
        StreamReceiver {
            read: Box::new(read),
        },
    )
}

struct Shared {
    buffered: AtomicUsize,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct StreamSender {
    sender: Arc<Mutex<Option<flume::Sender<Bytes>>>>,
    shared: Arc<Shared>,
}

impl ChannelSender for StreamSender {
    fn send(&self, buf: Bytes) -> io::Result<()> {
        if buf.len() > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message len {} > {MAX_FRAME_LEN}", buf.len()),
            ));
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let len = buf.len();
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        if sender.send(buf).is_err() {
            self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.sender.lock().take();
    }
}

async fn write_loop<W>(
    mut write: W,
    receiver: flume::Receiver<Bytes>,
    shared: &Shared,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Ok(buf) = receiver.recv_async().await {
        let head: [u8; 4] = (buf.len() as u32).to_be_bytes();
        write.write_all(&head).await?;
        write.write_all(&buf).await?;
        shared.buffered.fetch_sub(buf.len(), Ordering::AcqRel);
    }
    write.shutdown().await
}

pub struct StreamReceiver {
    read: Box<dyn AsyncRead + Send + Unpin>,
}

impl StreamReceiver {
    async fn read_frame(&mut self) -> io::Result<Bytes> {
        let mut head = [0; 4];
        self.read.read_exact(&mut head).await?;
        let len = u32::from_be_bytes(head) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame len {len} > {MAX_FRAME_LEN}"),
            ));
        }
        let mut buf = BytesMut::zeroed(len);
        self.read.read_exact(&mut buf).await?;
        Ok(buf.freeze())
    }
}

#[async_trait]
impl ChannelReceiver for StreamReceiver {
    async fn recv(&mut self) -> Option<Bytes> {
        match self.read_frame().await {
            Ok(buf) => Some(buf),
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    log::debug!("stream channel read: {e:?}");
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::framed;
    use crate::channel::{ChannelReceiver, ChannelSender};

    #[tokio::test]
    async fn messages_keep_boundaries() {
        let (left, right) = tokio::io::duplex(64);
        let (left_tx, _left_rx) = framed(left);
        let (_right_tx, mut right_rx) = framed(right);
        left_tx.send(Bytes::from_static(b"first")).unwrap();
        left_tx.send(Bytes::new()).unwrap();
        left_tx.send(Bytes::from(vec![7u8; 1000])).unwrap();
        assert_eq!(right_rx.recv().await.unwrap(), Bytes::from_static(b"first"));
        assert!(right_rx.recv().await.unwrap().is_empty());
        assert_eq!(right_rx.recv().await.unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn close_reaches_peer() {
        let (left, right) = tokio::io::duplex(64);
        let (left_tx, _left_rx) = framed(left);
        let (_right_tx, mut right_rx) = framed(right);
        left_tx.send(Bytes::from_static(b"bye")).unwrap();
        left_tx.close();
        assert!(left_tx.send(Bytes::from_static(b"late")).is_err());
        assert_eq!(right_rx.recv().await.unwrap(), Bytes::from_static(b"bye"));
        assert!(right_rx.recv().await.is_none());
    }
}
