use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::channel::{ChannelReceiver, ChannelSender};

/// One end of an in-process channel created by [`pair`].
pub type MemoryEndpoint = (MemorySender, MemoryReceiver);

/// Create two connected endpoints. Bytes sent on one end count towards its buffered amount
/// until the other end receives them. Closing either end closes both directions.
pub fn pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_to_b, b_rx) = flume::unbounded();
    let (b_to_a, a_rx) = flume::unbounded();
    let links = Arc::new(Links {
        senders: Mutex::new([Some(a_to_b), Some(b_to_a)]),
    });
    let a_buffered = Arc::new(AtomicUsize::new(0));
    let b_buffered = Arc::new(AtomicUsize::new(0));
    let a = (
        MemorySender {
            links: links.clone(),
            index: 0,
            buffered: a_buffered.clone(),
        },
        MemoryReceiver {
            receiver: a_rx,
            buffered: b_buffered.clone(),
        },
    );
    let b = (
        MemorySender {
            links,
            index: 1,
            buffered: b_buffered,
        },
        MemoryReceiver {
            receiver: b_rx,
            buffered: a_buffered,
        },
    );
    (a, b)
}

struct Links {
    senders: Mutex<[Option<flume::Sender<Bytes>>; 2]>,
}

#[derive(Clone)]
pub struct MemorySender {
    links: Arc<Links>,
    index: usize,
    buffered: Arc<AtomicUsize>,
}

impl ChannelSender for MemorySender {
    fn send(&self, buf: Bytes) -> io::Result<()> {
        let guard = self.links.senders.lock();
        let Some(sender) = guard[self.index].as_ref() else {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        };
        let len = buf.len();
        // counted before the send so the receiver never subtracts first
        self.buffered.fetch_add(len, Ordering::AcqRel);
        if sender.send(buf).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    fn close(&self) {
        let mut guard = self.links.senders.lock();
        guard[0].take();
        guard[1].take();
    }
}

pub struct MemoryReceiver {
    receiver: flume::Receiver<Bytes>,
    buffered: Arc<AtomicUsize>,
}

#[async_trait]
impl ChannelReceiver for MemoryReceiver {
    async fn recv(&mut self) -> Option<Bytes> {
        let buf = self.receiver.recv_async().await.ok()?;
        self.buffered.fetch_sub(buf.len(), Ordering::AcqRel);
        Some(buf)
    }
}
