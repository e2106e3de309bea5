use std::io;
use std::time::Duration;

pub use p2ptun_core::connection::MuxConfig;

pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub(crate) const READ_BUFFER_SIZE: usize = 16 * 1024;
pub(crate) const MAILBOX_TTL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct UdpBridgeConfig {
    /// Idle sessions are dropped between one and two intervals after their last datagram.
    pub sweep_interval: Duration,
    pub use_v6: bool,
    pub recv_buffer_size: usize,
}

impl Default for UdpBridgeConfig {
    fn default() -> Self {
        Self {
            sweep_interval: SWEEP_INTERVAL,
            use_v6: true,
            recv_buffer_size: 65536,
        }
    }
}

impl UdpBridgeConfig {
    pub fn set_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
    pub fn set_use_v6(mut self, use_v6: bool) -> Self {
        self.use_v6 = use_v6;
        self
    }
    pub fn set_recv_buffer_size(mut self, recv_buffer_size: usize) -> Self {
        self.recv_buffer_size = recv_buffer_size;
        self
    }
    pub fn check(&self) -> io::Result<()> {
        if self.sweep_interval.is_zero() {
            return Err(io::Error::other("sweep_interval cannot be 0"));
        }
        if self.recv_buffer_size == 0 {
            return Err(io::Error::other("recv_buffer_size cannot be 0"));
        }
        if self.use_v6 {
            socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::DGRAM, None)?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Upper bound of one chunk read from the stream and sent as one DATA frame.
    pub read_buffer_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: READ_BUFFER_SIZE,
        }
    }
}

impl BridgeConfig {
    pub fn set_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }
    pub fn check(&self) -> io::Result<()> {
        if self.read_buffer_size == 0 {
            return Err(io::Error::other("read_buffer_size cannot be 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct RendezvousConfig {
    pub mailbox_ttl: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            mailbox_ttl: MAILBOX_TTL,
        }
    }
}

impl RendezvousConfig {
    pub fn set_mailbox_ttl(mut self, mailbox_ttl: Duration) -> Self {
        self.mailbox_ttl = mailbox_ttl;
        self
    }
    pub fn check(&self) -> io::Result<()> {
        if self.mailbox_ttl.is_zero() {
            return Err(io::Error::other("mailbox_ttl cannot be 0"));
        }
        Ok(())
    }
}
