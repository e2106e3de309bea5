use std::io;
use std::time::Duration;

pub const HIGH_WATER_MARK: usize = 256 * 1024;
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(5);
pub const ACCEPT_BACKLOG: usize = 1024;

#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// Above this many buffered bytes on the channel, frames wait in the send queue.
    pub high_water_mark: usize,
    pub drain_interval: Duration,
    /// Accepted connections not yet taken by `accept()`. Further OPENs are answered with CLOSE.
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            high_water_mark: HIGH_WATER_MARK,
            drain_interval: DRAIN_INTERVAL,
            accept_backlog: ACCEPT_BACKLOG,
        }
    }
}

impl MuxConfig {
    pub fn set_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }
    pub fn set_drain_interval(mut self, drain_interval: Duration) -> Self {
        self.drain_interval = drain_interval;
        self
    }
    pub fn set_accept_backlog(mut self, accept_backlog: usize) -> Self {
        self.accept_backlog = accept_backlog;
        self
    }
    pub fn check(&self) -> io::Result<()> {
        if self.drain_interval.is_zero() {
            return Err(io::Error::other("drain_interval cannot be 0"));
        }
        if self.accept_backlog == 0 {
            return Err(io::Error::other("accept_backlog cannot be 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::MuxConfig;

    #[test]
    fn check_rejects_zero_interval() {
        assert!(MuxConfig::default().check().is_ok());
        let config = MuxConfig::default().set_drain_interval(Duration::ZERO);
        assert!(config.check().is_err());
        assert!(MuxConfig::default().set_accept_backlog(0).check().is_err());
    }
}
