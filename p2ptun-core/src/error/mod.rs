use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("channel closed")]
    ChannelClosed,
    #[error("role violation: {0}")]
    RoleViolation(&'static str),
    #[error("no free connection id: all {0} ids are in use")]
    IdExhausted(usize),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl Error {
    /// Errors that only mean the peer or the channel went away.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::ChannelClosed)
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            Error::ConnectionClosed | Error::ChannelClosed => {
                io::Error::new(io::ErrorKind::ConnectionAborted, value.to_string())
            }
            Error::InvalidFrame(_) => io::Error::new(io::ErrorKind::InvalidData, value.to_string()),
            e => io::Error::other(e.to_string()),
        }
    }
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
