use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument:{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Core(#[from] p2ptun_core::error::Error),
    #[error(transparent)]
    Any(#[from] anyhow::Error),
}

impl Error {
    /// The channel or the connection went away. Serving loops stop quietly on these.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Core(e) if e.is_closed())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
