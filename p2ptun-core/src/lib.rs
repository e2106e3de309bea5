//! # p2ptun-core - stream multiplexing over one data channel
//!
//! `p2ptun-core` carries many independent byte streams over a single point-to-point message
//! channel. Every channel message is one frame: a command byte (OPEN, CLOSE or DATA), a 24-bit
//! connection id and, for DATA, the payload.
//!
//! ## Modules
//!
//! - [`channel`] - the channel traits plus in-memory and byte-stream implementations
//! - [`protocol`] - frame encoding and decoding
//! - [`connection`] - [`Connection`] and the [`ConnectionManager`] that owns them
//! - [`cache`] - [`TimeoutCache`], a map whose entries expire after one to two sweep intervals
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use p2ptun_core::channel::memory;
//! use p2ptun_core::connection::{ConnectionManager, MuxConfig, Role};
//!
//! # #[tokio::main]
//! # async fn main() -> p2ptun_core::error::Result<()> {
//! let ((client_tx, client_rx), (server_tx, server_rx)) = memory::pair();
//! let client = ConnectionManager::start(client_tx, client_rx, Role::Client, MuxConfig::default())?;
//! let server = ConnectionManager::start(server_tx, server_rx, Role::Server, MuxConfig::default())?;
//!
//! let outbound = client.connect()?;
//! let inbound = server.accept().await?;
//! outbound.send(b"hello").await?;
//! assert_eq!(&inbound.read().await?[..], b"hello");
//! outbound.close();
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod channel;
pub mod connection;
pub mod error;
pub mod protocol;

pub use cache::TimeoutCache;
pub use connection::{Connection, ConnectionManager};
