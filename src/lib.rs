//! Tunnel local TCP streams and UDP flows through one point-to-point data channel.
//!
//! The stream side is built on [`p2ptun_core::ConnectionManager`]: [`tcp::serve_client`]
//! turns local TCP streams into connections and [`tcp::serve_server`] turns them back into TCP
//! streams to a fixed destination. UDP uses its own framing on a separate channel, see
//! [`udp::UdpClientBridge`] and [`udp::UdpServerBridge`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rendezvous;
pub mod tcp;
pub mod udp;

pub use p2ptun_core;
pub use p2ptun_core::channel::{ChannelReceiver, ChannelSender};
pub use p2ptun_core::connection::Role;
pub use p2ptun_core::{Connection, ConnectionManager, TimeoutCache};
