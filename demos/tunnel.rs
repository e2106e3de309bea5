use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use env_logger::Env;
use p2ptun::config::{BridgeConfig, MuxConfig, UdpBridgeConfig};
use p2ptun::p2ptun_core::channel::stream::framed;
use p2ptun::tcp::{serve_client, serve_server};
use p2ptun::udp::{UdpClientBridge, UdpServerBridge};
use p2ptun::{ConnectionManager, Role};
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Wait for the peer and forward its connections to fixed destinations.
    Server {
        /// Address the peer connects to for the stream channel.
        #[arg(short, long)]
        listen: SocketAddr,
        /// TCP destination for tunneled connections.
        #[arg(short, long)]
        tcp_dest: SocketAddr,
        /// Address the peer connects to for the datagram channel.
        #[arg(long, requires = "udp_dest")]
        udp_listen: Option<SocketAddr>,
        /// UDP destination for tunneled datagrams.
        #[arg(long)]
        udp_dest: Option<SocketAddr>,
    },
    /// Connect to the peer and expose its destinations locally.
    Client {
        /// Stream channel address of the server.
        #[arg(short, long)]
        peer: SocketAddr,
        /// Local TCP address to accept connections on.
        #[arg(short, long)]
        local: SocketAddr,
        /// Datagram channel address of the server.
        #[arg(long, requires = "udp_port")]
        udp_peer: Option<SocketAddr>,
        /// Local UDP port.
        #[arg(long)]
        udp_port: Option<u16>,
    },
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args { mode } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    tokio::select! {
        rs = run(mode) => rs?,
        rs = tokio::signal::ctrl_c() => rs?,
    }
    log::info!("exit!!!!");
    Ok(())
}

async fn run(mode: Mode) -> anyhow::Result<()> {
    match mode {
        Mode::Server {
            listen,
            tcp_dest,
            udp_listen,
            udp_dest,
        } => {
            let _udp = match (udp_listen, udp_dest) {
                (Some(listen), Some(dest)) => {
                    let (stream, addr) = TcpListener::bind(listen).await?.accept().await?;
                    log::info!("datagram channel from {addr}");
                    let (sender, receiver) = framed(stream);
                    Some(UdpServerBridge::start(
                        sender,
                        receiver,
                        dest,
                        UdpBridgeConfig::default(),
                    )?)
                }
                _ => None,
            };
            let (stream, addr) = TcpListener::bind(listen).await?.accept().await?;
            log::info!("stream channel from {addr}");
            let (sender, receiver) = framed(stream);
            let manager =
                ConnectionManager::start(sender, receiver, Role::Server, MuxConfig::default())?;
            serve_server(manager, tcp_dest, BridgeConfig::default()).await?;
        }
        Mode::Client {
            peer,
            local,
            udp_peer,
            udp_port,
        } => {
            let _udp = match (udp_peer, udp_port) {
                (Some(peer), Some(port)) => {
                    let (sender, receiver) = framed(TcpStream::connect(peer).await?);
                    Some(UdpClientBridge::start(
                        sender,
                        receiver,
                        port,
                        UdpBridgeConfig::default(),
                    )?)
                }
                _ => None,
            };
            let (sender, receiver) = framed(TcpStream::connect(peer).await?);
            let manager =
                ConnectionManager::start(sender, receiver, Role::Client, MuxConfig::default())?;
            let listener = TcpListener::bind(local).await?;
            log::info!("forwarding {local} through {peer}");
            serve_client(listener, manager, BridgeConfig::default()).await?;
        }
    }
    Ok(())
}
