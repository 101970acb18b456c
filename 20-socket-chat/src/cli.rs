use std::net::{Ipv4Addr, SocketAddr};

use clap::{Args, Parser, Subcommand};

use crate::multicast::{DEFAULT_GROUP, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat server: TCP chat plus the UDP relay on the same port.
    Server(ServerArgs),
    /// Join a server's chat and the multicast group.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address for both the TCP listener and the UDP relay. Use port 0 for an
    /// ephemeral port.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub listen: SocketAddr,

    /// How long to wait for clients to receive the shutdown notice, in
    /// milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub shutdown_grace_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname shown to other participants. Prompted for when omitted.
    #[arg(long)]
    pub nickname: Option<String>,

    /// Address of the server to connect to.
    #[arg(long, default_value = "127.0.0.1:12345")]
    pub server: SocketAddr,

    /// Multicast group joined for the multicast channel.
    #[arg(long, default_value_t = DEFAULT_GROUP)]
    pub multicast_group: Ipv4Addr,

    /// Port of the multicast group.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub multicast_port: u16,
}
