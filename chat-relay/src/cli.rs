use std::{net::SocketAddr, num::NonZeroUsize};

use clap::{Args, Parser, Subcommand};

use crate::session::DEFAULT_OUTBOUND_CAPACITY;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP chat clients.
    Serve(ServeArgs),
    /// Connect to a relay from the terminal.
    Connect(ConnectArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the relay binds to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Lines queued for one client before it is considered stalled and dropped.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: NonZeroUsize,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectArgs {
    /// Username announced to the relay.
    #[arg(long)]
    pub username: String,

    /// Address of the relay.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,
}
