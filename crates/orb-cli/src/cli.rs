use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "orb",
    about = "orb: persistent and remote objects behind one interface",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create a store whose root is an empty array
    Init(InitArgs),
    /// Export a store's root to remote callers
    Serve(ServeArgs),
    /// Delete objects unreachable from the root
    Gc(GcArgs),
    /// Call a method on a remote root and print the result
    Call(CallArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Database file to create
    #[arg(long, default_value = "orb.db")]
    pub db: PathBuf,
}

#[derive(Args)]
pub struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Database file, overriding the configuration
    #[arg(long)]
    pub db: Option<PathBuf>,
    /// Address to listen on, overriding the configuration
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

#[derive(Args)]
pub struct GcArgs {
    #[arg(long, default_value = "orb.db")]
    pub db: PathBuf,
}

#[derive(Args)]
pub struct CallArgs {
    /// Method to invoke on the root
    pub method: String,
    /// Arguments: integers, floats, true/false, nil, :symbols, or strings
    pub args: Vec<String>,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(short, long, default_value_t = orb_server::DEFAULT_PORT)]
    pub port: u16,
}
