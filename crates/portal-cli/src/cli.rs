use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub const DEFAULT_RELAY: &str = "ws://localhost:4017/relay";

/// Expose local services through Portal relays
#[derive(Parser, Debug)]
#[command(name = "portal-tunnel")]
#[command(about = "Expose local services through Portal relays", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Expose local services through relays
    ///
    /// With --config every service in the file is exposed. Otherwise a single
    /// service is built from --relay, --host, --port and --name.
    Expose(ExposeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ExposeArgs {
    /// Path to portal-tunnel config file
    #[arg(long, env = "PORTAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Relay server URLs when config is not provided (comma-separated)
    #[arg(long, env = "PORTAL_RELAY", default_value = DEFAULT_RELAY)]
    pub relay: String,

    /// Local host to proxy to when config is not provided
    #[arg(long, env = "PORTAL_HOST", default_value = "localhost")]
    pub host: String,

    /// Local port to proxy to when config is not provided
    #[arg(long, env = "PORTAL_PORT", default_value_t = 4018)]
    pub port: u16,

    /// Service name when config is not provided (auto-generated if empty)
    #[arg(long, env = "PORTAL_NAME", default_value = "")]
    pub name: String,
}
