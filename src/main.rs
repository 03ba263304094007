// tftpd: serves one TFTP transfer at a time out of a single directory.
//
// Logging goes through env_logger. RUST_LOG overrides the default of "info"; at "debug" the
// server also dumps its trace table and status block whenever a transfer ends.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tftpd::config::{self, AddressFamily, ServerConfig};
use tftpd::{Server, TokioFileStore};

#[derive(Debug, Parser)]
#[command(version, about = "Single-session TFTP server (RFC 1350)")]
struct Cli {
    /// UDP port to listen on
    #[arg(short, long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Address family of the listening socket
    #[arg(short = 'f', long, value_enum, default_value_t = AddressFamily::Ipv4)]
    family: AddressFamily,

    /// Directory to serve files from and write uploads into
    #[arg(short, long, value_name("DIR"), default_value = ".")]
    root: PathBuf,

    /// Milliseconds an active transfer may stay silent before it is abandoned
    #[arg(long, value_name("MS"), default_value_t = 5000)]
    rx_timeout: u64,

    /// Milliseconds a single send may take
    #[arg(long, value_name("MS"), default_value_t = 5000)]
    tx_timeout: u64,

    /// Number of entries kept in the diagnostic trace
    #[arg(long, value_name("ENTRIES"), default_value_t = tftpd::trace::MIN_HISTORY)]
    trace_history: usize,

    /// Refuse all write requests
    #[arg(long, action)]
    read_only: bool,

    /// Fail write requests for files that already exist instead of replacing them
    #[arg(long, action)]
    no_overwrite: bool,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> ServerConfig {
        ServerConfig {
            port: cli.port,
            family: cli.family,
            rx_timeout: Duration::from_millis(cli.rx_timeout),
            tx_timeout: Duration::from_millis(cli.tx_timeout),
            root: cli.root,
            trace_history: cli.trace_history,
            read_only: cli.read_only,
            overwrite: !cli.no_overwrite,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from(Cli::parse());
    log::info!("Serving {:?}", config.root);

    let store = TokioFileStore::new(&config.root)
        .read_only(config.read_only)
        .overwrite(config.overwrite);
    let server = Server::bind(&config, store).context("Unable to start server")?;

    server.run().await;
    Ok(())
}
