use std::{fmt::Display, path::PathBuf, process, time::Duration};

use clap::{Args, Parser, Subcommand};
use dht_bootstrap::{config::DEFAULT_LISTEN_ADDR, identity, BootstrapServer, Config};
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bootstrap node until interrupted.
    Run(RunArgs),
    /// Generate the node key in the home directory.
    Keygen {
        /// Home directory to write `node_key` into.
        #[arg(long, default_value = ".")]
        home: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Home directory holding `node_key` and the `rt` routing store.
    #[arg(long, default_value = ".")]
    home: PathBuf,
    /// Listen address in multiaddress form.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: String,
    /// Don't act as a circuit relay.
    #[arg(long)]
    no_relay: bool,
    /// Don't try to map the listen port through UPnP.
    #[arg(long)]
    no_nat_port_map: bool,
    /// Seconds between two routing table and connected peers dumps.
    #[arg(long, default_value_t = 60)]
    dump_interval: u64,
}

impl RunArgs {
    fn into_config(self) -> Config {
        Config::new(self.home)
            .with_listen_addr(self.listen_addr)
            .with_relay(!self.no_relay)
            .with_nat_port_map(!self.no_nat_port_map)
            .with_dump_interval(Duration::from_secs(self.dump_interval))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let span = info_span!("srv");

    match cli.command {
        Command::Keygen { home } => match identity::provision(&home, &span) {
            Ok(peer_id) => println!("{peer_id}"),
            Err(error) => fatal("Failed to generate node key", error),
        },
        Command::Run(args) => {
            let config = args.into_config();

            let server = match BootstrapServer::start(&config, span).await {
                Ok(server) => server,
                Err(error) => fatal("Failed to start bootstrap server", error),
            };

            let (tx_interrupted, rx_interrupted) = flume::bounded::<()>(1);

            if let Err(error) = ctrlc::set_handler(move || {
                let _ = tx_interrupted.try_send(());
            }) {
                fatal("Error setting Ctrl-C handler", error);
            }

            let _ = rx_interrupted.recv_async().await;
            info!("Received Ctrl+C! Shutting down...");

            server.shutdown().await;
        }
    }
}

/// Log a startup error and terminate with a non-zero status.
fn fatal(context: &str, error: impl Display) -> ! {
    error!(%error, "{context}");
    process::exit(1);
}
