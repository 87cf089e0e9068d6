//! Standalone bootstrap node for a Kademlia DHT overlay.
//!
//! The node loads a pre-provisioned identity, listens on a single address,
//! joins the DHT in server mode with a routing store persisted on disk, and
//! periodically logs its routing table and connections. New peers use it as
//! a rendezvous point to fill their own routing tables.
//!
//! ```no_run
//! use dht_bootstrap::{BootstrapServer, Config};
//!
//! # async fn run() -> dht_bootstrap::Result<()> {
//! let config = Config::new("/var/lib/dht-bootstrap").with_listen_addr("/ip4/0.0.0.0/tcp/4001");
//! let server = BootstrapServer::start(&config, tracing::info_span!("srv")).await?;
//!
//! println!("{}", server.peer_id());
//!
//! server.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod error;

pub mod config;
pub mod dht;
pub mod host;
pub mod identity;
pub mod monitor;
pub mod server;
pub mod store;

pub use config::Config;
pub use dht::{Dht, RoutingSummary};
pub use error::{Error, Result};
pub use server::BootstrapServer;

pub use libp2p::{identity::Keypair, Multiaddr, PeerId};
