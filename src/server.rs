//! Bootstrap server: wires identity, store, host and DHT together.

use flume::Sender;
use libp2p::{Multiaddr, PeerId};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Span};

use crate::config::Config;
use crate::dht::Dht;
use crate::host::{HostOptions, NetworkHost};
use crate::store::RoutingStore;
use crate::{identity, monitor, Error, Result};

/// A running bootstrap node.
///
/// Only obtainable through [BootstrapServer::start], so holding one means
/// the node reached its running state. Dropping it stops the monitor
/// routines and the DHT driver; [BootstrapServer::shutdown] does the same
/// and waits for them.
#[derive(Debug)]
pub struct BootstrapServer {
    peer_id: PeerId,
    listen_addr: Multiaddr,
    dht: Dht,
    /// Dropping this stops both monitor routines.
    shutdown: Option<Sender<()>>,
    monitors: Vec<JoinHandle<()>>,
    span: Span,
}

impl BootstrapServer {
    /// Bring the node up.
    ///
    /// Steps run strictly in order: load the identity, parse the listen
    /// address, open the routing store, build the host, join the DHT. The
    /// first failure is returned and nothing after it is attempted. On
    /// success both monitor routines are running.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn start(config: &Config, span: Span) -> Result<Self> {
        config.validate()?;

        let identity = identity::load(&config.home, &info_span!(parent: &span, "identity"))?;
        let peer_id = identity.public().to_peer_id();

        let listen_addr: Multiaddr =
            config
                .listen_addr
                .parse()
                .map_err(|source| Error::InvalidListenAddr {
                    addr: config.listen_addr.clone(),
                    source,
                })?;

        let store = RoutingStore::open(
            &config.home,
            peer_id,
            info_span!(parent: &span, "store"),
        )?;

        let host = NetworkHost::new(
            listen_addr.clone(),
            identity,
            store,
            &HostOptions::from(config),
            info_span!(parent: &span, "host"),
        )?;

        let dht = Dht::join(host, info_span!(parent: &span, "dht"))?;

        let (trigger, signal) = flume::bounded::<()>(0);

        let monitors = vec![
            tokio::spawn(monitor::dump_dht_routine(
                dht.clone(),
                config.dht_dump_interval,
                signal.clone(),
                info_span!(parent: &span, "dump_dht"),
            )),
            tokio::spawn(monitor::dump_peers_routine(
                dht.clone(),
                config.peers_dump_interval,
                signal,
                info_span!(parent: &span, "dump_peers"),
            )),
        ];

        span.in_scope(|| info!(id = %peer_id, "Bootstrap server has started"));

        Ok(BootstrapServer {
            peer_id,
            listen_addr,
            dht,
            shutdown: Some(trigger),
            monitors,
            span,
        })
    }

    // === Getters ===

    /// The node's public identifier, derived from its key.
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// The configured listen address.
    ///
    /// Use [Dht::routing_summary] for the addresses actually bound.
    pub fn listen_addr(&self) -> &Multiaddr {
        &self.listen_addr
    }

    /// Handle to the DHT driver.
    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    // === Public Methods ===

    /// Stop the monitor routines and the DHT driver, waiting for all of them.
    pub async fn shutdown(mut self) {
        drop(self.shutdown.take());

        for monitor in self.monitors.drain(..) {
            if let Err(error) = monitor.await {
                self.span
                    .in_scope(|| warn!(?error, "Monitor routine failed"));
            }
        }

        self.dht.shutdown().await;

        self.span
            .in_scope(|| info!(id = %self.peer_id, "Bootstrap server stopped"));
    }
}
