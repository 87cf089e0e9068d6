//! Dht node running in server mode.
//!
//! [Dht::join] hands the swarm to a driver task that owns it for the rest of
//! the process. The [Dht] handle talks to that driver over channels.

use std::fmt::{self, Display, Formatter};

use flume::{Receiver, Sender};
use futures::StreamExt;
use libp2p::kad::{self, store::RecordStore};
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, upnp, Multiaddr, PeerId, Swarm};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument, Span};

use crate::host::{Behaviour, BehaviourEvent, NetworkHost};
use crate::{Error, Result};

#[derive(Debug)]
/// Handle to the DHT driver task.
pub struct Dht {
    sender: Sender<ActorMessage>,
    handle: Option<JoinHandle<()>>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Dht {
            sender: self.sender.clone(),
            handle: None,
        }
    }
}

impl Dht {
    /// Join the overlay in server mode, answering other peers' routing queries.
    ///
    /// Entries persisted by a previous run are put back in the routing table
    /// before the driver starts. Must be called from within a Tokio runtime.
    pub fn join(host: NetworkHost, span: Span) -> Result<Self> {
        let mut swarm = host.into_swarm();

        span.in_scope(|| -> Result<()> {
            let kad = &mut swarm.behaviour_mut().kad;
            kad.set_mode(Some(kad::Mode::Server));

            let known = kad.store_mut().peers()?;
            for (peer, addresses) in &known {
                for address in addresses {
                    kad.add_address(peer, address.clone());
                }
            }

            if !known.is_empty() {
                if let Err(error) = kad.bootstrap() {
                    debug!(?error, "Could not refresh restored routing table");
                }
            }

            info!(restored = known.len(), "Joined DHT in server mode");

            Ok(())
        })?;

        let (sender, receiver) = flume::unbounded();

        let driver = Driver {
            swarm,
            receiver,
            mode: kad::Mode::Server,
        };
        let handle = tokio::spawn(driver.run().instrument(span));

        Ok(Dht {
            sender,
            handle: Some(handle),
        })
    }

    // === Getters ===

    /// Snapshot of the routing table and the node's DHT state.
    pub async fn routing_summary(&self) -> Result<RoutingSummary> {
        let (sender, receiver) = flume::bounded::<RoutingSummary>(1);

        self.sender
            .send(ActorMessage::RoutingSummary(sender))
            .map_err(|_| Error::DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| Error::DhtWasShutdown)
    }

    /// Peers the host currently holds at least one connection to.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>> {
        let (sender, receiver) = flume::bounded::<Vec<PeerId>>(1);

        self.sender
            .send(ActorMessage::ConnectedPeers(sender))
            .map_err(|_| Error::DhtWasShutdown)?;

        receiver.recv_async().await.map_err(|_| Error::DhtWasShutdown)
    }

    // === Public Methods ===

    /// Stop the driver, flushing the routing store.
    ///
    /// Waits for the driver task to exit if this is the handle returned by
    /// [Dht::join], so the store is released once this returns.
    pub async fn shutdown(&mut self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.sender.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;

        if let Some(handle) = self.handle.take() {
            if let Err(error) = handle.await {
                warn!(?error, "DHT driver task failed");
            }
        }
    }
}

#[derive(Debug)]
enum ActorMessage {
    RoutingSummary(Sender<RoutingSummary>),
    ConnectedPeers(Sender<Vec<PeerId>>),
    Shutdown(Sender<()>),
}

/// Owns the swarm and polls it.
struct Driver {
    swarm: Swarm<Behaviour>,
    receiver: Receiver<ActorMessage>,
    /// Last mode Kademlia reported, starting from the one set by [Dht::join].
    mode: kad::Mode,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                message = self.receiver.recv_async() => match message {
                    Ok(ActorMessage::Shutdown(sender)) => {
                        self.flush();
                        let _ = sender.send(());
                        break;
                    }
                    Ok(message) => self.handle_message(message),
                    Err(_) => {
                        // Every handle was dropped.
                        debug!("DHT driver was shutdown after Drop.");
                        self.flush();
                        break;
                    }
                },
                event = self.swarm.select_next_some() => self.handle_event(event),
            }
        }

        info!("DHT driver stopped");
    }

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::RoutingSummary(sender) => {
                let _ = sender.send(self.routing_summary());
            }
            ActorMessage::ConnectedPeers(sender) => {
                let _ = sender.send(self.swarm.connected_peers().copied().collect());
            }
            ActorMessage::Shutdown(_) => {}
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "Listening");
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                warn!(%address, "Listen address expired");
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!(%error, "Listener error");
            }
            SwarmEvent::ListenerClosed {
                addresses, reason, ..
            } => {
                warn!(?addresses, ?reason, "Listener closed");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                debug!(%peer_id, address = %endpoint.get_remote_address(), "Connection established");
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!(%peer_id, ?cause, "Connection closed");
            }
            SwarmEvent::IncomingConnectionError { error, .. } => {
                debug!(%error, "Incoming connection failed");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                // Only peers speaking our Kademlia protocol belong in the routing table.
                if info.protocols.contains(&kad::PROTOCOL_NAME) {
                    let kad = &mut self.swarm.behaviour_mut().kad;
                    for address in info.listen_addrs {
                        kad.add_address(&peer_id, address);
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::RoutingUpdated {
                peer,
                addresses,
                old_peer,
                ..
            })) => {
                trace!(%peer, ?old_peer, "Routing table updated");

                let store = self.swarm.behaviour_mut().kad.store_mut();
                if let Err(error) = store.save_peer(&peer, addresses.iter()) {
                    warn!(%error, %peer, "Failed to persist routing entry");
                }
                if let Some(old_peer) = old_peer {
                    if let Err(error) = store.remove_peer(&old_peer) {
                        warn!(%error, peer = %old_peer, "Failed to drop routing entry");
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::ModeChanged { new_mode })) => {
                info!(mode = %new_mode, "DHT mode changed");
                self.mode = new_mode;
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kad(kad::Event::InboundRequest { request })) => {
                trace!(?request, "Inbound DHT request");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Upnp(upnp::Event::NewExternalAddr(address))) => {
                info!(%address, "Port mapped on gateway");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Upnp(upnp::Event::GatewayNotFound)) => {
                info!("No UPnP gateway found");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Upnp(upnp::Event::NonRoutableGateway)) => {
                info!("UPnP gateway is not exposed to the public network");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Upnp(event)) => {
                debug!(?event, "UPnP");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Relay(event)) => {
                debug!(?event, "Relay");
            }
            _ => {}
        }
    }

    fn routing_summary(&mut self) -> RoutingSummary {
        let id = *self.swarm.local_peer_id();
        let listen_addrs = self.swarm.listeners().cloned().collect();

        let server_mode = self.mode == kad::Mode::Server;
        let kad = &mut self.swarm.behaviour_mut().kad;

        let mut buckets = Vec::new();
        for bucket in kad.kbuckets() {
            let index = bucket.range().0.ilog2().unwrap_or_default();
            buckets.push((index, bucket.num_entries()));
        }

        RoutingSummary {
            id,
            server_mode,
            peers: buckets.iter().map(|(_, entries)| entries).sum(),
            buckets,
            records: kad.store_mut().records().count(),
            listen_addrs,
        }
    }

    fn flush(&mut self) {
        if let Err(error) = self.swarm.behaviour_mut().kad.store_mut().flush() {
            warn!(%error, "Failed to flush routing store");
        }
    }
}

/// Summary of this node's routing table.
#[derive(Debug, Clone)]
pub struct RoutingSummary {
    id: PeerId,
    server_mode: bool,
    peers: usize,
    buckets: Vec<(u32, usize)>,
    records: usize,
    listen_addrs: Vec<Multiaddr>,
}

impl RoutingSummary {
    /// This node's [PeerId]
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// Returns whether or not this node answers routing queries.
    pub fn server_mode(&self) -> bool {
        self.server_mode
    }

    /// Number of peers in the routing table.
    pub fn peers(&self) -> usize {
        self.peers
    }

    /// Non-empty buckets as `(log2 distance, entries)`.
    pub fn buckets(&self) -> &[(u32, usize)] {
        &self.buckets
    }

    /// Number of records held for other peers.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Addresses the host is currently listening on.
    pub fn listen_addrs(&self) -> &[Multiaddr] {
        &self.listen_addrs
    }
}

impl Display for RoutingSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id={} mode={} peers={} records={} buckets=[",
            self.id,
            if self.server_mode { "server" } else { "client" },
            self.peers,
            self.records,
        )?;

        for (i, (index, entries)) in self.buckets.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{index}:{entries}")?;
        }

        write!(f, "]")
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use libp2p::identity::Keypair;

    use super::*;
    use crate::host::HostOptions;
    use crate::store::RoutingStore;

    fn host(home: &std::path::Path, identity: Keypair) -> NetworkHost {
        let store =
            RoutingStore::open(home, identity.public().to_peer_id(), Span::none()).unwrap();

        NetworkHost::new(
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            identity,
            store,
            &HostOptions {
                relay: false,
                nat_port_map: false,
                idle_connection_timeout: Duration::from_secs(10),
            },
            Span::none(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn joins_in_server_mode() {
        let home = tempfile::tempdir().unwrap();
        let identity = Keypair::generate_ed25519();
        let peer_id = identity.public().to_peer_id();

        let mut dht = Dht::join(host(home.path(), identity), Span::none()).unwrap();

        let summary = dht.routing_summary().await.unwrap();
        assert_eq!(summary.id(), &peer_id);
        assert!(summary.server_mode());
        assert_eq!(summary.peers(), 0);
        assert!(dht.connected_peers().await.unwrap().is_empty());

        dht.shutdown().await;
    }

    #[tokio::test]
    async fn summary_follows_mode_changes() {
        let home = tempfile::tempdir().unwrap();
        let (_sender, receiver) = flume::unbounded();

        let mut driver = Driver {
            swarm: host(home.path(), Keypair::generate_ed25519()).into_swarm(),
            receiver,
            mode: kad::Mode::Server,
        };
        assert!(driver.routing_summary().server_mode());

        driver.handle_event(SwarmEvent::Behaviour(BehaviourEvent::Kad(
            kad::Event::ModeChanged {
                new_mode: kad::Mode::Client,
            },
        )));
        assert!(!driver.routing_summary().server_mode());

        driver.handle_event(SwarmEvent::Behaviour(BehaviourEvent::Kad(
            kad::Event::ModeChanged {
                new_mode: kad::Mode::Server,
            },
        )));
        assert!(driver.routing_summary().server_mode());
    }

    #[tokio::test]
    async fn handles_fail_after_shutdown() {
        let home = tempfile::tempdir().unwrap();

        let mut dht = Dht::join(host(home.path(), Keypair::generate_ed25519()), Span::none())
            .unwrap();
        let clone = dht.clone();

        dht.shutdown().await;

        assert!(matches!(
            clone.routing_summary().await,
            Err(Error::DhtWasShutdown)
        ));
        assert!(matches!(
            clone.connected_peers().await,
            Err(Error::DhtWasShutdown)
        ));
    }

    #[tokio::test]
    async fn restores_persisted_routing_table() {
        let home = tempfile::tempdir().unwrap();
        let identity = Keypair::generate_ed25519();
        let known = PeerId::random();

        {
            let store =
                RoutingStore::open(home.path(), identity.public().to_peer_id(), Span::none())
                    .unwrap();
            let address: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
            store.save_peer(&known, [&address]).unwrap();
            store.flush().unwrap();
        }

        let mut dht = Dht::join(host(home.path(), identity), Span::none()).unwrap();

        let summary = dht.routing_summary().await.unwrap();
        assert_eq!(summary.peers(), 1);
        assert_eq!(summary.buckets().len(), 1);

        dht.shutdown().await;
    }

    #[test]
    fn summary_display() {
        let summary = RoutingSummary {
            id: PeerId::random(),
            server_mode: true,
            peers: 3,
            buckets: vec![(254, 1), (255, 2)],
            records: 0,
            listen_addrs: vec![],
        };

        let line = summary.to_string();
        assert!(line.contains("mode=server"));
        assert!(line.ends_with("peers=3 records=0 buckets=[254:1 255:2]"));
    }
}
