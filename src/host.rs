//! Network host: transport, identity and the protocols a bootstrap node speaks.

use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::swarm::{behaviour::toggle::Toggle, NetworkBehaviour};
use libp2p::{identify, kad, noise, ping, relay, tcp, upnp, yamux};
use libp2p::{Multiaddr, PeerId, Swarm, SwarmBuilder};
use tracing::{info, Span};

use crate::config::Config;
use crate::store::RoutingStore;
use crate::{Error, Result};

/// Protocol version announced through identify.
pub const IDENTIFY_PROTOCOL: &str = "/dht-bootstrap/1.0.0";

/// Protocols run by the bootstrap node.
#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub kad: kad::Behaviour<RoutingStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub relay: Toggle<relay::Behaviour>,
    pub upnp: Toggle<upnp::tokio::Behaviour>,
}

impl Behaviour {
    fn new(key: &Keypair, store: RoutingStore, options: &HostOptions) -> Self {
        let local_id = key.public().to_peer_id();

        let mut kad = kad::Behaviour::with_config(
            local_id,
            store,
            kad::Config::new(kad::PROTOCOL_NAME),
        );
        // Stays a client until the DHT is joined.
        kad.set_mode(Some(kad::Mode::Client));

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                .with_agent_version(format!("dht-bootstrap/{}", env!("CARGO_PKG_VERSION"))),
        );

        Self {
            kad,
            identify,
            ping: ping::Behaviour::default(),
            relay: options
                .relay
                .then(|| relay::Behaviour::new(local_id, relay::Config::default()))
                .into(),
            upnp: options
                .nat_port_map
                .then(upnp::tokio::Behaviour::default)
                .into(),
        }
    }
}

#[derive(Debug, Clone)]
/// Capabilities enabled on the host.
pub struct HostOptions {
    /// Serve as a circuit relay.
    pub relay: bool,
    /// Map the listen port on the local gateway through UPnP.
    pub nat_port_map: bool,
    /// How long a connection without active streams is kept open.
    pub idle_connection_timeout: Duration,
}

impl From<&Config> for HostOptions {
    fn from(config: &Config) -> Self {
        Self {
            relay: config.relay,
            nat_port_map: config.nat_port_map,
            idle_connection_timeout: config.idle_connection_timeout,
        }
    }
}

/// A listening libp2p swarm, not yet driven.
pub struct NetworkHost {
    swarm: Swarm<Behaviour>,
    listen_addr: Multiaddr,
}

impl NetworkHost {
    /// Build the swarm and bind `listen_addr`.
    ///
    /// The identity is owned by the host from here on. The socket is bound
    /// before this returns; connections are accepted once the DHT driver
    /// starts polling the swarm.
    pub fn new(
        listen_addr: Multiaddr,
        identity: Keypair,
        store: RoutingStore,
        options: &HostOptions,
        span: Span,
    ) -> Result<Self> {
        let _entered = span.enter();

        let mut swarm = SwarmBuilder::with_existing_identity(identity)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|error| Error::Transport(error.to_string()))?
            .with_behaviour(|key| Behaviour::new(key, store, options))
            .map_err(|error| Error::Transport(error.to_string()))?
            .with_swarm_config(|config| {
                config.with_idle_connection_timeout(options.idle_connection_timeout)
            })
            .build();

        swarm
            .listen_on(listen_addr.clone())
            .map_err(|error| Error::Listen {
                addr: listen_addr.to_string(),
                reason: error.to_string(),
            })?;

        info!(
            peer_id = %swarm.local_peer_id(),
            %listen_addr,
            relay = options.relay,
            nat_port_map = options.nat_port_map,
            "Network host created"
        );

        Ok(Self { swarm, listen_addr })
    }

    // === Getters ===

    /// Peer id derived from the host identity.
    pub fn peer_id(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    /// Address the host was asked to listen on.
    pub fn listen_addr(&self) -> &Multiaddr {
        &self.listen_addr
    }

    pub(crate) fn into_swarm(self) -> Swarm<Behaviour> {
        self.swarm
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn options() -> HostOptions {
        HostOptions {
            relay: true,
            nat_port_map: false,
            idle_connection_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn peer_id_matches_identity() {
        let home = tempfile::tempdir().unwrap();
        let identity = Keypair::generate_ed25519();
        let expected = identity.public().to_peer_id();
        let store = RoutingStore::open(home.path(), expected, Span::none()).unwrap();

        let host = NetworkHost::new(
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            identity,
            store,
            &options(),
            Span::none(),
        )
        .unwrap();

        assert_eq!(host.peer_id(), expected);
        assert_eq!(host.listen_addr().to_string(), "/ip4/127.0.0.1/tcp/0");
    }

    #[tokio::test]
    async fn unsupported_transport_is_rejected() {
        let home = tempfile::tempdir().unwrap();
        let identity = Keypair::generate_ed25519();
        let store =
            RoutingStore::open(home.path(), identity.public().to_peer_id(), Span::none()).unwrap();

        let result = NetworkHost::new(
            "/ip4/127.0.0.1/udp/0/quic-v1".parse().unwrap(),
            identity,
            store,
            &options(),
            Span::none(),
        );

        assert!(matches!(result, Err(Error::Listen { .. })));
    }

    fn host_with(home: &std::path::Path, relay: bool, nat_port_map: bool) -> NetworkHost {
        let identity = Keypair::generate_ed25519();
        let store =
            RoutingStore::open(home, identity.public().to_peer_id(), Span::none()).unwrap();

        NetworkHost::new(
            "/ip4/127.0.0.1/tcp/0".parse().unwrap(),
            identity,
            store,
            &HostOptions {
                relay,
                nat_port_map,
                ..options()
            },
            Span::none(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn relay_and_port_mapping_are_enabled() {
        let home = tempfile::tempdir().unwrap();
        let host = host_with(home.path(), true, true);

        let behaviour = host.swarm.behaviour();
        assert!(behaviour.relay.is_enabled());
        assert!(behaviour.upnp.is_enabled());
    }

    #[tokio::test]
    async fn relay_and_port_mapping_can_be_disabled() {
        let home = tempfile::tempdir().unwrap();
        let host = host_with(home.path(), false, false);

        let behaviour = host.swarm.behaviour();
        assert!(!behaviour.relay.is_enabled());
        assert!(!behaviour.upnp.is_enabled());
    }
}
