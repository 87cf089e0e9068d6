use std::{path::PathBuf, time::Duration};

use crate::{Error, Result};

/// Default listen address, the conventional libp2p swarm port on all interfaces.
pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/4001";
/// Default delay between two routing-table dumps.
pub const DEFAULT_DHT_DUMP_INTERVAL: Duration = Duration::from_secs(60);
/// Default delay between two connected-peers dumps.
pub const DEFAULT_PEERS_DUMP_INTERVAL: Duration = Duration::from_secs(60);
/// Default time an idle connection is kept open.
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
/// Bootstrap node configurations
pub struct Config {
    /// Home directory holding the `node_key` file and the `rt` routing store.
    ///
    /// Defaults to the current directory.
    pub home: PathBuf,
    /// Single listen address in multiaddress textual form.
    ///
    /// Defaults to [DEFAULT_LISTEN_ADDR]
    pub listen_addr: String,
    /// Act as a circuit relay for peers that can't be reached directly.
    ///
    /// Defaults to true
    pub relay: bool,
    /// Ask the local gateway to forward the listen port (UPnP).
    ///
    /// Defaults to true
    pub nat_port_map: bool,
    /// Delay between two routing-table dumps. Must be non-zero.
    ///
    /// Defaults to [DEFAULT_DHT_DUMP_INTERVAL]
    pub dht_dump_interval: Duration,
    /// Delay between two connected-peers dumps. Must be non-zero.
    ///
    /// Defaults to [DEFAULT_PEERS_DUMP_INTERVAL]
    pub peers_dump_interval: Duration,
    /// How long a connection without active streams is kept open.
    ///
    /// Defaults to [DEFAULT_IDLE_CONNECTION_TIMEOUT]
    pub idle_connection_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home: PathBuf::from("."),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            relay: true,
            nat_port_map: true,
            dht_dump_interval: DEFAULT_DHT_DUMP_INTERVAL,
            peers_dump_interval: DEFAULT_PEERS_DUMP_INTERVAL,
            idle_connection_timeout: DEFAULT_IDLE_CONNECTION_TIMEOUT,
        }
    }
}

impl Config {
    /// Create a config rooted at `home`, everything else left to defaults.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Default::default()
        }
    }

    // === Options ===

    pub fn with_listen_addr(mut self, listen_addr: impl Into<String>) -> Self {
        self.listen_addr = listen_addr.into();
        self
    }

    pub fn with_relay(mut self, relay: bool) -> Self {
        self.relay = relay;
        self
    }

    pub fn with_nat_port_map(mut self, nat_port_map: bool) -> Self {
        self.nat_port_map = nat_port_map;
        self
    }

    /// Sets both dump intervals at once.
    pub fn with_dump_interval(mut self, interval: Duration) -> Self {
        self.dht_dump_interval = interval;
        self.peers_dump_interval = interval;
        self
    }

    /// Rejects values that would make the node misbehave at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.dht_dump_interval.is_zero() {
            return Err(Error::Config("dht dump interval must be non-zero"));
        }
        if self.peers_dump_interval.is_zero() {
            return Err(Error::Config("peers dump interval must be non-zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();

        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(config.relay);
        assert!(config.nat_port_map);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config::new("/tmp").with_dump_interval(Duration::ZERO);

        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.peers_dump_interval = Duration::ZERO;

        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
