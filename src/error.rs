//! Main Crate Error

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
/// Bootstrap node error enum.
pub enum Error {
    /// The node key file does not exist. Bootstrap nodes never run with an
    /// ephemeral identity.
    #[error("Node key not found at {0}")]
    IdentityMissing(PathBuf),

    /// The node key file exists but could not be read.
    #[error("Failed to read node key at {path}: {source}")]
    IdentityRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The node key file could not be decoded into a private key.
    #[error("Invalid node key at {path}: {reason}")]
    InvalidIdentity { path: PathBuf, reason: String },

    /// Refusing to overwrite an existing node key.
    #[error("Node key already exists at {0}")]
    IdentityExists(PathBuf),

    #[error("Invalid listen address {addr:?}: {source}")]
    /// Listen address is not a valid multiaddress.
    InvalidListenAddr {
        addr: String,
        source: libp2p::multiaddr::Error,
    },

    #[error("Failed to listen on {addr}: {reason}")]
    /// The transport could not bind the listen address.
    Listen { addr: String, reason: String },

    #[error("Failed to build network host: {0}")]
    /// Transport or behaviour construction failed.
    Transport(String),

    #[error("Failed to open routing store: {0}")]
    /// The embedded routing store could not be opened or written.
    Store(#[from] sled::Error),

    #[error("Failed to decode persisted entry: {0}")]
    /// A persisted routing entry is corrupt.
    BencodeError(#[from] serde_bencode::Error),

    #[error("Corrupt persisted entry: {0}")]
    /// A persisted entry decoded but holds invalid peer ids or addresses.
    CorruptEntry(String),

    #[error("Invalid configuration: {0}")]
    /// Configuration values out of range.
    Config(&'static str),

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// The DHT driver task is no longer running.
    #[error("Dht was shutdown")]
    DhtWasShutdown,
}

/// Crate result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
