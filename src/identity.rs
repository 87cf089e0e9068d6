//! Node identity loading.
//!
//! A bootstrap node is only useful if its peer id never changes, since peers
//! hardcode it next to its address. The key is therefore provisioned once and
//! read on every start; it is never generated on the fly.

use std::{fs, io, path::Path, path::PathBuf};

use ed25519_dalek::SigningKey;
use libp2p::{identity::Keypair, PeerId};
use rand::rngs::OsRng;
use tracing::{debug, info, Span};

use crate::{Error, Result};

/// File name of the private key inside the home directory.
pub const NODE_KEY_FILE: &str = "node_key";

/// Path of the node key for a given home directory.
pub fn key_path(home: &Path) -> PathBuf {
    home.join(NODE_KEY_FILE)
}

/// Load the node keypair from `<home>/node_key`.
///
/// The file holds a protobuf encoded libp2p private key. A missing or
/// undecodable file is an error, no fallback identity is attempted.
pub fn load(home: &Path, span: &Span) -> Result<Keypair> {
    span.in_scope(|| {
        let path = key_path(home);

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(Error::IdentityMissing(path));
            }
            Err(source) => {
                return Err(Error::IdentityRead { path, source });
            }
        };

        let keypair =
            Keypair::from_protobuf_encoding(&bytes).map_err(|error| Error::InvalidIdentity {
                path: path.clone(),
                reason: error.to_string(),
            })?;

        debug!(path = %path.display(), peer_id = %keypair.public().to_peer_id(), "Loaded node key");

        Ok(keypair)
    })
}

/// Generate a new Ed25519 node key and write it to `<home>/node_key`.
///
/// Refuses to overwrite an existing key, since that would change the peer id
/// every other peer knows this node by.
pub fn provision(home: &Path, span: &Span) -> Result<PeerId> {
    span.in_scope(|| {
        let path = key_path(home);

        if path.exists() {
            return Err(Error::IdentityExists(path));
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let keypair = Keypair::ed25519_from_bytes(signing_key.to_bytes()).map_err(|error| {
            Error::InvalidIdentity {
                path: path.clone(),
                reason: error.to_string(),
            }
        })?;
        let encoded = keypair
            .to_protobuf_encoding()
            .map_err(|error| Error::InvalidIdentity {
                path: path.clone(),
                reason: error.to_string(),
            })?;

        fs::create_dir_all(home)?;
        fs::write(&path, encoded)?;

        let peer_id = keypair.public().to_peer_id();
        info!(path = %path.display(), %peer_id, "Provisioned node key");

        Ok(peer_id)
    })
}
