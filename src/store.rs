//! Persistent backing store for the DHT.
//!
//! Records and provider records are served from an in-memory
//! [MemoryStore] and written through to a sled database, which is reloaded
//! on open. The routing table itself is persisted alongside, as a
//! `peer id -> addresses` snapshot, so a restarted node can hand out the
//! peers it knew before.

use std::borrow::Cow;
use std::fmt::{self, Debug, Formatter};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use libp2p::kad::store::{self, MemoryStore, RecordStore};
use libp2p::kad::{ProviderRecord, Record, RecordKey};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use tracing::{debug, info, warn, Span};

use crate::{Error, Result};

/// Name of the store directory inside the home directory.
pub const ROUTING_STORE_DIR: &str = "rt";

const RECORDS_TREE: &str = "records";
const PROVIDERS_TREE: &str = "providers";
const PEERS_TREE: &str = "peers";

/// Path of the routing store for a given home directory.
pub fn store_path(home: &Path) -> PathBuf {
    home.join(ROUTING_STORE_DIR)
}

/// Kademlia record store persisted on disk.
pub struct RoutingStore {
    path: PathBuf,
    db: sled::Db,
    records: sled::Tree,
    providers: sled::Tree,
    peers: sled::Tree,
    memory: MemoryStore,
    span: Span,
}

impl Debug for RoutingStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingStore")
            .field("path", &self.path)
            .field("records", &self.records.len())
            .field("providers", &self.providers.len())
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl RoutingStore {
    /// Open, or create, the store at `<home>/rt` and reload its content.
    ///
    /// Fails if the database can't be opened (disk error, another instance
    /// holding the lock) or holds corrupt entries.
    pub fn open(home: &Path, local_id: PeerId, span: Span) -> Result<Self> {
        let path = store_path(home);
        let db = sled::open(&path)?;

        let mut store = RoutingStore {
            records: db.open_tree(RECORDS_TREE)?,
            providers: db.open_tree(PROVIDERS_TREE)?,
            peers: db.open_tree(PEERS_TREE)?,
            memory: MemoryStore::new(local_id),
            path,
            db,
            span,
        };

        let (records, providers) = store.reload()?;

        store.span.in_scope(|| {
            info!(
                path = %store.path.display(),
                records,
                providers,
                peers = store.peers.len(),
                "Opened routing store"
            );
        });

        Ok(store)
    }

    // === Getters ===

    /// Directory the database lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // === Routing table snapshot ===

    /// Remember `peer` and its addresses, replacing any previous entry.
    pub fn save_peer<'a>(
        &self,
        peer: &PeerId,
        addresses: impl IntoIterator<Item = &'a Multiaddr>,
    ) -> Result<()> {
        let entry = PersistedPeer {
            addresses: addresses
                .into_iter()
                .map(|address| ByteBuf::from(address.to_vec()))
                .collect(),
        };

        self.peers
            .insert(peer.to_bytes(), serde_bencode::to_bytes(&entry)?)?;

        Ok(())
    }

    /// Forget a peer that left the routing table.
    pub fn remove_peer(&self, peer: &PeerId) -> Result<()> {
        self.peers.remove(peer.to_bytes())?;

        Ok(())
    }

    /// All persisted routing table entries.
    pub fn peers(&self) -> Result<Vec<(PeerId, Vec<Multiaddr>)>> {
        let mut peers = Vec::with_capacity(self.peers.len());

        for entry in self.peers.iter() {
            let (key, value) = entry?;

            let peer = PeerId::from_bytes(&key)
                .map_err(|error| Error::CorruptEntry(format!("peer id: {error}")))?;
            let persisted: PersistedPeer = serde_bencode::from_bytes(&value)?;

            peers.push((peer, decode_addresses(persisted.addresses)?));
        }

        Ok(peers)
    }

    /// Block until everything written so far is on disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;

        Ok(())
    }

    // === Private Methods ===

    /// Load persisted records and providers into memory, dropping the expired ones.
    fn reload(&mut self) -> Result<(usize, usize)> {
        let mut records = 0;
        let mut expired_records = Vec::new();

        for entry in self.records.iter() {
            let (key, value) = entry?;
            let persisted: PersistedRecord = serde_bencode::from_bytes(&value)?;

            let Some(record) = persisted.into_record(RecordKey::from(key.to_vec()))? else {
                expired_records.push(key);
                continue;
            };

            if let Err(error) = self.memory.put(record) {
                self.span
                    .in_scope(|| warn!(?error, "Skipping persisted record"));
                continue;
            }
            records += 1;
        }

        let mut providers = 0;
        let mut expired_providers = Vec::new();

        for entry in self.providers.iter() {
            let (key, value) = entry?;
            let persisted: PersistedProvider = serde_bencode::from_bytes(&value)?;

            let Some(record) = persisted.into_provider_record()? else {
                expired_providers.push(key);
                continue;
            };

            if let Err(error) = self.memory.add_provider(record) {
                self.span
                    .in_scope(|| warn!(?error, "Skipping persisted provider record"));
                continue;
            }
            providers += 1;
        }

        let expired = expired_records.len() + expired_providers.len();
        if expired > 0 {
            self.span
                .in_scope(|| debug!(expired, "Dropping expired entries"));
        }
        for key in expired_records {
            self.records.remove(key)?;
        }
        for key in expired_providers {
            self.providers.remove(key)?;
        }

        Ok((records, providers))
    }

    fn persist_record(&self, record: &Record) -> Result<()> {
        let persisted = PersistedRecord::from(record);

        self.records
            .insert(record.key.to_vec(), serde_bencode::to_bytes(&persisted)?)?;

        Ok(())
    }

    fn persist_provider(&self, record: &ProviderRecord) -> Result<()> {
        let persisted = PersistedProvider::from(record);

        self.providers.insert(
            provider_key(&record.key, &record.provider),
            serde_bencode::to_bytes(&persisted)?,
        )?;

        Ok(())
    }
}

impl RecordStore for RoutingStore {
    type RecordsIter<'a> = <MemoryStore as RecordStore>::RecordsIter<'a>;
    type ProvidedIter<'a> = <MemoryStore as RecordStore>::ProvidedIter<'a>;

    fn get(&self, k: &RecordKey) -> Option<Cow<'_, Record>> {
        self.memory.get(k)
    }

    fn put(&mut self, r: Record) -> store::Result<()> {
        self.memory.put(r.clone())?;

        if let Err(error) = self.persist_record(&r) {
            self.span
                .in_scope(|| warn!(?error, "Failed to persist record"));
        }

        Ok(())
    }

    fn remove(&mut self, k: &RecordKey) {
        self.memory.remove(k);

        if let Err(error) = self.records.remove(k.to_vec()) {
            self.span
                .in_scope(|| warn!(?error, "Failed to remove persisted record"));
        }
    }

    fn records(&self) -> Self::RecordsIter<'_> {
        self.memory.records()
    }

    fn add_provider(&mut self, record: ProviderRecord) -> store::Result<()> {
        self.memory.add_provider(record.clone())?;

        // The memory store silently drops providers past its per key limit.
        let kept = self
            .memory
            .providers(&record.key)
            .iter()
            .any(|p| p.provider == record.provider);
        if !kept {
            return Ok(());
        }

        if let Err(error) = self.persist_provider(&record) {
            self.span
                .in_scope(|| warn!(?error, "Failed to persist provider record"));
        }

        Ok(())
    }

    fn providers(&self, key: &RecordKey) -> Vec<ProviderRecord> {
        self.memory.providers(key)
    }

    fn provided(&self) -> Self::ProvidedIter<'_> {
        self.memory.provided()
    }

    fn remove_provider(&mut self, k: &RecordKey, p: &PeerId) {
        self.memory.remove_provider(k, p);

        if let Err(error) = self.providers.remove(provider_key(k, p)) {
            self.span
                .in_scope(|| warn!(?error, "Failed to remove persisted provider record"));
        }
    }
}

// === On disk formats ===

#[derive(Serialize, Deserialize, Debug)]
struct PersistedRecord {
    value: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    publisher: Option<ByteBuf>,
    /// Unix timestamp in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires: Option<u64>,
}

impl From<&Record> for PersistedRecord {
    fn from(record: &Record) -> Self {
        Self {
            value: ByteBuf::from(record.value.clone()),
            publisher: record
                .publisher
                .map(|publisher| ByteBuf::from(publisher.to_bytes())),
            expires: record.expires.map(to_unix),
        }
    }
}

impl PersistedRecord {
    /// Returns `None` if the record already expired.
    fn into_record(self, key: RecordKey) -> Result<Option<Record>> {
        let expires = match self.expires {
            Some(secs) => match from_unix(secs) {
                Some(instant) => Some(instant),
                None => return Ok(None),
            },
            None => None,
        };

        let publisher = self
            .publisher
            .map(|bytes| PeerId::from_bytes(&bytes))
            .transpose()
            .map_err(|error| Error::CorruptEntry(format!("record publisher: {error}")))?;

        Ok(Some(Record {
            key,
            value: self.value.into_vec(),
            publisher,
            expires,
        }))
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct PersistedProvider {
    key: ByteBuf,
    provider: ByteBuf,
    addresses: Vec<ByteBuf>,
    /// Unix timestamp in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires: Option<u64>,
}

impl From<&ProviderRecord> for PersistedProvider {
    fn from(record: &ProviderRecord) -> Self {
        Self {
            key: ByteBuf::from(record.key.to_vec()),
            provider: ByteBuf::from(record.provider.to_bytes()),
            addresses: record
                .addresses
                .iter()
                .map(|address| ByteBuf::from(address.to_vec()))
                .collect(),
            expires: record.expires.map(to_unix),
        }
    }
}

impl PersistedProvider {
    /// Returns `None` if the record already expired.
    fn into_provider_record(self) -> Result<Option<ProviderRecord>> {
        let expires = match self.expires {
            Some(secs) => match from_unix(secs) {
                Some(instant) => Some(instant),
                None => return Ok(None),
            },
            None => None,
        };

        let provider = PeerId::from_bytes(&self.provider)
            .map_err(|error| Error::CorruptEntry(format!("provider: {error}")))?;

        Ok(Some(ProviderRecord {
            key: RecordKey::from(self.key.into_vec()),
            provider,
            expires,
            addresses: decode_addresses(self.addresses)?,
        }))
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct PersistedPeer {
    addresses: Vec<ByteBuf>,
}

fn decode_addresses(addresses: Vec<ByteBuf>) -> Result<Vec<Multiaddr>> {
    addresses
        .into_iter()
        .map(|bytes| {
            Multiaddr::try_from(bytes.into_vec())
                .map_err(|error| Error::CorruptEntry(format!("address: {error}")))
        })
        .collect()
}

/// `len(key) as u64 || key || provider`, so keys of different lengths never collide.
fn provider_key(key: &RecordKey, provider: &PeerId) -> Vec<u8> {
    let key = key.to_vec();
    let provider = provider.to_bytes();

    let mut bytes = Vec::with_capacity(8 + key.len() + provider.len());
    bytes.extend_from_slice(&(key.len() as u64).to_be_bytes());
    bytes.extend_from_slice(&key);
    bytes.extend_from_slice(&provider);
    bytes
}

fn to_unix(expires: Instant) -> u64 {
    let remaining = expires.saturating_duration_since(Instant::now());

    (SystemTime::now() + remaining)
        .duration_since(UNIX_EPOCH)
        .map(|since_epoch| since_epoch.as_secs())
        .unwrap_or_default()
}

fn from_unix(secs: u64) -> Option<Instant> {
    let at = UNIX_EPOCH + Duration::from_secs(secs);

    at.duration_since(SystemTime::now())
        .ok()
        .map(|remaining| Instant::now() + remaining)
}
