//! Durable metadata store using RocksDB
//!
//! The persistence collaborator of the transaction coordinator: volumes,
//! snapshots, and peers are written here after every successful local
//! commit, and loaded back at daemon start. A store failure during commit
//! is treated exactly like a peer commit failure.

use crate::cluster::peer::Peer;
use crate::cluster::snapshot::Snapshot;
use crate::cluster::volume::Volume;
use crate::common::{Error, Result};
use rocksdb::{Options, DB};
use std::path::Path;
use uuid::Uuid;

const CF_VOLUMES: &str = "volumes";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_PEERS: &str = "peers";
const CF_META: &str = "meta";

const KEY_LOCAL_ID: &str = "local_id";
const KEY_CLUSTER_OPTIONS: &str = "cluster_options";

pub struct MetaStore {
    db: DB,
}

impl MetaStore {
    /// Open or create the metadata store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(
            &opts,
            path,
            vec![CF_VOLUMES, CF_SNAPSHOTS, CF_PEERS, CF_META],
        )?;

        Ok(Self { db })
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| Error::Internal(format!("serialize error: {}", e)))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| Error::MetadataCorrupted(e.to_string()))
    }

    // === Local identity ===

    /// Load the persisted node identity, generating and saving one on first
    /// start.
    pub fn local_id(&self) -> Result<Uuid> {
        let cf = self.db.cf_handle(CF_META).unwrap();
        if let Some(bytes) = self.db.get_cf(cf, KEY_LOCAL_ID)? {
            let raw: [u8; 16] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::MetadataCorrupted("local id".into()))?;
            return Ok(Uuid::from_bytes(raw));
        }
        let id = Uuid::new_v4();
        self.db.put_cf(cf, KEY_LOCAL_ID, id.as_bytes())?;
        Ok(id)
    }

    // === Volumes ===

    pub fn save_volume(&self, volume: &Volume) -> Result<()> {
        let cf = self.db.cf_handle(CF_VOLUMES).unwrap();
        self.db
            .put_cf(cf, volume.name.as_bytes(), Self::encode(volume)?)?;
        Ok(())
    }

    pub fn delete_volume(&self, name: &str) -> Result<()> {
        let cf = self.db.cf_handle(CF_VOLUMES).unwrap();
        self.db.delete_cf(cf, name.as_bytes())?;
        Ok(())
    }

    pub fn load_volumes(&self) -> Result<Vec<Volume>> {
        let cf = self.db.cf_handle(CF_VOLUMES).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut volumes = Vec::new();
        for item in iter {
            let (_, value) = item?;
            volumes.push(Self::decode(&value)?);
        }
        Ok(volumes)
    }

    // === Snapshots ===

    pub fn save_snapshot(&self, snap: &Snapshot) -> Result<()> {
        let cf = self.db.cf_handle(CF_SNAPSHOTS).unwrap();
        self.db.put_cf(cf, snap.name.as_bytes(), Self::encode(snap)?)?;
        Ok(())
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        let cf = self.db.cf_handle(CF_SNAPSHOTS).unwrap();
        self.db.delete_cf(cf, name.as_bytes())?;
        Ok(())
    }

    pub fn load_snapshots(&self) -> Result<Vec<Snapshot>> {
        let cf = self.db.cf_handle(CF_SNAPSHOTS).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut snapshots = Vec::new();
        for item in iter {
            let (_, value) = item?;
            snapshots.push(Self::decode(&value)?);
        }
        Ok(snapshots)
    }

    // === Peers ===

    pub fn save_peer(&self, peer: &Peer) -> Result<()> {
        let cf = self.db.cf_handle(CF_PEERS).unwrap();
        self.db
            .put_cf(cf, peer.id.as_bytes(), Self::encode(peer)?)?;
        Ok(())
    }

    pub fn delete_peer(&self, id: &Uuid) -> Result<()> {
        let cf = self.db.cf_handle(CF_PEERS).unwrap();
        self.db.delete_cf(cf, id.as_bytes())?;
        Ok(())
    }

    pub fn load_peers(&self) -> Result<Vec<Peer>> {
        let cf = self.db.cf_handle(CF_PEERS).unwrap();
        let iter = self.db.iterator_cf(cf, rocksdb::IteratorMode::Start);

        let mut peers = Vec::new();
        for item in iter {
            let (_, value) = item?;
            peers.push(Self::decode(&value)?);
        }
        Ok(peers)
    }

    // === Cluster options ===

    pub fn save_options(&self, options: &std::collections::BTreeMap<String, String>) -> Result<()> {
        let cf = self.db.cf_handle(CF_META).unwrap();
        self.db
            .put_cf(cf, KEY_CLUSTER_OPTIONS, Self::encode(options)?)?;
        Ok(())
    }

    pub fn load_options(&self) -> Result<std::collections::BTreeMap<String, String>> {
        let cf = self.db.cf_handle(CF_META).unwrap();
        match self.db.get_cf(cf, KEY_CLUSTER_OPTIONS)? {
            Some(bytes) => Self::decode(&bytes),
            None => Ok(Default::default()),
        }
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_volume_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.db")).unwrap();

        let mut vol = Volume::new("vol1");
        vol.options
            .insert("performance.cache-size".into(), "128MB".into());
        vol.bump_version();
        store.save_volume(&vol).unwrap();

        let loaded = store.load_volumes().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "vol1");
        assert_eq!(loaded[0].version, vol.version);
        assert_eq!(loaded[0].checksum, vol.checksum);

        store.delete_volume("vol1").unwrap();
        assert!(store.load_volumes().unwrap().is_empty());
    }

    #[test]
    fn test_local_id_stable_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.db");

        let first = {
            let store = MetaStore::open(&path).unwrap();
            store.local_id().unwrap()
        };
        let second = {
            let store = MetaStore::open(&path).unwrap();
            store.local_id().unwrap()
        };
        assert_eq!(first, second);
    }

    #[test]
    fn test_peer_and_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("meta.db")).unwrap();

        let peer = Peer::new(Uuid::new_v4(), "node-a", "http://node-a:24008");
        store.save_peer(&peer).unwrap();
        let snap = Snapshot::new("nightly", Some("before upgrade".into()));
        store.save_snapshot(&snap).unwrap();

        assert_eq!(store.load_peers().unwrap().len(), 1);
        assert_eq!(store.load_snapshots().unwrap()[0].name, "nightly");

        store.delete_peer(&peer.id).unwrap();
        store.delete_snapshot("nightly").unwrap();
        assert!(store.load_peers().unwrap().is_empty());
        assert!(store.load_snapshots().unwrap().is_empty());
    }
}
