use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bag::{BagId, BagInfo, PieceMask};
use crate::piece_tree::PieceProof;

const BAG_PREFIX: &[u8] = b"bag/";
const PROOF_PREFIX: &[u8] = b"proof/";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("could not open store at {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not encode record: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("stored record is corrupt: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Durable key-value store the engine persists through. Every `put` must be
/// atomic: a key holds either its previous value or the new one, never a
/// torn write.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DbError>;
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError>;
    async fn delete(&self, key: &[u8]) -> Result<(), DbError>;
    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError>;
}

/// Non-durable store for tests.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DbError> {
        self.entries.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// One file per key under a root directory, named by the hex of the key.
/// Writes go through a temp file, fsync and rename so each put is atomic.
#[derive(Debug)]
pub struct DiskKv {
    root: PathBuf,
}

impl DiskKv {
    pub fn open(root: impl Into<PathBuf>) -> Result<Arc<Self>, DbError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| DbError::Open {
            path: root.clone(),
            source,
        })?;
        Ok(Arc::new(Self { root }))
    }

    fn key_path(&self, key: &[u8]) -> PathBuf {
        self.root.join(hex::encode(key))
    }
}

#[async_trait]
impl KvStore for DiskKv {
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), DbError> {
        let root = self.root.clone();
        let path = self.key_path(key);
        tokio::task::spawn_blocking(move || {
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            tmp.write_all(&value)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await?
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let path = self.key_path(key);
        tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await?
    }

    async fn delete(&self, key: &[u8]) -> Result<(), DbError> {
        let path = self.key_path(key);
        tokio::task::spawn_blocking(move || match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        })
        .await?
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let root = self.root.clone();
        let prefix = prefix.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in std::fs::read_dir(&root)? {
                let entry = entry?;
                let name = entry.file_name();
                // temp files and anything not hex-named are not keys
                let Ok(key) = hex::decode(name.to_string_lossy().as_ref()) else {
                    continue;
                };
                if !key.starts_with(&prefix) {
                    continue;
                }
                out.push((key, std::fs::read(entry.path())?));
            }
            out.sort_by(|(a, _), (b, _)| a.cmp(b));
            Ok(out)
        })
        .await?
    }
}

/// Everything the engine must remember about one torrent to survive a
/// restart. Rewritten in full after every verified piece; the mask bit for
/// a piece is set only after its data has durably landed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentRecord {
    pub bag_id: BagId,
    /// Directory holding the content file.
    pub path: PathBuf,
    /// `None` until the header has been resolved and verified.
    pub info: Option<BagInfo>,
    pub mask: PieceMask,
    /// Whether the torrent should be running after a restart.
    pub active: bool,
    pub created_locally: bool,
}

/// Typed layer over the raw store: torrent records under `bag/<id>`,
/// per-piece proofs under `proof/<id><be32 index>`.
#[derive(Clone)]
pub struct Db {
    kv: Arc<dyn KvStore>,
}

fn bag_key(id: &BagId) -> Vec<u8> {
    [BAG_PREFIX, &id.0[..]].concat()
}

fn proof_prefix(id: &BagId) -> Vec<u8> {
    [PROOF_PREFIX, &id.0[..]].concat()
}

fn proof_key(id: &BagId, index: u32) -> Vec<u8> {
    [PROOF_PREFIX, &id.0[..], &index.to_be_bytes()[..]].concat()
}

impl Db {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn put_torrent(&self, record: &TorrentRecord) -> Result<(), DbError> {
        let bytes = bincode::serde::encode_to_vec(record, bincode::config::standard())?;
        self.kv.put(&bag_key(&record.bag_id), bytes).await
    }

    pub async fn get_torrent(&self, id: &BagId) -> Result<Option<TorrentRecord>, DbError> {
        match self.kv.get(&bag_key(id)).await? {
            Some(bytes) => {
                let (record, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Drops the record and every proof stored for the bag.
    pub async fn remove_torrent(&self, id: &BagId) -> Result<(), DbError> {
        self.kv.delete(&bag_key(id)).await?;
        for (key, _) in self.kv.scan_prefix(&proof_prefix(id)).await? {
            self.kv.delete(&key).await?;
        }
        Ok(())
    }

    pub async fn all_torrents(&self) -> Result<Vec<TorrentRecord>, DbError> {
        let mut out = Vec::new();
        for (_, bytes) in self.kv.scan_prefix(BAG_PREFIX).await? {
            let (record, _) =
                bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
            out.push(record);
        }
        Ok(out)
    }

    pub async fn put_proof(
        &self,
        id: &BagId,
        index: u32,
        proof: &PieceProof,
    ) -> Result<(), DbError> {
        let bytes = bincode::serde::encode_to_vec(proof, bincode::config::standard())?;
        self.kv.put(&proof_key(id, index), bytes).await
    }

    pub async fn get_proof(&self, id: &BagId, index: u32) -> Result<Option<PieceProof>, DbError> {
        match self.kv.get(&proof_key(id, index)).await? {
            Some(bytes) => {
                let (proof, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
                Ok(Some(proof))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u8) -> TorrentRecord {
        TorrentRecord {
            bag_id: BagId([id; 32]),
            path: PathBuf::from("/tmp/bag"),
            info: Some(BagInfo {
                file_size: 1000,
                header_size: 40,
                piece_size: 256,
                description: "r".into(),
            }),
            mask: PieceMask::new(4),
            active: true,
            created_locally: false,
        }
    }

    #[tokio::test]
    async fn memory_record_round_trip() {
        let db = Db::new(MemoryKv::new());
        let mut rec = record(1);
        rec.mask.set(2);
        db.put_torrent(&rec).await.unwrap();

        let loaded = db.get_torrent(&rec.bag_id).await.unwrap().unwrap();
        assert_eq!(loaded.mask, rec.mask);
        assert_eq!(loaded.info, rec.info);
        assert!(db.get_torrent(&BagId([9; 32])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn all_torrents_sees_only_records() {
        let db = Db::new(MemoryKv::new());
        db.put_torrent(&record(1)).await.unwrap();
        db.put_torrent(&record(2)).await.unwrap();
        db.put_proof(
            &BagId([1; 32]),
            0,
            &PieceProof { siblings: vec![] },
        )
        .await
        .unwrap();

        assert_eq!(db.all_torrents().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn remove_drops_proofs_too() {
        let db = Db::new(MemoryKv::new());
        let rec = record(3);
        db.put_torrent(&rec).await.unwrap();
        for i in 0..4 {
            db.put_proof(&rec.bag_id, i, &PieceProof { siblings: vec![[i as u8; 32]] })
                .await
                .unwrap();
        }
        let other = BagId([4; 32]);
        db.put_proof(&other, 0, &PieceProof { siblings: vec![] })
            .await
            .unwrap();

        db.remove_torrent(&rec.bag_id).await.unwrap();
        assert!(db.get_torrent(&rec.bag_id).await.unwrap().is_none());
        assert!(db.get_proof(&rec.bag_id, 0).await.unwrap().is_none());
        assert!(db.get_proof(&other, 0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disk_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = DiskKv::open(dir.path().join("db")).unwrap();
        kv.put(b"bag/a", vec![1, 2, 3]).await.unwrap();
        kv.put(b"bag/b", vec![4]).await.unwrap();
        kv.put(b"other", vec![5]).await.unwrap();

        assert_eq!(kv.get(b"bag/a").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(kv.get(b"missing").await.unwrap(), None);

        let scanned = kv.scan_prefix(b"bag/").await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].0, b"bag/a");

        kv.delete(b"bag/a").await.unwrap();
        kv.delete(b"bag/a").await.unwrap();
        assert_eq!(kv.get(b"bag/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let kv = DiskKv::open(dir.path()).unwrap();
            kv.put(b"bag/x", vec![7; 100]).await.unwrap();
        }
        let kv = DiskKv::open(dir.path()).unwrap();
        assert_eq!(kv.get(b"bag/x").await.unwrap(), Some(vec![7; 100]));
    }
}
