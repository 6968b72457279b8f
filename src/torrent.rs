use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bag::{BagHeader, BagId, BagInfo, PieceMask};
use crate::connector::{Connector, HeaderResponse, PieceProvider, PieceResponse};
use crate::db::{Db, DbError, TorrentRecord};
use crate::peer::{PeerDirectory, PeerId, SpeedEma};
use crate::piece_tree::{self, PieceProof};
use crate::scheduler::Scheduler;
use crate::storage::StorageConfig;

pub const DATA_FILE_NAME: &str = "bag.data";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    /// Registered, never started.
    Created,
    /// Active, metadata not yet verified.
    ResolvingInfo,
    /// Active, fetching pieces.
    Downloading,
    /// All pieces verified; serving only.
    Seeding,
    Stopped,
    Removed,
}

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("content file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("file task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("header rejected: {0}")]
    HeaderRejected(&'static str),
    #[error("bag is not complete")]
    NotComplete,
    #[error("stored content is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct TorrentStats {
    pub bag_id: BagId,
    pub description: Option<String>,
    /// Verified payload bytes, per the accounting rule: zero until the
    /// header region is covered, then capped at the total payload.
    pub downloaded: u64,
    /// Total payload bytes, or zero while the info is unknown.
    pub total: u64,
    pub peers: usize,
    pub download_bps: u64,
    pub upload_bps: u64,
    pub completed: bool,
    pub status: TorrentStatus,
}

struct Shared {
    status: TorrentStatus,
    info: Option<BagInfo>,
    mask: PieceMask,
    active: bool,
    created_locally: bool,
}

struct RunHandle {
    cancel: CancellationToken,
    /// `None` for complete torrents, which run no scheduler.
    task: Option<JoinHandle<()>>,
}

/// One managed bag: its verified state, its peers, its on-disk content and
/// (while running) its scheduler actor.
pub struct Torrent {
    pub bag_id: BagId,
    path: PathBuf,
    db: Db,
    connector: Arc<dyn Connector>,
    config: StorageConfig,
    shared: Mutex<Shared>,
    peers: PeerDirectory,
    upload: Mutex<SpeedEma>,
    file: Mutex<Option<Arc<File>>>,
    runtime: tokio::sync::Mutex<Option<RunHandle>>,
}

impl Torrent {
    pub(crate) fn from_record(
        db: Db,
        connector: Arc<dyn Connector>,
        config: StorageConfig,
        record: TorrentRecord,
    ) -> Arc<Self> {
        Arc::new(Self {
            bag_id: record.bag_id,
            path: record.path,
            db,
            connector,
            config,
            shared: Mutex::new(Shared {
                status: TorrentStatus::Created,
                info: record.info,
                mask: record.mask,
                active: record.active,
                created_locally: record.created_locally,
            }),
            peers: PeerDirectory::new(),
            upload: Mutex::new(SpeedEma::new()),
            file: Mutex::new(None),
            runtime: tokio::sync::Mutex::new(None),
        })
    }

    /// Activates the torrent: persists it as active, announces it as a
    /// holder and spawns the scheduler unless the bag is already complete.
    /// Idempotent; a second call while running is a no-op.
    pub async fn start(self: &Arc<Self>, download_now: bool) -> Result<(), TorrentError> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            return Ok(());
        }

        let complete = {
            let mut shared = self.shared.lock().unwrap();
            shared.active = true;
            let complete = shared.info.is_some() && shared.mask.is_full();
            shared.status = if complete {
                TorrentStatus::Seeding
            } else if shared.info.is_some() {
                TorrentStatus::Downloading
            } else {
                TorrentStatus::ResolvingInfo
            };
            complete
        };
        if let Err(e) = self.persist().await {
            let mut shared = self.shared.lock().unwrap();
            shared.active = false;
            shared.status = TorrentStatus::Stopped;
            return Err(e.into());
        }

        self.connector
            .announce(self.bag_id, Arc::clone(self) as Arc<dyn PieceProvider>);

        let cancel = CancellationToken::new();
        let task = (!complete).then(|| {
            Scheduler::spawn(
                Arc::clone(self),
                self.config.clone(),
                cancel.clone(),
                download_now,
            )
        });
        *runtime = Some(RunHandle { cancel, task });
        info!(bag = %self.bag_id, complete, "torrent started");
        Ok(())
    }

    /// Deactivates the torrent: cancels the scheduler (aborting it after
    /// the grace period), withdraws the announce and persists the torrent
    /// as inactive. Verified progress is kept.
    pub async fn stop(&self) -> Result<(), TorrentError> {
        let handle = self.runtime.lock().await.take();
        let Some(handle) = handle else {
            return Ok(());
        };
        self.shutdown_runtime(handle).await;

        {
            let mut shared = self.shared.lock().unwrap();
            shared.active = false;
            if shared.status != TorrentStatus::Removed {
                shared.status = TorrentStatus::Stopped;
            }
        }
        self.persist().await?;
        info!(bag = %self.bag_id, "torrent stopped");
        Ok(())
    }

    /// Like `stop` but leaves the durable record untouched, so the torrent
    /// resumes as active after a restart. Used at process shutdown.
    pub(crate) async fn halt(&self) {
        let handle = self.runtime.lock().await.take();
        if let Some(handle) = handle {
            self.shutdown_runtime(handle).await;
        }
    }

    async fn shutdown_runtime(&self, handle: RunHandle) {
        handle.cancel.cancel();
        if let Some(mut task) = handle.task {
            if tokio::time::timeout(self.config.stop_grace, &mut task)
                .await
                .is_err()
            {
                warn!(bag = %self.bag_id, "scheduler did not stop in time, aborting");
                task.abort();
            }
        }
        self.connector.withdraw(self.bag_id);
        self.peers.clear();
    }

    /// Stops the torrent and deletes its durable record and proofs, and
    /// optionally the on-disk content. Terminal.
    pub(crate) async fn remove(&self, remove_data: bool) -> Result<(), TorrentError> {
        if let Err(e) = self.stop().await {
            warn!(bag = %self.bag_id, "stop during removal failed: {e}");
        }
        // a failed delete leaves the torrent Stopped and retryable
        self.db.remove_torrent(&self.bag_id).await?;
        self.shared.lock().unwrap().status = TorrentStatus::Removed;
        if remove_data {
            match tokio::fs::remove_dir_all(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(bag = %self.bag_id, "torrent removed");
        Ok(())
    }

    pub fn status(&self) -> TorrentStatus {
        self.shared.lock().unwrap().status
    }

    pub fn info(&self) -> Option<BagInfo> {
        self.shared.lock().unwrap().info.clone()
    }

    pub fn is_complete(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.info.is_some() && shared.mask.is_full()
    }

    pub(crate) fn mask_snapshot(&self) -> PieceMask {
        self.shared.lock().unwrap().mask.clone()
    }

    pub(crate) fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::clone(&self.connector)
    }

    pub fn stats(&self) -> TorrentStats {
        let (status, info, downloaded) = {
            let shared = self.shared.lock().unwrap();
            (
                shared.status,
                shared.info.clone(),
                shared
                    .info
                    .as_ref()
                    .map(|i| i.downloaded_bytes(&shared.mask))
                    .unwrap_or(0),
            )
        };
        let (download_bps, _) = self.peers.total_rates();
        TorrentStats {
            bag_id: self.bag_id,
            description: info.as_ref().map(|i| i.description.clone()),
            downloaded,
            total: info.as_ref().map(BagInfo::total_payload).unwrap_or(0),
            peers: self.peers.len(),
            download_bps,
            upload_bps: self.upload.lock().unwrap().bytes_per_sec(),
            completed: self.is_complete(),
            status,
        }
    }

    pub(crate) fn enter_seeding(&self) {
        let mut shared = self.shared.lock().unwrap();
        if shared.active && shared.status != TorrentStatus::Removed {
            shared.status = TorrentStatus::Seeding;
            info!(bag = %self.bag_id, "download complete, seeding");
        }
    }

    /// Accepts a verified header response: the metadata becomes this
    /// torrent's immutable info and piece 0 its first verified piece.
    pub(crate) async fn apply_header(&self, response: HeaderResponse) -> Result<(), TorrentError> {
        if self.shared.lock().unwrap().info.is_some() {
            return Ok(());
        }
        let HeaderResponse {
            info,
            piece0,
            proof,
        } = response;
        info.validate().map_err(TorrentError::HeaderRejected)?;
        if piece0.len() != info.piece_len(0) as usize {
            return Err(TorrentError::HeaderRejected("wrong first piece length"));
        }
        if proof.siblings.len() != piece_tree::tree_depth(info.piece_count()) {
            return Err(TorrentError::HeaderRejected("wrong proof depth"));
        }
        if !piece_tree::verify_piece(&self.bag_id, 0, &piece0, &proof) {
            return Err(TorrentError::HeaderRejected("proof does not verify"));
        }
        if info.header_size <= piece0.len() as u64 {
            let header = BagHeader::decode(&piece0[..info.header_size as usize])
                .map_err(|_| TorrentError::HeaderRejected("header does not decode"))?;
            if header.description != info.description {
                return Err(TorrentError::HeaderRejected("description mismatch"));
            }
        }

        self.write_piece(&info, 0, piece0).await?;
        self.db.put_proof(&self.bag_id, 0, &proof).await?;

        let mut mask = PieceMask::new(info.piece_count());
        mask.set(0);
        let record = self.record_with(Some(info.clone()), mask.clone(), true);
        self.db.put_torrent(&record).await?;

        let mut shared = self.shared.lock().unwrap();
        shared.info = Some(info);
        shared.mask = mask;
        if shared.status == TorrentStatus::ResolvingInfo {
            shared.status = TorrentStatus::Downloading;
        }
        Ok(())
    }

    /// Stores one verified piece: data write and sync, proof put, then the
    /// record with the new mask bit. The in-memory bit is set only after
    /// the record landed, so a set bit always means durably stored.
    pub(crate) async fn commit_piece(
        &self,
        index: u32,
        data: Bytes,
        proof: PieceProof,
    ) -> Result<(), TorrentError> {
        let (info, mut mask) = {
            let shared = self.shared.lock().unwrap();
            let Some(info) = shared.info.clone() else {
                return Err(TorrentError::HeaderRejected("info unknown"));
            };
            (info, shared.mask.clone())
        };
        if index >= info.piece_count() || mask.get(index) {
            return Ok(());
        }

        self.write_piece(&info, index, data).await?;
        self.db.put_proof(&self.bag_id, index, &proof).await?;

        mask.set(index);
        let record = self.record_with(Some(info), mask, true);
        self.db.put_torrent(&record).await?;

        self.shared.lock().unwrap().mask.set(index);
        Ok(())
    }

    fn record_with(&self, info: Option<BagInfo>, mask: PieceMask, active: bool) -> TorrentRecord {
        TorrentRecord {
            bag_id: self.bag_id,
            path: self.path.clone(),
            info,
            mask,
            active,
            created_locally: self.shared.lock().unwrap().created_locally,
        }
    }

    async fn persist(&self) -> Result<(), DbError> {
        let record = {
            let shared = self.shared.lock().unwrap();
            TorrentRecord {
                bag_id: self.bag_id,
                path: self.path.clone(),
                info: shared.info.clone(),
                mask: shared.mask.clone(),
                active: shared.active,
                created_locally: shared.created_locally,
            }
        };
        self.db.put_torrent(&record).await
    }

    fn data_file(&self) -> std::io::Result<Arc<File>> {
        let mut slot = self.file.lock().unwrap();
        if let Some(file) = slot.as_ref() {
            return Ok(Arc::clone(file));
        }
        std::fs::create_dir_all(&self.path)?;
        let file = Arc::new(
            std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.path.join(DATA_FILE_NAME))?,
        );
        *slot = Some(Arc::clone(&file));
        Ok(file)
    }

    async fn write_piece(
        &self,
        info: &BagInfo,
        index: u32,
        data: Bytes,
    ) -> Result<(), TorrentError> {
        let file = self.data_file()?;
        let offset = index as u64 * info.piece_size as u64;
        tokio::task::spawn_blocking(move || {
            file.write_all_at(&data, offset)?;
            file.sync_data()
        })
        .await??;
        Ok(())
    }

    async fn read_piece(&self, info: &BagInfo, index: u32) -> Result<Vec<u8>, TorrentError> {
        let file = self.data_file()?;
        let offset = index as u64 * info.piece_size as u64;
        let len = info.piece_len(index) as usize;
        let data = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok::<_, std::io::Error>(buf)
        })
        .await??;
        Ok(data)
    }

    fn record_upload(&self, from: &PeerId, bytes: u64) {
        self.upload.lock().unwrap().record(bytes);
        self.peers.record_upload(from, bytes);
    }

    /// Splits the completed content back into its files under `dest`,
    /// using the directory metadata from the header region.
    pub async fn extract(&self, dest: &Path) -> Result<(), TorrentError> {
        let info = {
            let shared = self.shared.lock().unwrap();
            if shared.info.is_none() || !shared.mask.is_full() {
                return Err(TorrentError::NotComplete);
            }
            shared.info.clone().ok_or(TorrentError::NotComplete)?
        };
        let file = self.data_file()?;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_blocking(&file, &info, &dest)).await?
    }
}

fn extract_blocking(file: &File, info: &BagInfo, dest: &Path) -> Result<(), TorrentError> {
    let mut header_bytes = vec![0u8; info.header_size as usize];
    file.read_exact_at(&mut header_bytes, 0)?;
    let header = BagHeader::decode(&header_bytes)
        .map_err(|e| TorrentError::Corrupt(format!("header does not decode: {e}")))?;

    let mut offset = info.header_size;
    for entry in &header.files {
        let name = Path::new(&entry.name);
        if name.is_absolute()
            || name
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(TorrentError::Corrupt(format!(
                "unsafe file name {:?}",
                entry.name
            )));
        }
        // entry.size comes from the header, which a hostile creator controls
        let end = offset
            .checked_add(entry.size)
            .ok_or_else(|| TorrentError::Corrupt("file past content end".into()))?;
        if end > info.file_size {
            return Err(TorrentError::Corrupt("file past content end".into()));
        }
        let target = dest.join(name);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        let mut remaining = entry.size;
        let mut buf = vec![0u8; 1 << 20];
        while remaining > 0 {
            let chunk = buf.len().min(remaining as usize);
            file.read_exact_at(&mut buf[..chunk], offset)?;
            std::io::Write::write_all(&mut out, &buf[..chunk])?;
            offset += chunk as u64;
            remaining -= chunk as u64;
        }
    }
    Ok(())
}

#[async_trait]
impl PieceProvider for Torrent {
    async fn header(&self, from: PeerId) -> Option<HeaderResponse> {
        let info = {
            let shared = self.shared.lock().unwrap();
            if !shared.active || !shared.mask.get(0) {
                return None;
            }
            shared.info.clone()?
        };
        let data = self.read_piece(&info, 0).await.ok()?;
        let proof = self.db.get_proof(&self.bag_id, 0).await.ok()??;
        self.record_upload(&from, data.len() as u64);
        Some(HeaderResponse {
            info,
            piece0: data.into(),
            proof,
        })
    }

    async fn piece(&self, from: PeerId, index: u32) -> Option<PieceResponse> {
        let info = {
            let shared = self.shared.lock().unwrap();
            if !shared.active || !shared.mask.get(index) {
                return None;
            }
            shared.info.clone()?
        };
        let data = self.read_piece(&info, index).await.ok()?;
        let proof = self.db.get_proof(&self.bag_id, index).await.ok()??;
        self.record_upload(&from, data.len() as u64);
        Some(PieceResponse {
            data: data.into(),
            proof,
        })
    }
}
