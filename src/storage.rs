use std::collections::HashMap;
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::bag::{
    BagHeader, BagId, BagIdError, BagInfo, FileEntry, PieceMask, MAX_DESCRIPTION_LEN,
    MAX_PIECES, MAX_PIECE_SIZE,
};
use crate::connector::Connector;
use crate::db::{Db, DbError, KvStore, TorrentRecord};
use crate::piece_tree::PieceTree;
use crate::torrent::{Torrent, TorrentError, TorrentStats, DATA_FILE_NAME};

/// Tunables of one engine instance. No ambient globals; everything the
/// engine needs is handed to `Storage::open`.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Concurrent piece fetches per torrent.
    pub max_inflight_per_torrent: usize,
    /// Concurrent requests to one peer.
    pub max_inflight_per_peer: u32,
    /// Budget for a single header or piece request.
    pub request_timeout: Duration,
    /// Dial attempts per discovered peer before it is skipped.
    pub connect_attempts: u32,
    /// Delay after the first failed dial, doubled per attempt.
    pub connect_backoff: Duration,
    /// How long `stop` waits for the scheduler before aborting it.
    pub stop_grace: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_inflight_per_torrent: 16,
            max_inflight_per_peer: 4,
            request_timeout: Duration::from_secs(10),
            connect_attempts: 4,
            connect_backoff: Duration::from_millis(250),
            stop_grace: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Torrent(#[from] TorrentError),
    #[error(transparent)]
    BadBagId(#[from] BagIdError),
    #[error("io failed on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("piece size {0} out of range")]
    InvalidPieceSize(u32),
    #[error("description longer than {MAX_DESCRIPTION_LEN} bytes")]
    DescriptionTooLong,
    #[error("source {0} holds no files")]
    EmptySource(PathBuf),
    #[error("content would need too many pieces")]
    TooManyPieces,
    #[error("unknown bag {0}")]
    NotFound(BagId),
}

/// The engine: every known torrent keyed by bag id, plus the shared
/// store, connector and config they run with.
pub struct Storage {
    db: Db,
    connector: Arc<dyn Connector>,
    config: StorageConfig,
    root: PathBuf,
    torrents: RwLock<HashMap<BagId, Arc<Torrent>>>,
}

impl Storage {
    /// Opens the engine over a durable store: reloads every known torrent
    /// from it (no peer contact) and restarts the ones that were active.
    /// A torrent that fails to restart is kept registered and logged; only
    /// a store that cannot be read is fatal.
    pub async fn open(
        kv: Arc<dyn KvStore>,
        connector: Arc<dyn Connector>,
        root: impl Into<PathBuf>,
        config: StorageConfig,
    ) -> Result<Arc<Self>, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| StorageError::Io {
            path: root.clone(),
            source,
        })?;
        let db = Db::new(kv);
        let records = db.all_torrents().await?;

        let storage = Arc::new(Self {
            db: db.clone(),
            connector: Arc::clone(&connector),
            config: config.clone(),
            root,
            torrents: RwLock::new(HashMap::new()),
        });

        let mut to_start = Vec::new();
        {
            let mut torrents = storage.torrents.write().unwrap();
            for record in records {
                let active = record.active;
                let torrent = Torrent::from_record(
                    db.clone(),
                    Arc::clone(&connector),
                    config.clone(),
                    record,
                );
                if active {
                    to_start.push(Arc::clone(&torrent));
                }
                torrents.insert(torrent.bag_id, torrent);
            }
        }
        info!(
            torrents = storage.torrents.read().unwrap().len(),
            resuming = to_start.len(),
            "storage opened"
        );

        for (torrent, result) in to_start
            .iter()
            .zip(join_all(to_start.iter().map(|t| t.start(true))).await)
        {
            if let Err(e) = result {
                warn!(bag = %torrent.bag_id, "could not resume torrent: {e}");
            }
        }
        Ok(storage)
    }

    /// Builds a bag from a file or directory and starts seeding it.
    /// Content-addressed: if the content hashes to an already registered
    /// bag id, that existing torrent is restarted and returned.
    pub async fn create_bag(
        &self,
        source: &Path,
        description: &str,
        piece_size: u32,
    ) -> Result<Arc<Torrent>, StorageError> {
        if piece_size == 0 || piece_size > MAX_PIECE_SIZE {
            return Err(StorageError::InvalidPieceSize(piece_size));
        }
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(StorageError::DescriptionTooLong);
        }

        let source = source.to_path_buf();
        let description = description.to_string();
        let root = self.root.clone();
        let (content, tree, file_size, header_size) = {
            let description = description.clone();
            tokio::task::spawn_blocking(move || {
                assemble_content(&root, &source, &description, piece_size)
            })
            .await
            .map_err(DbError::Task)??
        };
        if file_size.div_ceil(piece_size as u64) > MAX_PIECES {
            return Err(StorageError::TooManyPieces);
        }

        let bag_id = tree.bag_id();
        if let Some(existing) = self.get(&bag_id) {
            existing.start(true).await?;
            return Ok(existing);
        }

        let dir = self.root.join("bags").join(bag_id.to_string());
        std::fs::create_dir_all(&dir).map_err(|source| StorageError::Io {
            path: dir.clone(),
            source,
        })?;
        let data_path = dir.join(DATA_FILE_NAME);
        content
            .persist(&data_path)
            .map_err(|e| StorageError::Io {
                path: data_path.clone(),
                source: e.error,
            })?;

        for index in 0..tree.leaf_count() {
            if let Some(proof) = tree.proof(index) {
                self.db.put_proof(&bag_id, index, &proof).await?;
            }
        }
        let info = BagInfo {
            file_size,
            header_size,
            piece_size,
            description,
        };
        let record = TorrentRecord {
            bag_id,
            path: dir,
            info: Some(info),
            mask: PieceMask::full(tree.leaf_count()),
            active: true,
            created_locally: true,
        };
        self.db.put_torrent(&record).await?;

        let torrent = self.register(record);
        torrent.start(true).await?;
        info!(bag = %bag_id, "bag created");
        Ok(torrent)
    }

    /// Starts downloading a bag by id. Known bags are simply restarted.
    /// With `download_now` false the torrent only resolves and persists
    /// its info, without fetching payload pieces. The torrent is durably
    /// registered before anything runs, so a crash right after this call
    /// still resumes it.
    pub async fn download_bag(
        &self,
        bag_id: BagId,
        download_now: bool,
    ) -> Result<Arc<Torrent>, StorageError> {
        if let Some(existing) = self.get(&bag_id) {
            existing.start(download_now).await?;
            return Ok(existing);
        }
        let record = TorrentRecord {
            bag_id,
            path: self.root.join("downloads").join(bag_id.to_string()),
            info: None,
            mask: PieceMask::empty(),
            active: true,
            created_locally: false,
        };
        self.db.put_torrent(&record).await?;
        let torrent = self.register(record);
        torrent.start(download_now).await?;
        info!(bag = %bag_id, "download registered");
        Ok(torrent)
    }

    fn register(&self, record: TorrentRecord) -> Arc<Torrent> {
        let mut torrents = self.torrents.write().unwrap();
        torrents
            .entry(record.bag_id)
            .or_insert_with(|| {
                Torrent::from_record(
                    self.db.clone(),
                    Arc::clone(&self.connector),
                    self.config.clone(),
                    record,
                )
            })
            .clone()
    }

    pub fn get(&self, bag_id: &BagId) -> Option<Arc<Torrent>> {
        self.torrents.read().unwrap().get(bag_id).cloned()
    }

    /// Snapshot of every registered torrent.
    pub fn list(&self) -> Vec<Arc<Torrent>> {
        self.torrents.read().unwrap().values().cloned().collect()
    }

    pub fn stats(&self) -> Vec<TorrentStats> {
        self.list().iter().map(|t| t.stats()).collect()
    }

    /// Unregisters a bag, deleting its durable state and optionally its
    /// content on disk.
    pub async fn remove_bag(&self, bag_id: &BagId, remove_data: bool) -> Result<(), StorageError> {
        // unregister only after the durable delete went through, so a
        // failed removal stays visible and can be retried
        let torrent = self.get(bag_id).ok_or(StorageError::NotFound(*bag_id))?;
        torrent.remove(remove_data).await?;
        self.torrents.write().unwrap().remove(bag_id);
        Ok(())
    }

    /// Winds down every running torrent without touching their durable
    /// active flags, so the next `open` resumes them.
    pub async fn shutdown(&self) {
        let torrents = self.list();
        join_all(torrents.iter().map(|t| t.halt())).await;
        info!("storage shut down");
    }
}

/// Writes `header ++ payload` into a temp file under `root` and hashes it
/// into a piece tree. Returns the temp file (to be persisted at its final
/// path), the tree and the content/header sizes.
fn assemble_content(
    root: &Path,
    source: &Path,
    description: &str,
    piece_size: u32,
) -> Result<(tempfile::NamedTempFile, PieceTree, u64, u64), StorageError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StorageError::Io { path, source }
    };

    let files = collect_files(source).map_err(io_err(source))?;
    if files.is_empty() {
        return Err(StorageError::EmptySource(source.to_path_buf()));
    }
    let header = BagHeader {
        description: description.to_string(),
        files: files.iter().map(|(_, entry)| entry.clone()).collect(),
    };
    let header_bytes = header
        .encode()
        .map_err(|e| DbError::Encode(e))
        .map_err(StorageError::Db)?;

    let mut content = tempfile::NamedTempFile::new_in(root).map_err(io_err(root))?;
    content.write_all(&header_bytes).map_err(io_err(root))?;
    for (path, _) in &files {
        let mut file = std::fs::File::open(path).map_err(io_err(path))?;
        std::io::copy(&mut file, &mut content).map_err(io_err(path))?;
    }
    content.flush().map_err(io_err(root))?;

    let file_size = content
        .as_file()
        .metadata()
        .map_err(io_err(root))?
        .len();
    content
        .as_file_mut()
        .seek(SeekFrom::Start(0))
        .map_err(io_err(root))?;
    let tree = PieceTree::from_reader(BufReader::new(content.as_file()), piece_size)
        .map_err(io_err(root))?;

    Ok((content, tree, file_size, header_bytes.len() as u64))
}

/// A single file, or every file under a directory in sorted walk order
/// with `/`-joined relative names.
fn collect_files(source: &Path) -> std::io::Result<Vec<(PathBuf, FileEntry)>> {
    let meta = std::fs::metadata(source)?;
    if meta.is_file() {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        return Ok(vec![(
            source.to_path_buf(),
            FileEntry {
                name,
                size: meta.len(),
            },
        )]);
    }

    let mut out = Vec::new();
    walk(source, String::new(), &mut out)?;
    Ok(out)
}

fn walk(
    dir: &Path,
    prefix: String,
    out: &mut Vec<(PathBuf, FileEntry)>,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let meta = std::fs::metadata(entry.path())?;
        if meta.is_dir() {
            walk(&entry.path(), rel, out)?;
        } else if meta.is_file() {
            out.push((
                entry.path(),
                FileEntry {
                    name: rel,
                    size: meta.len(),
                },
            ));
        }
    }
    Ok(())
}
