//! Piece-based, content-addressed distributed storage. A *bag* is an
//! immutable blob identified by the Merkle root over its pieces; bags are
//! fetched piece by piece from discovered peers, each piece verified
//! against the bag id before it is stored, and all progress survives a
//! restart.
//!
//! Peer discovery and transport are injected through [`Connector`];
//! [`connector::memory`] ships an in-process implementation. Durability is
//! injected through [`KvStore`].

pub mod bag;
pub mod connector;
pub mod db;
pub mod peer;
pub mod piece_tree;
mod scheduler;
pub mod storage;
pub mod torrent;

pub use bag::{BagHeader, BagId, BagIdError, BagInfo, FileEntry, PieceMask, DEFAULT_PIECE_SIZE};
pub use connector::memory::{MemoryConnector, MemoryHub};
pub use connector::{
    Connector, HeaderResponse, PeerDescriptor, PieceProvider, PieceResponse, Session, SessionError,
};
pub use db::{Db, DbError, DiskKv, KvStore, MemoryKv, TorrentRecord};
pub use peer::{PeerId, PeerSnapshot};
pub use piece_tree::{verify_piece, PieceProof, PieceTree};
pub use storage::{Storage, StorageConfig, StorageError};
pub use torrent::{Torrent, TorrentError, TorrentStats, TorrentStatus};
