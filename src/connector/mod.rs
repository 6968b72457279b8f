pub mod memory;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bag::{BagId, BagInfo};
use crate::peer::PeerId;
use crate::piece_tree::PieceProof;

/// A peer advertised as holding (some of) a bag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub bag: BagId,
    pub addr: Option<SocketAddr>,
}

/// Answer to a header request: the metadata plus the first piece and its
/// proof, so the metadata can be checked against the bag id before anything
/// is trusted.
#[derive(Debug, Clone)]
pub struct HeaderResponse {
    pub info: BagInfo,
    pub piece0: Bytes,
    pub proof: PieceProof,
}

#[derive(Debug, Clone)]
pub struct PieceResponse {
    pub data: Bytes,
    pub proof: PieceProof,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("request timed out")]
    Timeout,
    #[error("peer closed the session")]
    Closed,
    #[error("peer does not have the requested data")]
    NotFound,
    #[error("transport failed: {0}")]
    Transport(String),
}

/// Peer discovery and connection establishment. Injected into the engine;
/// the engine never dials the network itself.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Stream of peers holding `bag`. Continuously refreshing and
    /// unbounded in time; it ends only when the receiver is dropped.
    fn find_peers(&self, bag: BagId) -> mpsc::Receiver<PeerDescriptor>;

    async fn open(&self, peer: &PeerDescriptor) -> anyhow::Result<Arc<dyn Session>>;

    /// Registers the local node as a holder of `bag`, serving through
    /// `provider` until `withdraw`. The connector holds the provider
    /// weakly; a dropped torrent stops being served.
    fn announce(&self, bag: BagId, provider: Arc<dyn PieceProvider>);

    fn withdraw(&self, bag: BagId);
}

/// An established connection to one peer, scoped to one bag.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    fn peer_id(&self) -> PeerId;

    async fn request_header(&self) -> Result<HeaderResponse, SessionError>;

    async fn request_piece(&self, index: u32) -> Result<PieceResponse, SessionError>;
}

/// The serving side of a torrent, handed to `Connector::announce`.
#[async_trait]
pub trait PieceProvider: Send + Sync + 'static {
    /// `None` while the local node cannot serve the header (info unknown,
    /// piece 0 missing, or the torrent inactive).
    async fn header(&self, from: PeerId) -> Option<HeaderResponse>;

    async fn piece(&self, from: PeerId, index: u32) -> Option<PieceResponse>;
}

/// Dials a peer with a bounded retry budget, doubling the delay between
/// attempts. After the budget is spent the peer is skipped until it is
/// rediscovered.
pub async fn connect_with_backoff(
    connector: &dyn Connector,
    peer: &PeerDescriptor,
    attempts: u32,
    base_delay: Duration,
) -> anyhow::Result<Arc<dyn Session>> {
    let mut delay = base_delay;
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match connector.open(peer).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                debug!(peer = %peer.id, attempt, "connect failed: {e:#}");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("no connect attempts made"))
        .context(format!("giving up on peer {}", peer.id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullSession(PeerId);

    #[async_trait]
    impl Session for NullSession {
        fn peer_id(&self) -> PeerId {
            self.0
        }
        async fn request_header(&self) -> Result<HeaderResponse, SessionError> {
            Err(SessionError::NotFound)
        }
        async fn request_piece(&self, _index: u32) -> Result<PieceResponse, SessionError> {
            Err(SessionError::NotFound)
        }
    }

    struct FlakyConnector {
        calls: AtomicU32,
        succeed_on: u32,
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        fn find_peers(&self, _bag: BagId) -> mpsc::Receiver<PeerDescriptor> {
            mpsc::channel(1).1
        }

        async fn open(&self, peer: &PeerDescriptor) -> anyhow::Result<Arc<dyn Session>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.succeed_on {
                anyhow::bail!("unreachable");
            }
            Ok(Arc::new(NullSession(peer.id)))
        }

        fn announce(&self, _bag: BagId, _provider: Arc<dyn PieceProvider>) {}
        fn withdraw(&self, _bag: BagId) {}
    }

    fn peer() -> PeerDescriptor {
        PeerDescriptor {
            id: PeerId([1; 32]),
            bag: BagId([2; 32]),
            addr: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_retries_then_gives_up() {
        let connector = FlakyConnector {
            calls: AtomicU32::new(0),
            succeed_on: u32::MAX,
        };
        let res =
            connect_with_backoff(&connector, &peer(), 3, Duration::from_millis(100)).await;
        assert!(res.is_err());
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_succeeds_mid_budget() {
        let connector = FlakyConnector {
            calls: AtomicU32::new(0),
            succeed_on: 2,
        };
        let session = connect_with_backoff(&connector, &peer(), 4, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(session.peer_id(), PeerId([1; 32]));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
    }
}
