//! Process-local connector: every instance sharing a [`MemoryHub`] can
//! discover and serve each other directly. This is the in-process transport
//! used by the integration tests and by embedders that run several engine
//! instances in one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bag::BagId;
use crate::peer::PeerId;

use super::{
    Connector, HeaderResponse, PeerDescriptor, PieceProvider, PieceResponse, Session, SessionError,
};

const REFRESH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Default)]
struct HubState {
    /// bag -> holders. Providers are held weakly so a dropped torrent
    /// disappears from discovery on its own.
    seeds: HashMap<BagId, HashMap<PeerId, Weak<dyn PieceProvider>>>,
    piece_requests: HashMap<(BagId, u32), u32>,
}

/// Shared rendezvous point for [`MemoryConnector`] instances.
pub struct MemoryHub {
    state: Mutex<HubState>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
        })
    }

    /// How many piece requests for `(bag, index)` went through this hub.
    /// Lets tests assert that a resumed download does not refetch pieces.
    pub fn piece_request_count(&self, bag: &BagId, index: u32) -> u32 {
        *self
            .state
            .lock()
            .unwrap()
            .piece_requests
            .get(&(*bag, index))
            .unwrap_or(&0)
    }

    fn register(&self, bag: BagId, peer: PeerId, provider: Weak<dyn PieceProvider>) {
        self.state
            .lock()
            .unwrap()
            .seeds
            .entry(bag)
            .or_default()
            .insert(peer, provider);
    }

    fn unregister(&self, bag: &BagId, peer: &PeerId) {
        let mut state = self.state.lock().unwrap();
        if let Some(holders) = state.seeds.get_mut(bag) {
            holders.remove(peer);
            if holders.is_empty() {
                state.seeds.remove(bag);
            }
        }
    }

    fn holders(&self, bag: &BagId, excluding: &PeerId) -> Vec<PeerId> {
        let mut state = self.state.lock().unwrap();
        let Some(holders) = state.seeds.get_mut(bag) else {
            return Vec::new();
        };
        holders.retain(|_, provider| provider.strong_count() > 0);
        holders.keys().filter(|id| *id != excluding).copied().collect()
    }

    fn lookup(&self, bag: &BagId, peer: &PeerId) -> Option<Weak<dyn PieceProvider>> {
        self.state
            .lock()
            .unwrap()
            .seeds
            .get(bag)?
            .get(peer)
            .cloned()
    }

    fn note_piece_request(&self, bag: BagId, index: u32) {
        *self
            .state
            .lock()
            .unwrap()
            .piece_requests
            .entry((bag, index))
            .or_insert(0) += 1;
    }
}

pub struct MemoryConnector {
    hub: Arc<MemoryHub>,
    local: PeerId,
}

impl MemoryConnector {
    pub fn new(hub: Arc<MemoryHub>, local: PeerId) -> Arc<Self> {
        Arc::new(Self { hub, local })
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn find_peers(&self, bag: BagId) -> mpsc::Receiver<PeerDescriptor> {
        let (tx, rx) = mpsc::channel(16);
        let hub = Arc::clone(&self.hub);
        let local = self.local;
        tokio::spawn(async move {
            loop {
                for id in hub.holders(&bag, &local) {
                    if tx
                        .send(PeerDescriptor {
                            id,
                            bag,
                            addr: None,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                }
            }
        });
        rx
    }

    async fn open(&self, peer: &PeerDescriptor) -> anyhow::Result<Arc<dyn Session>> {
        let provider = self
            .hub
            .lookup(&peer.bag, &peer.id)
            .with_context(|| format!("peer {} does not announce bag {}", peer.id, peer.bag))?;
        anyhow::ensure!(provider.strong_count() > 0, "peer {} is gone", peer.id);
        Ok(Arc::new(MemorySession {
            hub: Arc::clone(&self.hub),
            bag: peer.bag,
            remote: provider,
            remote_id: peer.id,
            local: self.local,
        }))
    }

    fn announce(&self, bag: BagId, provider: Arc<dyn PieceProvider>) {
        self.hub.register(bag, self.local, Arc::downgrade(&provider));
    }

    fn withdraw(&self, bag: BagId) {
        self.hub.unregister(&bag, &self.local);
    }
}

struct MemorySession {
    hub: Arc<MemoryHub>,
    bag: BagId,
    remote: Weak<dyn PieceProvider>,
    remote_id: PeerId,
    local: PeerId,
}

#[async_trait]
impl Session for MemorySession {
    fn peer_id(&self) -> PeerId {
        self.remote_id
    }

    async fn request_header(&self) -> Result<HeaderResponse, SessionError> {
        let provider = self.remote.upgrade().ok_or(SessionError::Closed)?;
        provider.header(self.local).await.ok_or(SessionError::NotFound)
    }

    async fn request_piece(&self, index: u32) -> Result<PieceResponse, SessionError> {
        self.hub.note_piece_request(self.bag, index);
        let provider = self.remote.upgrade().ok_or(SessionError::Closed)?;
        provider
            .piece(self.local, index)
            .await
            .ok_or(SessionError::NotFound)
    }
}
