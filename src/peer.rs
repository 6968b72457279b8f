use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;
use tracing::debug;

use crate::connector::Session;

/// How long a peer stays excluded from selection after a failure.
pub(crate) const PEER_PENALTY_WINDOW: Duration = Duration::from_secs(20);
/// Failures after which a peer is dropped from the directory entirely.
pub(crate) const MAX_PEER_FAILURES: u32 = 8;

const EMA_TAU_SECS: f64 = 5.0;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

/// Elapsed-weighted exponential moving average of a transfer rate.
/// Reading decays the value, so a peer that went quiet reads as slow
/// without needing new samples.
#[derive(Debug, Clone)]
pub struct SpeedEma {
    rate: f64,
    last: Instant,
}

impl Default for SpeedEma {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedEma {
    pub fn new() -> Self {
        Self {
            rate: 0.0,
            last: Instant::now(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    fn record_at(&mut self, bytes: u64, now: Instant) {
        let dt = now.duration_since(self.last).as_secs_f64().max(1e-3);
        let instantaneous = bytes as f64 / dt;
        let alpha = 1.0 - (-dt / EMA_TAU_SECS).exp();
        self.rate += alpha * (instantaneous - self.rate);
        self.last = now;
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec_at(Instant::now())
    }

    fn bytes_per_sec_at(&self, now: Instant) -> u64 {
        let dt = now.duration_since(self.last).as_secs_f64();
        (self.rate * (-dt / EMA_TAU_SECS).exp()) as u64
    }
}

struct PeerEntry {
    session: Arc<dyn Session>,
    download: SpeedEma,
    upload: SpeedEma,
    in_flight: u32,
    failures: u32,
    last_failure: Option<Instant>,
}

impl PeerEntry {
    fn penalized(&self, now: Instant) -> bool {
        self.last_failure
            .is_some_and(|at| now.duration_since(at) < PEER_PENALTY_WINDOW)
    }
}

/// Read-only view of one peer for reporting.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub download_bps: u64,
    pub upload_bps: u64,
    pub in_flight: u32,
}

/// Per-torrent set of connected peers. All methods take `&self`; the map
/// is guarded internally so the scheduler, fetch tasks and stats readers
/// can share it.
#[derive(Default)]
pub struct PeerDirectory {
    peers: Mutex<HashMap<PeerId, PeerEntry>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: PeerId, session: Arc<dyn Session>) {
        let mut peers = self.peers.lock().unwrap();
        peers.entry(id).or_insert_with(|| {
            debug!(peer = %id, "peer connected");
            PeerEntry {
                session,
                download: SpeedEma::new(),
                upload: SpeedEma::new(),
                in_flight: 0,
                failures: 0,
                last_failure: None,
            }
        });
    }

    pub fn remove(&self, id: &PeerId) {
        if self.peers.lock().unwrap().remove(id).is_some() {
            debug!(peer = %id, "peer dropped");
        }
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.lock().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.peers.lock().unwrap().clear();
    }

    pub fn record_download(&self, id: &PeerId, bytes: u64) {
        if let Some(entry) = self.peers.lock().unwrap().get_mut(id) {
            entry.download.record(bytes);
        }
    }

    pub fn record_upload(&self, id: &PeerId, bytes: u64) {
        if let Some(entry) = self.peers.lock().unwrap().get_mut(id) {
            entry.upload.record(bytes);
        }
    }

    /// Marks a failed request against the peer and returns its failure
    /// count so the caller can decide to drop it.
    pub fn penalize(&self, id: &PeerId) -> u32 {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(id) {
            Some(entry) => {
                entry.failures += 1;
                entry.last_failure = Some(Instant::now());
                entry.failures
            }
            None => 0,
        }
    }

    pub fn inc_in_flight(&self, id: &PeerId) {
        if let Some(entry) = self.peers.lock().unwrap().get_mut(id) {
            entry.in_flight += 1;
        }
    }

    pub fn dec_in_flight(&self, id: &PeerId) {
        if let Some(entry) = self.peers.lock().unwrap().get_mut(id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    /// Picks a peer for the next request: below the per-peer in-flight cap
    /// and not inside its penalty window. Peers with a measured download
    /// rate are ranked by it; if none have one yet, an untested peer is
    /// chosen at random.
    pub fn best_available(&self, max_in_flight: u32) -> Option<(PeerId, Arc<dyn Session>)> {
        let peers = self.peers.lock().unwrap();
        let now = Instant::now();
        let candidates = peers
            .iter()
            .filter(|(_, e)| e.in_flight < max_in_flight && !e.penalized(now));

        let best = candidates
            .clone()
            .map(|(id, e)| (id, e, e.download.bytes_per_sec_at(now)))
            .filter(|(_, _, bps)| *bps > 0)
            .max_by_key(|(_, _, bps)| *bps);
        let chosen = match best {
            Some((id, entry, _)) => Some((id, entry)),
            None => candidates.choose(&mut rand::thread_rng()),
        };
        chosen.map(|(id, entry)| (*id, Arc::clone(&entry.session)))
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, e)| PeerSnapshot {
                id: *id,
                download_bps: e.download.bytes_per_sec(),
                upload_bps: e.upload.bytes_per_sec(),
                in_flight: e.in_flight,
            })
            .collect()
    }

    /// Summed (download, upload) rates across all peers.
    pub fn total_rates(&self) -> (u64, u64) {
        self.peers.lock().unwrap().values().fold((0, 0), |acc, e| {
            (
                acc.0 + e.download.bytes_per_sec(),
                acc.1 + e.upload.bytes_per_sec(),
            )
        })
    }
}
