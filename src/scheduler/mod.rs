//! Per-torrent download driver. One actor per running torrent owns all
//! scheduling state and is fed over an mpsc inbox by discovery, fetch and
//! header tasks; a periodic tick re-pumps work after quiet periods.

mod picker;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connector::{
    connect_with_backoff, Connector, HeaderResponse, PeerDescriptor, Session,
};
use crate::peer::{PeerId, MAX_PEER_FAILURES};
use crate::piece_tree::{self, PieceProof};
use crate::storage::StorageConfig;
use crate::torrent::Torrent;

const INBOX_SIZE: usize = 64;
const PUMP_INTERVAL: Duration = Duration::from_millis(500);

pub(crate) enum SchedulerMsg {
    PeerConnected {
        id: PeerId,
        session: Arc<dyn Session>,
    },
    HeaderResolved {
        from: PeerId,
        response: HeaderResponse,
    },
    HeaderFailed {
        from: PeerId,
    },
    PieceFetched {
        index: u32,
        from: PeerId,
        data: bytes::Bytes,
        proof: PieceProof,
    },
    PieceFailed {
        index: u32,
        from: PeerId,
    },
}

pub(crate) struct Scheduler {
    torrent: Arc<Torrent>,
    config: StorageConfig,
    rx: mpsc::Receiver<SchedulerMsg>,
    tx: mpsc::Sender<SchedulerMsg>,
    cancel: CancellationToken,
    discovery: CancellationToken,
    picker: picker::PiecePicker,
    header_in_flight: bool,
    /// `false` runs header-only mode: resolve and persist the info, then
    /// idle without fetching payload pieces.
    fetch_payload: bool,
}

impl Scheduler {
    pub(crate) fn spawn(
        torrent: Arc<Torrent>,
        config: StorageConfig,
        cancel: CancellationToken,
        fetch_payload: bool,
    ) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(INBOX_SIZE);
        let discovery = cancel.child_token();
        tokio::spawn(discover(
            Arc::clone(&torrent),
            config.clone(),
            tx.clone(),
            discovery.clone(),
        ));
        let scheduler = Self {
            torrent,
            config,
            rx,
            tx,
            cancel,
            discovery,
            picker: picker::PiecePicker::new(),
            header_in_flight: false,
            fetch_payload,
        };
        tokio::spawn(scheduler.run())
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(PUMP_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {}
                Some(msg) = self.rx.recv() => self.handle(msg).await,
            }
            if self.pump() {
                break;
            }
        }
        self.discovery.cancel();
    }

    async fn handle(&mut self, msg: SchedulerMsg) {
        match msg {
            SchedulerMsg::PeerConnected { id, session } => {
                self.torrent.peers().insert(id, session);
            }
            SchedulerMsg::HeaderResolved { from, response } => {
                self.header_in_flight = false;
                if self.torrent.info().is_some() {
                    return;
                }
                let bytes = response.piece0.len() as u64;
                match self.torrent.apply_header(response).await {
                    Ok(()) => {
                        // credit the peer only once the header verified
                        self.torrent.peers().record_download(&from, bytes);
                        info!(bag = %self.torrent.bag_id, peer = %from, "header resolved");
                    }
                    Err(e) => {
                        warn!(bag = %self.torrent.bag_id, peer = %from, "header rejected: {e}");
                        self.torrent.peers().penalize(&from);
                    }
                }
            }
            SchedulerMsg::HeaderFailed { from } => {
                self.header_in_flight = false;
                self.fail_peer(&from);
            }
            SchedulerMsg::PieceFetched {
                index,
                from,
                data,
                proof,
            } => {
                self.picker.release(index);
                self.torrent.peers().dec_in_flight(&from);
                if let Err(e) = self.torrent.commit_piece(index, data, proof).await {
                    // the claim is released, the piece will be refetched
                    warn!(bag = %self.torrent.bag_id, index, "could not commit piece: {e}");
                }
            }
            SchedulerMsg::PieceFailed { index, from } => {
                self.picker.release(index);
                self.torrent.peers().dec_in_flight(&from);
                debug!(bag = %self.torrent.bag_id, index, peer = %from, "piece fetch failed");
                self.fail_peer(&from);
            }
        }
    }

    fn fail_peer(&self, id: &PeerId) {
        if self.torrent.peers().penalize(id) >= MAX_PEER_FAILURES {
            self.torrent.peers().remove(id);
        }
    }

    /// Issues whatever work the current state allows. Returns `true` once
    /// the torrent is complete and the actor should exit.
    fn pump(&mut self) -> bool {
        let Some(info) = self.torrent.info() else {
            self.request_header();
            return false;
        };
        if self.torrent.is_complete() {
            self.torrent.enter_seeding();
            return true;
        }
        if !self.fetch_payload {
            return false;
        }

        let mask = self.torrent.mask_snapshot();
        while self.picker.claimed() < self.config.max_inflight_per_torrent {
            let Some((peer, session)) = self
                .torrent
                .peers()
                .best_available(self.config.max_inflight_per_peer)
            else {
                break;
            };
            let Some(index) = self.picker.claim_next(&mask, peer) else {
                break;
            };
            self.torrent.peers().inc_in_flight(&peer);
            self.spawn_fetch(index, peer, session, info.piece_len(index), info.piece_count());
        }
        false
    }

    fn request_header(&mut self) {
        if self.header_in_flight {
            return;
        }
        let Some((peer, session)) = self
            .torrent
            .peers()
            .best_available(self.config.max_inflight_per_peer)
        else {
            return;
        };
        self.header_in_flight = true;
        let tx = self.tx.clone();
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let msg = match tokio::time::timeout(timeout, session.request_header()).await {
                Ok(Ok(response)) => SchedulerMsg::HeaderResolved {
                    from: peer,
                    response,
                },
                _ => SchedulerMsg::HeaderFailed { from: peer },
            };
            let _ = tx.send(msg).await;
        });
    }

    fn spawn_fetch(
        &self,
        index: u32,
        peer: PeerId,
        session: Arc<dyn Session>,
        expected_len: u32,
        piece_count: u32,
    ) {
        let tx = self.tx.clone();
        let torrent = Arc::clone(&self.torrent);
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            let bag_id = torrent.bag_id;
            let msg = match tokio::time::timeout(timeout, session.request_piece(index)).await {
                Ok(Ok(response))
                    if response.data.len() == expected_len as usize
                        && response.proof.siblings.len() == piece_tree::tree_depth(piece_count)
                        && piece_tree::verify_piece(&bag_id, index, &response.data, &response.proof) =>
                {
                    torrent
                        .peers()
                        .record_download(&peer, response.data.len() as u64);
                    SchedulerMsg::PieceFetched {
                        index,
                        from: peer,
                        data: response.data,
                        proof: response.proof,
                    }
                }
                _ => SchedulerMsg::PieceFailed { index, from: peer },
            };
            let _ = tx.send(msg).await;
        });
    }
}

/// Consumes the connector's discovery stream and turns descriptors into
/// connected sessions, each dialed with a bounded backoff budget.
async fn discover(
    torrent: Arc<Torrent>,
    config: StorageConfig,
    tx: mpsc::Sender<SchedulerMsg>,
    cancel: CancellationToken,
) {
    let connector = torrent.connector();
    let mut found = connector.find_peers(torrent.bag_id);
    let dialing: Arc<Mutex<HashSet<PeerId>>> = Arc::default();
    loop {
        let descriptor = tokio::select! {
            _ = cancel.cancelled() => break,
            d = found.recv() => match d {
                Some(d) => d,
                None => break,
            },
        };
        if torrent.peers().contains(&descriptor.id)
            || !dialing.lock().unwrap().insert(descriptor.id)
        {
            continue;
        }
        tokio::spawn(dial(
            Arc::clone(&connector),
            descriptor,
            config.clone(),
            tx.clone(),
            Arc::clone(&dialing),
        ));
    }
}

async fn dial(
    connector: Arc<dyn Connector>,
    descriptor: PeerDescriptor,
    config: StorageConfig,
    tx: mpsc::Sender<SchedulerMsg>,
    dialing: Arc<Mutex<HashSet<PeerId>>>,
) {
    let result = connect_with_backoff(
        connector.as_ref(),
        &descriptor,
        config.connect_attempts,
        config.connect_backoff,
    )
    .await;
    dialing.lock().unwrap().remove(&descriptor.id);
    match result {
        Ok(session) => {
            let _ = tx
                .send(SchedulerMsg::PeerConnected {
                    id: descriptor.id,
                    session,
                })
                .await;
        }
        Err(e) => debug!(peer = %descriptor.id, "skipping peer: {e:#}"),
    }
}
