use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::{info, warn};

use crate::events::{ServerEvent, TransferInfo, TransferKind};
use crate::tftp_protocol::{ErrorCode, MAX_PACKET, OCTET_MODE, Packet};
use crate::transfer::{self, InboundQueue};

/// Bound on each transfer's inbound queue (spec §4.4: capacity <= 4,
/// non-blocking handoff — a full queue means the datagram is dropped and
/// recovered by the peer's own retransmission).
const QUEUE_CAPACITY: usize = 4;

type Registry = Arc<RwLock<HashMap<SocketAddr, mpsc::Sender<Packet>>>>;

/// The two disjoint namespaces the dispatcher demultiplexes into: transfers
/// expecting an ACK (Senders, serving RRQ) and transfers expecting DATA
/// (Receivers, serving WRQ). Kept separate because DATA/ACK are
/// disambiguated by opcode, not by peer, so each lookup stays a single key
/// probe.
#[derive(Clone)]
pub struct Registries {
    senders: Registry,
    receivers: Registry,
}

impl Registries {
    fn new() -> Self {
        Self {
            senders: Arc::new(RwLock::new(HashMap::new())),
            receivers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Remove `peer`'s entry from `senders`, but only if it still refers to
    /// `handle`. A peer that opens a second RRQ before the first transfer's
    /// cleanup runs overwrites the registry entry with a new channel; the
    /// first transfer's cleanup must not delete the second transfer's live
    /// entry, so it identifies itself by channel handle rather than by peer
    /// address alone.
    pub async fn remove_sender(&self, peer: SocketAddr, handle: &mpsc::Sender<Packet>) {
        remove_if_same(&self.senders, peer, handle).await;
    }

    pub async fn remove_receiver(&self, peer: SocketAddr, handle: &mpsc::Sender<Packet>) {
        remove_if_same(&self.receivers, peer, handle).await;
    }

    /// Register `handle` under `peer` in `senders`, unless a transfer is
    /// already registered there. A retransmitted RRQ for a peer that already
    /// has a live transfer must not clobber that transfer's channel with a
    /// fresh one (the original would be orphaned, unreachable from the
    /// registry, and run until its own timeout even though the peer is
    /// cooperating) — so a second request for an already-active peer is
    /// treated as a duplicate of the in-flight one and dropped.
    async fn try_insert_sender(&self, peer: SocketAddr, handle: mpsc::Sender<Packet>) -> bool {
        try_insert(&self.senders, peer, handle).await
    }

    async fn try_insert_receiver(&self, peer: SocketAddr, handle: mpsc::Sender<Packet>) -> bool {
        try_insert(&self.receivers, peer, handle).await
    }
}

async fn remove_if_same(registry: &Registry, peer: SocketAddr, handle: &mpsc::Sender<Packet>) {
    let mut map = registry.write().await;
    if let Some(current) = map.get(&peer) {
        if current.same_channel(handle) {
            map.remove(&peer);
        }
    }
}

async fn try_insert(registry: &Registry, peer: SocketAddr, handle: mpsc::Sender<Packet>) -> bool {
    let mut map = registry.write().await;
    if map.contains_key(&peer) {
        return false;
    }
    map.insert(peer, handle);
    true
}

/// Bind the dispatcher's listening socket. Split from `serve` so callers
/// (tests in particular) can bind to an OS-assigned port and learn its
/// address before the accept loop starts.
pub async fn bind(port: u16) -> Result<UdpSocket> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    Ok(UdpSocket::bind(addr).await?)
}

/// Run the TFTP server against an already-bound socket. Returns once
/// `shutdown` fires.
pub async fn serve(
    sock: UdpSocket,
    dir: PathBuf,
    tx: mpsc::UnboundedSender<ServerEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = sock.local_addr()?;
    let sock = Arc::new(sock);
    info!(%addr, "tftp dispatcher listening");
    let _ = tx.send(ServerEvent::Log(format!("Listening on {addr}")));

    let dir = Arc::new(dir);
    let registries = Registries::new();
    let mut buf = vec![0u8; MAX_PACKET];
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            result = sock.recv_from(&mut buf) => {
                let (n, peer) = result?;
                handle_datagram(&buf[..n], peer, &sock, &dir, &registries, &tx, &mut next_id).await;
            }
            _ = shutdown.changed() => {
                info!("dispatcher shutting down");
                let _ = tx.send(ServerEvent::Log("Shutting down".into()));
                break;
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_datagram(
    raw: &[u8],
    peer: SocketAddr,
    sock: &Arc<UdpSocket>,
    dir: &Arc<PathBuf>,
    registries: &Registries,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    next_id: &mut u64,
) {
    let pkt = match Packet::from_bytes(raw) {
        Ok(p) => p,
        Err(e) => {
            warn!(%peer, error = %e, "unparseable datagram");
            reply_error(sock, peer, ErrorCode::IllegalOperation, "illegal operation").await;
            return;
        }
    };

    match pkt {
        Packet::RRQ { filename, mode } => {
            let id = *next_id;
            *next_id += 1;
            start_sender(id, peer, filename, mode, sock, dir, registries, tx).await;
        }
        Packet::WRQ { filename, mode } => {
            let id = *next_id;
            *next_id += 1;
            start_receiver(id, peer, filename, mode, sock, dir, registries, tx).await;
        }
        Packet::DATA { .. } => {
            deliver(&registries.receivers, peer, pkt).await;
        }
        Packet::ACK { .. } => {
            deliver(&registries.senders, peer, pkt).await;
        }
        Packet::ERROR { code, msg } => {
            warn!(%peer, code, %msg, "peer reported error");
            // Deliver to whichever registry has this peer, so the affected
            // transfer terminates promptly instead of running to its own
            // timeout (spec §7: log and terminate, without replying).
            deliver(&registries.senders, peer, Packet::ERROR { code, msg: msg.clone() }).await;
            deliver(&registries.receivers, peer, Packet::ERROR { code, msg }).await;
        }
    }
}

/// Hand a decoded DATA/ACK packet to its transfer's inbound queue. A
/// missing registry entry (no such transfer) or a full queue (transfer not
/// yet waiting) both result in the datagram being dropped; the peer's own
/// retransmission will recover it (spec §4.4).
async fn deliver(registry: &Registry, peer: SocketAddr, pkt: Packet) {
    let map = registry.read().await;
    if let Some(queue) = map.get(&peer) {
        if queue.try_send(pkt).is_err() {
            warn!(%peer, "transfer queue full or closed, dropping datagram");
        }
    }
}

async fn reply_error(sock: &Arc<UdpSocket>, peer: SocketAddr, code: ErrorCode, msg: &str) {
    let pkt = Packet::error(code, msg);
    let _ = sock.send_to(&pkt.to_bytes(), peer).await;
}

#[allow(clippy::too_many_arguments)]
async fn start_sender(
    id: u64,
    peer: SocketAddr,
    filename: String,
    mode: String,
    sock: &Arc<UdpSocket>,
    dir: &Arc<PathBuf>,
    registries: &Registries,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    if !mode.eq_ignore_ascii_case(OCTET_MODE) {
        reply_error(
            sock,
            peer,
            ErrorCode::Undefined,
            "only octet mode supported",
        )
        .await;
        return;
    }

    // Register the inbound ACK queue *before* the transfer's first send
    // (spec §9 Open Question): a fast peer's reply must never arrive
    // before there is somewhere to deliver it.
    let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
    let own_handle = queue_tx.clone();
    if !registries.try_insert_sender(peer, queue_tx).await {
        info!(%peer, filename, "duplicate RRQ for in-flight transfer, ignoring");
        return;
    }

    let sock = Arc::clone(sock);
    let dir = Arc::clone(dir);
    let registries = registries.clone();
    let tx = tx.clone();

    tokio::spawn(async move {
        let _ = tx.send(ServerEvent::TransferStarted(TransferInfo {
            id,
            peer,
            filename: filename.clone(),
            kind: TransferKind::Download,
            total_bytes: 0,
            transferred: 0,
            started: Instant::now(),
        }));

        let queue = InboundQueue::new(queue_rx);
        let result = transfer::run_sender(id, peer, &filename, &dir, &sock, queue, &tx).await;

        registries.remove_sender(peer, &own_handle).await;
        report_outcome(&tx, id, peer, "RRQ", &filename, result);
    });
}

#[allow(clippy::too_many_arguments)]
async fn start_receiver(
    id: u64,
    peer: SocketAddr,
    filename: String,
    mode: String,
    sock: &Arc<UdpSocket>,
    dir: &Arc<PathBuf>,
    registries: &Registries,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) {
    if !mode.eq_ignore_ascii_case(OCTET_MODE) {
        reply_error(
            sock,
            peer,
            ErrorCode::Undefined,
            "only octet mode supported",
        )
        .await;
        return;
    }

    let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
    let own_handle = queue_tx.clone();
    if !registries.try_insert_receiver(peer, queue_tx).await {
        info!(%peer, filename, "duplicate WRQ for in-flight transfer, ignoring");
        return;
    }

    let sock = Arc::clone(sock);
    let dir = Arc::clone(dir);
    let registries = registries.clone();
    let tx = tx.clone();

    tokio::spawn(async move {
        let _ = tx.send(ServerEvent::TransferStarted(TransferInfo {
            id,
            peer,
            filename: filename.clone(),
            kind: TransferKind::Upload,
            total_bytes: 0,
            transferred: 0,
            started: Instant::now(),
        }));

        let queue = InboundQueue::new(queue_rx);
        let result = transfer::run_receiver(id, peer, &filename, &dir, &sock, queue, &tx).await;

        registries.remove_receiver(peer, &own_handle).await;
        report_outcome(&tx, id, peer, "WRQ", &filename, result);
    });
}

fn report_outcome(
    tx: &mpsc::UnboundedSender<ServerEvent>,
    id: u64,
    peer: SocketAddr,
    req: &str,
    filename: &str,
    result: Result<()>,
) {
    match result {
        Ok(()) => {
            info!(%peer, req, filename, "transfer complete");
            let _ = tx.send(ServerEvent::TransferComplete(id));
        }
        Err(e) => {
            warn!(%peer, req, filename, error = %e, "transfer failed");
            let _ = tx.send(ServerEvent::TransferFailed {
                id,
                error: e.to_string(),
            });
        }
    }
}
