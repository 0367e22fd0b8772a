use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tracing::warn;

use crate::events::ServerEvent;
use crate::tftp_protocol::{BLOCK_SIZE, ErrorCode, Packet, seq_after};

/// Per-attempt retransmission timer (spec §4.2/§4.3).
const RETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sender's total time budget per block before it aborts silently.
const SENDER_BLOCK_BUDGET: Duration = Duration::from_secs(25);

/// Receiver's consecutive-timeout budget before it aborts.
const RECEIVER_MAX_RETRIES: u32 = 4;

/// The inbound datagram queue the dispatcher feeds a transfer through.
/// Bounded and non-blocking on the producer side (see `dispatcher`); here
/// it is just the consumer half.
pub struct InboundQueue {
    rx: mpsc::Receiver<Packet>,
}

impl InboundQueue {
    pub fn new(rx: mpsc::Receiver<Packet>) -> Self {
        Self { rx }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }
}

// ---------------------------------------------------------------------------
// Sender (serves RRQ)
// ---------------------------------------------------------------------------

/// Drive a read request to completion: stream the file to `peer` as DATA
/// packets, each gated on an ACK from `queue`.
pub async fn run_sender(
    id: u64,
    peer: SocketAddr,
    filename: &str,
    dir: &Path,
    sock: &UdpSocket,
    mut queue: InboundQueue,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) -> Result<()> {
    let path = match sanitize_path(dir, filename) {
        Ok(p) => p,
        Err(e) => {
            send_error(sock, peer, ErrorCode::AccessViolation, &e.to_string()).await;
            return Err(e);
        }
    };

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            send_error(sock, peer, ErrorCode::FileNotFound, "file not found").await;
            return Err(anyhow!("file not found: {}", path.display()));
        }
        Err(e) => {
            send_error(sock, peer, ErrorCode::Undefined, &e.to_string()).await;
            return Err(anyhow!("cannot open {}: {e}", path.display()));
        }
    };

    let total_bytes = file.metadata().await.map(|m| m.len()).unwrap_or(0);

    let mut block_num: u16 = 1;
    let mut transferred: u64 = 0;
    let mut block_buf = vec![0u8; BLOCK_SIZE];

    loop {
        let bytes_read = read_block(&mut file, &mut block_buf).await?;
        let payload = block_buf[..bytes_read].to_vec();
        let is_last = bytes_read < BLOCK_SIZE;
        let pkt_bytes = Packet::DATA {
            block_num,
            data: payload,
        }
        .to_bytes();

        send_and_await_ack(sock, peer, &pkt_bytes, block_num, &mut queue).await?;

        transferred += bytes_read as u64;
        let _ = tx.send(ServerEvent::TransferProgress {
            id,
            transferred,
            total_bytes,
        });

        if is_last {
            break;
        }
        block_num = block_num.wrapping_add(1);
    }

    Ok(())
}

/// Fill `buf` a block at a time, looping on short reads that aren't EOF (a
/// reader is free to return fewer bytes than requested without being done).
/// Only a `read` returning `0` means end of file; that's what drives the
/// short-final-block termination check in `run_sender`.
async fn read_block(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Send one DATA packet and wait for its ACK, retransmitting on each 5s
/// timeout until either the ACK arrives or the 25s total budget for this
/// block elapses (spec §4.2 steps 3-6).
async fn send_and_await_ack(
    sock: &UdpSocket,
    peer: SocketAddr,
    pkt_bytes: &[u8],
    block_num: u16,
    queue: &mut InboundQueue,
) -> Result<()> {
    let deadline = Instant::now() + SENDER_BLOCK_BUDGET;
    sock.send_to(pkt_bytes, peer).await?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            // Silent abort: no ERROR packet per spec §7.
            return Err(anyhow!("timed out after {SENDER_BLOCK_BUDGET:?} awaiting ack of block {block_num}"));
        }
        let wait = remaining.min(RETRY_TIMEOUT);

        match timeout(wait, queue.recv()).await {
            Ok(Some(Packet::ACK { block_num: k })) => {
                if k == block_num {
                    return Ok(());
                }
                if seq_after(k, block_num) {
                    warn!(%peer, expected = block_num, got = k, "ack ahead of expected block, advancing anyway");
                    return Ok(());
                }
                // k is behind block_num: duplicate ack of an earlier
                // block. Keep waiting without resending.
            }
            Ok(Some(Packet::ERROR { code, msg })) => {
                return Err(anyhow!("peer reported error {code}: {msg}"));
            }
            Ok(Some(_)) => { /* anything else on this queue is unexpected; ignore */ }
            Ok(None) => return Err(anyhow!("transfer queue closed")),
            Err(_elapsed) => {
                sock.send_to(pkt_bytes, peer).await?;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver (serves WRQ)
// ---------------------------------------------------------------------------

/// Drive a write request to completion: accept DATA packets from `queue` in
/// order and write them to a newly created file, ACKing each block.
pub async fn run_receiver(
    id: u64,
    peer: SocketAddr,
    filename: &str,
    dir: &Path,
    sock: &UdpSocket,
    mut queue: InboundQueue,
    tx: &mpsc::UnboundedSender<ServerEvent>,
) -> Result<()> {
    let path = match sanitize_path(dir, filename) {
        Ok(p) => p,
        Err(e) => {
            send_error(sock, peer, ErrorCode::AccessViolation, &e.to_string()).await;
            return Err(e);
        }
    };

    if path.exists() {
        send_error(sock, peer, ErrorCode::FileAlreadyExists, "file exists").await;
        return Err(anyhow!("file exists: {}", path.display()));
    }

    let mut file = match tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
    {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            send_error(sock, peer, ErrorCode::FileAlreadyExists, "file exists").await;
            return Err(anyhow!("file exists: {}", path.display()));
        }
        Err(e) => {
            send_error(sock, peer, ErrorCode::Undefined, &e.to_string()).await;
            return Err(anyhow!("cannot create {}: {e}", path.display()));
        }
    };

    // Kickoff: ACK(0) tells the peer it may send DATA(1).
    send_ack(sock, peer, 0).await?;

    let mut last_acked: u16 = 0;
    let mut transferred: u64 = 0;
    let mut timeouts: u32 = 0;

    loop {
        match timeout(RETRY_TIMEOUT, queue.recv()).await {
            Ok(Some(Packet::DATA { block_num, data })) => {
                timeouts = 0;
                let expected = last_acked.wrapping_add(1);

                if block_num == expected {
                    let is_last = data.len() < BLOCK_SIZE;
                    if let Err(e) = file.write_all(&data).await {
                        send_error(sock, peer, ErrorCode::Undefined, &e.to_string()).await;
                        return Err(anyhow!("write failed for {}: {e}", path.display()));
                    }
                    transferred += data.len() as u64;
                    last_acked = block_num;
                    send_ack(sock, peer, last_acked).await?;
                    let _ = tx.send(ServerEvent::TransferProgress {
                        id,
                        transferred,
                        total_bytes: transferred,
                    });
                    if is_last {
                        if let Err(e) = file.flush().await {
                            send_error(sock, peer, ErrorCode::Undefined, &e.to_string()).await;
                            return Err(anyhow!("flush failed for {}: {e}", path.display()));
                        }
                        return Ok(());
                    }
                } else if !seq_after(block_num, expected) {
                    // Duplicate of an already-accepted block: re-ack the
                    // last block we actually accepted, write nothing.
                    send_ack(sock, peer, last_acked).await?;
                }
                // else: a block further ahead than expected. Lock-step
                // peers never produce this; drop it silently.
            }
            Ok(Some(Packet::ERROR { code, msg })) => {
                return Err(anyhow!("peer reported error {code}: {msg}"));
            }
            Ok(Some(_)) => { /* unexpected packet on this queue; ignore */ }
            Ok(None) => return Err(anyhow!("transfer queue closed")),
            Err(_elapsed) => {
                timeouts += 1;
                if timeouts >= RECEIVER_MAX_RETRIES {
                    // Silent abort: no ERROR packet per spec §7.
                    return Err(anyhow!(
                        "timed out after {RECEIVER_MAX_RETRIES} consecutive retries waiting for block {expected}",
                        expected = last_acked.wrapping_add(1)
                    ));
                }
                send_ack(sock, peer, last_acked).await?;
            }
        }
    }
}

async fn send_ack(sock: &UdpSocket, peer: SocketAddr, block_num: u16) -> Result<()> {
    let bytes = Packet::ACK { block_num }.to_bytes();
    sock.send_to(&bytes, peer).await?;
    Ok(())
}

async fn send_error(sock: &UdpSocket, peer: SocketAddr, code: ErrorCode, msg: &str) {
    let bytes = Packet::error(code, msg).to_bytes();
    let _ = sock.send_to(&bytes, peer).await;
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

/// Confine a client-supplied filename to the served directory. Rejects
/// absolute paths and `..` traversal; otherwise resolves relative to `dir`.
pub(crate) fn sanitize_path(dir: &Path, filename: &str) -> Result<PathBuf> {
    let normalized = filename.replace('\\', "/");

    if normalized.starts_with('/') {
        return Err(anyhow!("absolute paths are not allowed"));
    }

    for component in normalized.split('/') {
        if component == ".." {
            return Err(anyhow!("path traversal is not allowed"));
        }
    }

    let clean: PathBuf = normalized
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();

    if clean.as_os_str().is_empty() {
        return Err(anyhow!("invalid filename"));
    }

    Ok(dir.join(clean))
}
