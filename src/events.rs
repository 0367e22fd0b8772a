use std::net::SocketAddr;
use std::time::Instant;

/// Direction of a transfer, named from the server's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// RRQ: the client is downloading from us.
    Download,
    /// WRQ: the client is uploading to us.
    Upload,
}

/// A snapshot of a running transfer.
#[derive(Debug, Clone)]
pub struct TransferInfo {
    pub id: u64,
    pub peer: SocketAddr,
    pub filename: String,
    pub kind: TransferKind,
    /// Total file size in bytes; known up front for downloads, grows with
    /// bytes received for uploads.
    pub total_bytes: u64,
    pub transferred: u64,
    pub started: Instant,
}

/// Lifecycle events emitted by the dispatcher and transfer tasks.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Log(String),
    TransferStarted(TransferInfo),
    TransferProgress {
        id: u64,
        transferred: u64,
        total_bytes: u64,
    },
    TransferComplete(u64),
    TransferFailed {
        id: u64,
        error: String,
    },
}
