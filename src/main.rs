use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

use tftpd_rs::dispatcher;
use tftpd_rs::events::ServerEvent;

/// A concurrent TFTP server (RFC 1350, octet mode only).
#[derive(Parser, Debug)]
#[command(name = "tftpd-rs", version, about)]
struct Cli {
    /// UDP port to listen on.
    #[arg(short, long, env = "TFTPD_PORT", default_value_t = 8069)]
    port: u16,

    /// Directory to serve / receive files.
    #[arg(short, long, default_value = ".")]
    dir: PathBuf,

    /// Optional file path to additionally write logs to.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(cli.log_file.as_deref())?;

    let dir = std::fs::canonicalize(&cli.dir)?;

    // Channel: dispatcher/transfers -> logging sink.
    let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Shutdown signal, fired on Ctrl-C.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sock = dispatcher::bind(cli.port).await?;

    let server_handle = {
        let dir = dir.clone();
        let tx = ev_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher::serve(sock, dir, tx.clone(), shutdown_rx).await {
                let _ = tx.send(ServerEvent::Log(format!("Server fatal: {e}")));
            }
        })
    };

    let drain_handle = tokio::spawn(async move {
        while let Some(ev) = ev_rx.recv().await {
            log_event(ev);
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("ctrl-c received, shutting down");
    let _ = shutdown_tx.send(true);

    let _ = server_handle.await;
    drop(ev_tx);
    let _ = drain_handle.await;

    Ok(())
}

/// Fold a `ServerEvent` into a structured log line.
fn log_event(ev: ServerEvent) {
    match ev {
        ServerEvent::Log(msg) => tracing::info!("{msg}"),
        ServerEvent::TransferStarted(info) => {
            tracing::info!(
                id = info.id,
                peer = %info.peer,
                filename = %info.filename,
                kind = ?info.kind,
                "transfer started"
            );
        }
        ServerEvent::TransferProgress {
            id,
            transferred,
            total_bytes,
        } => {
            tracing::debug!(id, transferred, total_bytes, "transfer progress");
        }
        ServerEvent::TransferComplete(id) => {
            tracing::info!(id, "transfer complete");
        }
        ServerEvent::TransferFailed { id, error } => {
            tracing::warn!(id, error, "transfer failed");
        }
    }
}

/// Install a `tracing` subscriber. When `log_file` is given its output is
/// duplicated to that file via a non-blocking appender; the returned guard
/// must be kept alive for the life of the process.
fn init_logging(
    log_file: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("log file path has no file name"))?;
            let file_appender =
                tracing_appender::rolling::never(dir.unwrap_or_else(|| std::path::Path::new(".")), file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking.and(std::io::stdout))
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}
