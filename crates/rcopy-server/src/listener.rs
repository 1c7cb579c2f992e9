//! Accept loop and per-connection workers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcopy_transfer::{
    ControlWord, Destination, ReceiverSession, TransferLogger, WireCodec, tune_socket,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::allow::IpAllow;
use crate::dispatcher::{ConnectionDispatcher, ConnectionSlot};

/// Pause after a failed accept (e.g. out of descriptors) before retrying.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a worker needs, shared by all connections.
pub struct ServerConfig {
    pub control: ControlWord,
    pub allow: IpAllow,
    pub destination: Arc<dyn Destination>,
    pub logger: Arc<dyn TransferLogger>,
}

/// Accept connections until `cancel` fires, then wait for open connections
/// to tear down. Cancelling also fails every worker's pending socket I/O.
pub async fn serve(listener: TcpListener, config: ServerConfig, cancel: CancellationToken) {
    let config = Arc::new(config);
    let dispatcher: ConnectionDispatcher<TcpStream> = ConnectionDispatcher::new();
    let tracker = TaskTracker::new();

    if let Ok(addr) = listener.local_addr() {
        info!(
            "Listening on {} (chunk code {}, md5 {})",
            addr,
            config.control.chunk_size_code,
            if config.control.hashing() { "on" } else { "off" }
        );
    }

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, addr)) => {
                let id = dispatcher.enqueue(stream);
                debug!("#{} accepted from {}", id, addr);
                let dispatcher = dispatcher.clone();
                let config = config.clone();
                let cancel = cancel.child_token();
                tracker.spawn(async move {
                    handle_connection(dispatcher, config, cancel).await;
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracker.close();
    if !tracker.is_empty() {
        info!("Waiting for {} connection(s) to close", tracker.len());
    }
    tracker.wait().await;
    info!("Listener stopped");
}

fn show(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "?".into())
}

async fn handle_connection(
    dispatcher: ConnectionDispatcher<TcpStream>,
    config: Arc<ServerConfig>,
    cancel: CancellationToken,
) {
    let Some(ConnectionSlot { id, mut socket }) = dispatcher.dequeue() else {
        error!("Worker started with no queued connection");
        return;
    };

    let local = socket.local_addr().ok();
    let remote = socket.peer_addr().ok();
    if !config
        .allow
        .allows_ip(local.map(|a| a.ip()), remote.map(|a| a.ip()))
    {
        info!("#{} '{}' rejected (local '{}')", id, show(remote), show(local));
        let _ = socket.shutdown().await;
        return;
    }
    info!("#{} '{}' connected", id, show(remote));
    tune_socket(&socket);

    let codec = WireCodec::with_cancellation(socket, cancel);
    let mut session = match ReceiverSession::handshake(
        codec,
        config.control,
        config.destination.clone(),
        config.logger.clone(),
        id,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!("#{} handshake failed: {}", id, e);
            return;
        }
    };

    let report = session.run().await;
    match &report.closed_by {
        None => info!(
            "#{} closed: {} installed, {} failed, {} bytes",
            id,
            report.files_ok(),
            report.files_failed(),
            report.bytes()
        ),
        Some(reason) => warn!(
            "#{} aborted after {} file(s): {}",
            id,
            report.files.len(),
            reason
        ),
    }
}
