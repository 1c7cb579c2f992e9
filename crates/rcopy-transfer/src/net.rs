use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use crate::error::TransferError;

/// 4 MB socket buffers for throughput.
pub const SOCKET_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Only connection establishment carries a timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Set socket options for throughput. Best effort: a refused option is logged
/// and the connection proceeds with OS defaults.
pub fn tune_socket(stream: &TcpStream) {
    let sock_ref = socket2::SockRef::from(stream);
    if let Err(e) = sock_ref.set_nodelay(true) {
        debug!("set_nodelay failed: {}", e);
    }
    if let Err(e) = sock_ref.set_send_buffer_size(SOCKET_BUF_SIZE) {
        debug!("set_send_buffer_size failed: {}", e);
    }
    if let Err(e) = sock_ref.set_recv_buffer_size(SOCKET_BUF_SIZE) {
        debug!("set_recv_buffer_size failed: {}", e);
    }
}

/// Connect to `addr` (`HOST:PORT`), giving up after `timeout`.
pub async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransferError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            tune_socket(&stream);
            Ok(stream)
        }
        Ok(Err(source)) => Err(TransferError::Connect {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(TransferError::ConnectTimeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = connect(&addr, CONNECT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, TransferError::Connect { .. }));
    }

    #[tokio::test]
    async fn test_connect_and_tune() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = connect(&addr, CONNECT_TIMEOUT).await.unwrap();
        assert!(stream.nodelay().unwrap());
        accept.await.unwrap();
    }
}
