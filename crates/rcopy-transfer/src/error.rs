use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the transfer engine.
///
/// Stream-level failures (`breaks_stream() == true`) leave the byte stream at an
/// unknown position and end the session. Everything else is scoped to one file.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Peer closed before the requested number of bytes arrived.
    #[error("short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: usize, got: usize },

    /// Socket accepted no more bytes before the requested length was written.
    #[error("short write: wanted {wanted} bytes, wrote {written}")]
    ShortWrite { wanted: usize, written: usize },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Chunk-size code not present in the lookup table.
    #[error("unknown chunk-size code 0x{0:02x}")]
    UnknownChunkCode(u8),

    /// Chunk length above the negotiated maximum.
    #[error("chunk of {len} bytes exceeds negotiated maximum {max}")]
    ChunkTooLarge { len: usize, max: usize },

    #[error("unexpected chunk marker 0x{0:02x}")]
    UnexpectedMarker(u8),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("file name is {0} bytes, limit is 65535")]
    NameTooLong(usize),

    /// Receiver answered the metadata with a nonzero status.
    #[error("rejected by receiver (status {0})")]
    Rejected(u64),

    /// Destination already existed at install time. The payload stays at `shadow`.
    #[error("'{}' already exists, data kept at '{}'", target.display(), shadow.display())]
    InstallConflict { target: PathBuf, shadow: PathBuf },

    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether this failure leaves the connection unusable for further frames.
    pub fn breaks_stream(&self) -> bool {
        matches!(
            self,
            Self::ShortRead { .. }
                | Self::ShortWrite { .. }
                | Self::Io(_)
                | Self::UnknownChunkCode(_)
                | Self::ChunkTooLarge { .. }
                | Self::UnexpectedMarker(_)
                | Self::Cancelled
        )
    }
}
