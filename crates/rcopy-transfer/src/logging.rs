/// Transfer logging trait for structured protocol events.
///
/// Both ends of a connection report lifecycle and integrity events through a
/// `TransferLogger`. Where they end up (tracing subscriber, test recorder,
/// nowhere) is the caller's choice.

use std::fmt;

/// Structured log entry for one protocol event.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub connection_id: u64,
    pub event: TransferEvent,
}

/// Events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Handshake finished
    Negotiated {
        chunk_size: usize,
        hashing: bool,
    },
    /// Echoed control word differs from the one sent
    HandshakeMismatch {
        sent: [u8; 2],
        echoed: [u8; 2],
    },
    /// Metadata accepted, data phase starting
    FileStarted {
        name: String,
        size: u64,
    },
    /// Receiver answered the metadata with a nonzero status
    FileRejected {
        name: String,
        size: u64,
        status: u64,
    },
    /// One chunk moved across the wire
    ChunkTransferred {
        seq: u64,
        len: usize,
        cumulative: u64,
    },
    /// Cumulative ack differs from the sender's running total
    AckMismatch {
        name: String,
        expected: u64,
        acked: u64,
    },
    /// Sender: data and checksum delivered
    FileSent {
        name: String,
        size: u64,
        duration_ms: u64,
    },
    /// Checksums agree
    ChecksumVerified {
        name: String,
        digest: String,
    },
    /// Checksums differ. The file stays installed.
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },
    /// Bytes received differ from the announced size
    SizeMismatch {
        name: String,
        expected: u64,
        actual: u64,
    },
    /// Shadow file moved into place
    FileInstalled {
        name: String,
        path: String,
        size: u64,
        duration_ms: u64,
    },
    /// Destination existed at install time
    InstallConflict {
        target: String,
        shadow: String,
    },
    /// File abandoned
    FileFailed {
        name: String,
        size: u64,
        reason: String,
    },
    /// Connection torn down
    SessionClosed {
        files: usize,
        bytes: u64,
    },
    /// Error ending the session
    Error {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negotiated { chunk_size, hashing } => {
                write!(f, "negotiated chunk_size={} md5={}", chunk_size, hashing)
            }
            Self::HandshakeMismatch { sent, echoed } => {
                write!(f, "handshake_mismatch sent={} echoed={}", hex::encode(sent), hex::encode(echoed))
            }
            Self::FileStarted { name, size } => {
                write!(f, "file_started '{}' size={}", name, size)
            }
            Self::FileRejected { name, size, status } => {
                write!(f, "file_rejected '{}' size={} status={}", name, size, status)
            }
            Self::ChunkTransferred { seq, len, cumulative } => {
                write!(f, "chunk seq={} len={} cumulative={}", seq, len, cumulative)
            }
            Self::AckMismatch { name, expected, acked } => {
                write!(f, "ack_mismatch '{}' sent={} acked={}", name, expected, acked)
            }
            Self::FileSent { name, size, duration_ms } => {
                write!(f, "file_sent '{}' size={} duration_ms={}", name, size, duration_ms)
            }
            Self::ChecksumVerified { name, digest } => {
                write!(f, "md5_ok '{}' {}", name, digest)
            }
            Self::ChecksumMismatch { name, expected, actual } => {
                write!(f, "md5_mismatch '{}' sender={} receiver={}", name, expected, actual)
            }
            Self::SizeMismatch { name, expected, actual } => {
                write!(f, "size_mismatch '{}' announced={} received={}", name, expected, actual)
            }
            Self::FileInstalled { name, path, size, duration_ms } => {
                write!(f, "file_installed '{}' -> '{}' size={} duration_ms={}", name, path, size, duration_ms)
            }
            Self::InstallConflict { target, shadow } => {
                write!(f, "install_conflict '{}' exists, data kept at '{}'", target, shadow)
            }
            Self::FileFailed { name, size, reason } => {
                write!(f, "file_failed '{}' size={}: {}", name, size, reason)
            }
            Self::SessionClosed { files, bytes } => {
                write!(f, "session_closed files={} bytes={}", files, bytes)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing, record
/// events for inspection, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // info for lifecycle, warn/error for integrity problems, debug for per-chunk spam
        match &entry.event {
            TransferEvent::ChunkTransferred { .. } => {
                tracing::debug!(
                    component = entry.component,
                    conn = entry.connection_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::HandshakeMismatch { .. }
            | TransferEvent::AckMismatch { .. }
            | TransferEvent::ChecksumMismatch { .. }
            | TransferEvent::FileRejected { .. } => {
                tracing::warn!(
                    component = entry.component,
                    conn = entry.connection_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::SizeMismatch { .. }
            | TransferEvent::InstallConflict { .. }
            | TransferEvent::FileFailed { .. }
            | TransferEvent::Error { .. } => {
                tracing::error!(
                    component = entry.component,
                    conn = entry.connection_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::info!(
                    component = entry.component,
                    conn = entry.connection_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
