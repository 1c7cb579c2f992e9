//! Session state and per-file outcomes shared by both halves.

use std::fmt;
use std::path::PathBuf;

use tracing::trace;

/// Where a connection is in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    AwaitingFileMeta,
    InDataLoop,
    AwaitingChecksum,
    Closed,
}

impl SessionState {
    /// Move to `next`, logging the transition.
    pub fn advance(&mut self, connection_id: u64, next: SessionState) {
        trace!(conn = connection_id, "state {:?} -> {:?}", self, next);
        *self = next;
    }
}

/// How one file ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// Sender side: data (and checksum) delivered.
    Sent,
    Installed { path: PathBuf },
    Rejected { status: u64 },
    /// Installed, but the checksums disagree.
    IntegrityMismatch { path: PathBuf },
    /// Installed, but fewer or more bytes arrived than announced.
    SizeMismatch { expected: u64, actual: u64 },
    /// Destination existed; the data stays in the shadow file.
    InstallConflict { shadow: PathBuf },
    Failed { reason: String },
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Sent | Self::Installed { .. })
    }
}

impl fmt::Display for FileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sent => write!(f, "sent"),
            Self::Installed { path } => write!(f, "installed at '{}'", path.display()),
            Self::Rejected { status } => write!(f, "rejected (status {})", status),
            Self::IntegrityMismatch { path } => {
                write!(f, "checksum mismatch, installed at '{}'", path.display())
            }
            Self::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: announced {}, received {}", expected, actual)
            }
            Self::InstallConflict { shadow } => {
                write!(f, "destination exists, data kept at '{}'", shadow.display())
            }
            Self::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileReport {
    pub name: String,
    pub size: u64,
    pub outcome: FileOutcome,
    /// Bytes moved in the data loop (sender: last cumulative ack).
    pub transferred: u64,
    /// Hex MD5 of the payload, when hashing was negotiated.
    pub digest: Option<String>,
}

/// Result of one connection.
#[derive(Debug, Clone, Default)]
pub struct SessionReport {
    pub connection_id: u64,
    pub files: Vec<FileReport>,
    /// Error that ended the session early, if any.
    pub closed_by: Option<String>,
}

impl SessionReport {
    pub fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            ..Default::default()
        }
    }

    pub fn files_ok(&self) -> usize {
        self.files.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn files_failed(&self) -> usize {
        self.files.len() - self.files_ok()
    }

    pub fn bytes(&self) -> u64 {
        self.files.iter().map(|r| r.transferred).sum()
    }
}
