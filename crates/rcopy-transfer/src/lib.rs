/// rcopy transfer engine: size-prefixed binary file transfer over TCP.
///
/// Provides the protocol shared by both ends of a connection:
/// - Handshake negotiating chunk size and MD5 integrity checking
/// - Per-file metadata exchange with accept/reject status
/// - Chunked data loop with cumulative acknowledgment
/// - Double-buffered pipelines: disk read overlaps socket send on the
///   sender, socket receive overlaps disk write on the receiver
/// - Shadow-file installation on the receiver that never replaces a file

pub mod buffer;
pub mod codec;
pub mod error;
pub mod hash;
pub mod installer;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

// Re-export key types for convenience.
pub use buffer::DoubleBuffer;
pub use codec::WireCodec;
pub use error::TransferError;
pub use hash::RollingHash;
pub use installer::{Destination, FileInstaller, ShadowFile};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use net::{CONNECT_TIMEOUT, connect, tune_socket};
pub use protocol::{
    CHUNK_SIZE_TABLE, ChunkHeader, ControlWord, DEFAULT_CHUNK_CODE, EXPLICIT_MARKER, FLAG_HASH,
    FileMeta, MetaStatus, chunk_size_for, plan_chunk,
};
pub use receiver::ReceiverSession;
pub use sender::{SenderSession, TransferItem, send_files};
pub use session::{FileOutcome, FileReport, SessionReport, SessionState};
