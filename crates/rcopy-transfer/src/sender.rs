/// Sending half of a session.
///
/// ```text
/// [disk read N+1] --+
///                   +-- join --> switch --> next iteration
/// [send N, ack N] --+
/// ```
///
/// Files go out one after another over a single connection. A file the
/// receiver rejects is skipped; a broken stream ends the session.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::buffer::DoubleBuffer;
use crate::codec::WireCodec;
use crate::error::TransferError;
use crate::hash::RollingHash;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::net::{CONNECT_TIMEOUT, connect};
use crate::protocol::{ChunkHeader, ControlWord, FileMeta, MetaStatus, plan_chunk, write_checksum};
use crate::session::{FileOutcome, FileReport, SessionReport, SessionState};

/// One file queued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferItem {
    /// Name announced on the wire, `/`-separated.
    pub relative_name: String,
    pub source_path: PathBuf,
    pub size: u64,
    /// Unix seconds, 0 if unknown.
    pub mtime: i64,
}

impl TransferItem {
    /// Stat `source_path` and capture its size and modification time.
    pub async fn from_path(
        source_path: impl Into<PathBuf>,
        relative_name: impl Into<String>,
    ) -> io::Result<Self> {
        let source_path = source_path.into();
        let meta = tokio::fs::metadata(&source_path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' is not a regular file", source_path.display()),
            ));
        }
        let mtime = meta.modified().map(unix_secs).unwrap_or(0);
        Ok(Self {
            relative_name: relative_name.into(),
            source_path,
            size: meta.len(),
            mtime,
        })
    }
}

fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Connected, negotiated sender.
pub struct SenderSession<S> {
    codec: WireCodec<S>,
    control: ControlWord,
    chunk_size: usize,
    buffers: DoubleBuffer,
    state: SessionState,
    logger: Arc<dyn TransferLogger>,
    connection_id: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> SenderSession<S> {
    /// Read the listener's control word and echo it back unchanged.
    ///
    /// An unknown chunk-size code is fatal: there is no way to frame chunks.
    pub async fn handshake(
        mut codec: WireCodec<S>,
        logger: Arc<dyn TransferLogger>,
        connection_id: u64,
    ) -> Result<Self, TransferError> {
        let mut state = SessionState::Connecting;
        state.advance(connection_id, SessionState::Handshaking);

        let control = ControlWord::read_from(&mut codec).await?;
        let chunk_size = control.chunk_size()?;
        control.write_to(&mut codec).await?;

        logger.log(TransferLog {
            component: "sender",
            connection_id,
            event: TransferEvent::Negotiated {
                chunk_size,
                hashing: control.hashing(),
            },
        });
        state.advance(connection_id, SessionState::AwaitingFileMeta);

        Ok(Self {
            codec,
            control,
            chunk_size,
            buffers: DoubleBuffer::new(chunk_size),
            state,
            logger,
            connection_id,
        })
    }

    pub fn control(&self) -> ControlWord {
        self.control
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "sender",
            connection_id: self.connection_id,
            event,
        });
    }

    /// Send every item in order, then close the connection.
    pub async fn send_all(&mut self, items: &[TransferItem]) -> SessionReport {
        let mut report = SessionReport::new(self.connection_id);
        for item in items {
            match self.send_file(item).await {
                Ok(file) => report.files.push(file),
                Err(e) => {
                    self.log(TransferEvent::Error {
                        message: e.to_string(),
                    });
                    report.files.push(FileReport {
                        name: item.relative_name.clone(),
                        size: item.size,
                        outcome: FileOutcome::Failed {
                            reason: e.to_string(),
                        },
                        transferred: 0,
                        digest: None,
                    });
                    report.closed_by = Some(e.to_string());
                    break;
                }
            }
        }

        self.state.advance(self.connection_id, SessionState::Closed);
        self.codec.shutdown().await;
        self.log(TransferEvent::SessionClosed {
            files: report.files_ok(),
            bytes: report.bytes(),
        });
        report
    }

    /// Send one file. `Err` only for failures that break the stream; local
    /// problems come back as a report with a non-success outcome.
    async fn send_file(&mut self, item: &TransferItem) -> Result<FileReport, TransferError> {
        let started = Instant::now();
        let mut report = FileReport {
            name: item.relative_name.clone(),
            size: item.size,
            outcome: FileOutcome::Sent,
            transferred: 0,
            digest: None,
        };

        // Open before announcing so a local failure leaves the stream untouched.
        let mut file = match File::open(&item.source_path).await {
            Ok(f) => f,
            Err(e) => {
                return Ok(self.local_failure(
                    report,
                    format!("cannot open '{}': {}", item.source_path.display(), e),
                ));
            }
        };

        let meta = FileMeta {
            mtime: item.mtime,
            size: item.size,
            name: item.relative_name.clone(),
        };
        match meta.write_to(&mut self.codec).await {
            Ok(()) => {}
            Err(e) if !e.breaks_stream() => return Ok(self.local_failure(report, e.to_string())),
            Err(e) => return Err(e),
        }

        let status = self.codec.read_u64().await?;
        if MetaStatus::from_u64(status) != MetaStatus::Accepted {
            self.log(TransferEvent::FileRejected {
                name: item.relative_name.clone(),
                size: item.size,
                status,
            });
            report.outcome = FileOutcome::Rejected { status };
            return Ok(report);
        }

        self.log(TransferEvent::FileStarted {
            name: item.relative_name.clone(),
            size: item.size,
        });
        self.state.advance(self.connection_id, SessionState::InDataLoop);

        let mut hash = RollingHash::new(self.control.hashing());
        let (acked, read_error) = self
            .stream_data(&mut file, &item.relative_name, item.size, &mut hash)
            .await?;
        report.transferred = acked;

        if hash.is_enabled() {
            self.state.advance(self.connection_id, SessionState::AwaitingChecksum);
            let digest = hash.digest();
            write_checksum(&mut self.codec, &digest).await?;
            report.digest = Some(hex::encode(&digest));
        }
        self.state.advance(self.connection_id, SessionState::AwaitingFileMeta);

        if let Some(e) = read_error {
            return Ok(self.local_failure(
                report,
                format!("read failed after {} of {} bytes: {}", acked, item.size, e),
            ));
        }

        self.log(TransferEvent::FileSent {
            name: item.relative_name.clone(),
            size: item.size,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        Ok(report)
    }

    fn local_failure(&self, mut report: FileReport, reason: String) -> FileReport {
        self.log(TransferEvent::FileFailed {
            name: report.name.clone(),
            size: report.size,
            reason: reason.clone(),
        });
        report.outcome = FileOutcome::Failed { reason };
        report
    }

    /// Chunk loop. Returns the last cumulative ack and the disk error that
    /// cut the file short, if any. A disk error ends the data phase with
    /// the terminator so the stream stays in sync.
    async fn stream_data(
        &mut self,
        file: &mut File,
        name: &str,
        size: u64,
        hash: &mut RollingHash,
    ) -> Result<(u64, Option<io::Error>), TransferError> {
        let chunk_size = self.chunk_size;
        let control = self.control;
        let mut remaining = size;
        let mut sent = 0u64;
        let mut acked = 0u64;
        let mut seq = 0u64;
        let mut read_error = None;

        let mut next = plan_chunk(remaining, chunk_size);
        if let Err(e) = read_next(file, &mut self.buffers.fill_mut()[..next]).await {
            read_error = Some(e);
            next = 0;
        }

        loop {
            self.buffers.switch();
            let n = next;
            remaining -= n as u64;
            next = if read_error.is_some() {
                0
            } else {
                plan_chunk(remaining, chunk_size)
            };

            let (fill, drain) = self.buffers.split_mut();
            let (send_result, read_result) = tokio::join!(
                send_chunk(&mut self.codec, control, &drain[..n], hash),
                read_next(file, &mut fill[..next]),
            );
            let ack = send_result?;
            if let Err(e) = read_result {
                read_error = Some(e);
                next = 0;
            }

            if n == 0 {
                break;
            }
            seq += 1;
            sent += n as u64;
            if let Some(ack) = ack {
                acked = ack;
                self.log(TransferEvent::ChunkTransferred {
                    seq,
                    len: n,
                    cumulative: ack,
                });
                if ack != sent {
                    self.log(TransferEvent::AckMismatch {
                        name: name.to_string(),
                        expected: sent,
                        acked: ack,
                    });
                }
            }
        }
        Ok((acked, read_error))
    }
}

async fn read_next(file: &mut File, buf: &mut [u8]) -> io::Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    file.read_exact(buf).await?;
    Ok(())
}

/// Write one chunk and wait for its ack. An empty payload is the end-of-data
/// terminator, which is not acknowledged.
async fn send_chunk<S: AsyncRead + AsyncWrite + Unpin>(
    codec: &mut WireCodec<S>,
    control: ControlWord,
    payload: &[u8],
    hash: &mut RollingHash,
) -> Result<Option<u64>, TransferError> {
    if payload.is_empty() {
        ChunkHeader::END.write_to(codec).await?;
        codec.flush().await?;
        return Ok(None);
    }
    ChunkHeader::for_len(payload.len(), control)?
        .write_to(codec)
        .await?;
    codec.write_fixed(payload).await?;
    codec.flush().await?;
    hash.add(payload);
    Ok(Some(codec.read_u64().await?))
}

/// Connect to a listener at `addr` and send `items` over one connection.
pub async fn send_files(
    addr: &str,
    items: &[TransferItem],
    logger: Arc<dyn TransferLogger>,
    cancel: CancellationToken,
) -> Result<SessionReport, TransferError> {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        r = connect(addr, CONNECT_TIMEOUT) => r?,
    };
    info!("Connected to {}", addr);

    let codec = WireCodec::with_cancellation(stream, cancel);
    let mut session = SenderSession::handshake(codec, logger, 1).await?;
    Ok(session.send_all(items).await)
}
