/// Receiving half of a session.
///
/// ```text
/// [socket recv N+1, hash, ack] --+
///                                +-- join --> switch --> next iteration
/// [disk write N]               --+
/// ```
///
/// Every accepted file lands in a shadow file first and is moved into
/// place once its data (and checksum) has arrived.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;

use crate::buffer::DoubleBuffer;
use crate::codec::WireCodec;
use crate::error::TransferError;
use crate::hash::RollingHash;
use crate::installer::{Destination, FileInstaller, ShadowFile};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::protocol::{ChunkHeader, ControlWord, FileMeta, MetaStatus, read_checksum};
use crate::session::{FileOutcome, FileReport, SessionReport, SessionState};

/// Connected, negotiated receiver.
pub struct ReceiverSession<S> {
    codec: WireCodec<S>,
    control: ControlWord,
    chunk_size: usize,
    buffers: DoubleBuffer,
    state: SessionState,
    destination: Arc<dyn Destination>,
    installer: FileInstaller,
    logger: Arc<dyn TransferLogger>,
    connection_id: u64,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ReceiverSession<S> {
    /// Send `control` and read the peer's echo.
    ///
    /// A differing echo is logged and otherwise ignored: this side's control
    /// word stays authoritative.
    pub async fn handshake(
        mut codec: WireCodec<S>,
        control: ControlWord,
        destination: Arc<dyn Destination>,
        logger: Arc<dyn TransferLogger>,
        connection_id: u64,
    ) -> Result<Self, TransferError> {
        let chunk_size = control.chunk_size()?;
        let mut state = SessionState::Connecting;
        state.advance(connection_id, SessionState::Handshaking);

        control.write_to(&mut codec).await?;
        let echoed = ControlWord::read_from(&mut codec).await?;
        if echoed != control {
            logger.log(TransferLog {
                component: "receiver",
                connection_id,
                event: TransferEvent::HandshakeMismatch {
                    sent: control.to_bytes(),
                    echoed: echoed.to_bytes(),
                },
            });
        }
        logger.log(TransferLog {
            component: "receiver",
            connection_id,
            event: TransferEvent::Negotiated {
                chunk_size,
                hashing: control.hashing(),
            },
        });
        state.advance(connection_id, SessionState::AwaitingFileMeta);

        let installer = FileInstaller::new(destination.staging_dir());
        Ok(Self {
            codec,
            control,
            chunk_size,
            buffers: DoubleBuffer::new(chunk_size),
            state,
            destination,
            installer,
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
            component: "receiver",
            connection_id: self.connection_id,
            event,
        });
    }

    /// Receive files until the peer closes, then close our side.
    pub async fn run(&mut self) -> SessionReport {
        let mut report = SessionReport::new(self.connection_id);
        loop {
            match self.receive_file().await {
                Ok(Some(file)) => report.files.push(file),
                Ok(None) => break,
                Err(e) => {
                    self.log(TransferEvent::Error {
                        message: e.to_string(),
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

    async fn reply(&mut self, status: MetaStatus) -> Result<(), TransferError> {
        self.codec.write_u64(status.as_u64()).await?;
        self.codec.flush().await
    }

    async fn reject(
        &mut self,
        name: String,
        size: u64,
        status: MetaStatus,
    ) -> Result<FileReport, TransferError> {
        self.reply(status).await?;
        self.log(TransferEvent::FileRejected {
            name: name.clone(),
            size,
            status: status.as_u64(),
        });
        Ok(FileReport {
            name,
            size,
            outcome: FileOutcome::Rejected {
                status: status.as_u64(),
            },
            transferred: 0,
            digest: None,
        })
    }

    /// One metadata frame and everything that follows it. `Ok(None)` when
    /// the peer closed cleanly between files.
    async fn receive_file(&mut self) -> Result<Option<FileReport>, TransferError> {
        let meta = match FileMeta::read_from(&mut self.codec).await {
            Ok(Some(meta)) => meta,
            Ok(None) => return Ok(None),
            Err(TransferError::InvalidName(reason)) => {
                warn!(conn = self.connection_id, "Rejecting file: {}", reason);
                return self
                    .reject(reason, 0, MetaStatus::InvalidName)
                    .await
                    .map(Some);
            }
            Err(e) => return Err(e),
        };
        let started = Instant::now();

        let final_path = match self.destination.resolve(&meta.name) {
            Ok(path) => path,
            Err(e) => {
                warn!(conn = self.connection_id, "Rejecting '{}': {}", meta.name, e);
                return self
                    .reject(meta.name, meta.size, MetaStatus::InvalidName)
                    .await
                    .map(Some);
            }
        };
        let mut shadow = match self.installer.begin(final_path).await {
            Ok(shadow) => shadow,
            Err(e) => {
                warn!(conn = self.connection_id, "Cannot stage '{}': {}", meta.name, e);
                return self
                    .reject(meta.name, meta.size, MetaStatus::StagingFailed)
                    .await
                    .map(Some);
            }
        };

        self.reply(MetaStatus::Accepted).await?;
        self.log(TransferEvent::FileStarted {
            name: meta.name.clone(),
            size: meta.size,
        });
        self.state.advance(self.connection_id, SessionState::InDataLoop);

        let mut hash = RollingHash::new(self.control.hashing());
        let (received, disk_error) = match self.drain_data(&mut shadow, &mut hash).await {
            Ok(v) => v,
            Err(e) => {
                self.log(TransferEvent::FileFailed {
                    name: meta.name.clone(),
                    size: meta.size,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut checksum_ok = true;
        let mut digest = None;
        if hash.is_enabled() {
            self.state.advance(self.connection_id, SessionState::AwaitingChecksum);
            let expected = read_checksum(&mut self.codec).await?;
            let actual = hash.digest();
            if expected == actual {
                self.log(TransferEvent::ChecksumVerified {
                    name: meta.name.clone(),
                    digest: hex::encode(&actual),
                });
            } else {
                checksum_ok = false;
                self.log(TransferEvent::ChecksumMismatch {
                    name: meta.name.clone(),
                    expected: hex::encode(&expected),
                    actual: hex::encode(&actual),
                });
            }
            digest = Some(hex::encode(&actual));
        }
        self.state.advance(self.connection_id, SessionState::AwaitingFileMeta);

        let mut report = FileReport {
            name: meta.name.clone(),
            size: meta.size,
            outcome: FileOutcome::Failed {
                reason: String::new(),
            },
            transferred: received,
            digest,
        };

        if let Some(e) = disk_error {
            shadow.abandon().await;
            let reason = format!("write failed: {}", e);
            self.log(TransferEvent::FileFailed {
                name: meta.name,
                size: meta.size,
                reason: reason.clone(),
            });
            report.outcome = FileOutcome::Failed { reason };
            return Ok(Some(report));
        }

        let size_ok = received == meta.size;
        if !size_ok {
            self.log(TransferEvent::SizeMismatch {
                name: meta.name.clone(),
                expected: meta.size,
                actual: received,
            });
        }

        report.outcome = match shadow.promote(meta.mtime).await {
            Ok(path) => {
                self.log(TransferEvent::FileInstalled {
                    name: meta.name.clone(),
                    path: path.display().to_string(),
                    size: received,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                if !checksum_ok {
                    FileOutcome::IntegrityMismatch { path }
                } else if !size_ok {
                    FileOutcome::SizeMismatch {
                        expected: meta.size,
                        actual: received,
                    }
                } else {
                    FileOutcome::Installed { path }
                }
            }
            Err(TransferError::InstallConflict { target, shadow }) => {
                self.log(TransferEvent::InstallConflict {
                    target: target.display().to_string(),
                    shadow: shadow.display().to_string(),
                });
                FileOutcome::InstallConflict { shadow }
            }
            Err(e) => {
                self.log(TransferEvent::FileFailed {
                    name: meta.name.clone(),
                    size: meta.size,
                    reason: e.to_string(),
                });
                FileOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        Ok(Some(report))
    }

    /// Chunk loop. Returns the bytes received and the first disk error, if
    /// any. After a disk error the stream is still drained to the terminator.
    async fn drain_data(
        &mut self,
        shadow: &mut ShadowFile,
        hash: &mut RollingHash,
    ) -> Result<(u64, Option<io::Error>), TransferError> {
        let max = self.chunk_size;
        let mut received = 0u64;
        let mut pending = 0usize;
        let mut seq = 0u64;
        let mut disk_error: Option<io::Error> = None;

        loop {
            let skip_write = disk_error.is_some() || pending == 0;
            let (fill, drain) = self.buffers.split_mut();
            let to_write = &drain[..pending];
            let (recv_result, write_result) = tokio::join!(
                receive_chunk(&mut self.codec, max, fill, hash, &mut received),
                async {
                    if skip_write {
                        Ok(())
                    } else {
                        shadow.write_chunk(to_write).await
                    }
                },
            );
            if let Err(e) = write_result {
                warn!(
                    conn = self.connection_id,
                    "Write to '{}' failed: {}",
                    shadow.temp_path().display(),
                    e
                );
                disk_error = Some(e);
            }

            let n = recv_result?;
            if n == 0 {
                break;
            }
            seq += 1;
            self.log(TransferEvent::ChunkTransferred {
                seq,
                len: n,
                cumulative: received,
            });
            pending = n;
            self.buffers.switch();
        }
        Ok((received, disk_error))
    }
}

/// Read one chunk into `buf`, hash it and acknowledge the running total.
/// Returns 0 for the end-of-data terminator.
async fn receive_chunk<S: AsyncRead + AsyncWrite + Unpin>(
    codec: &mut WireCodec<S>,
    max: usize,
    buf: &mut [u8],
    hash: &mut RollingHash,
    received: &mut u64,
) -> Result<usize, TransferError> {
    let len = ChunkHeader::read_len(codec, max).await?;
    if len == 0 {
        return Ok(0);
    }
    codec.read_fixed(&mut buf[..len]).await?;
    hash.add(&buf[..len]);
    *received += len as u64;
    codec.write_u64(*received).await?;
    codec.flush().await?;
    Ok(len)
}
