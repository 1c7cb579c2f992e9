//! Fixed-width field codec over a byte stream.
//!
//! All multi-byte integers are little-endian. Reads and writes loop at the
//! byte level until the requested length is met; a zero-progress read or
//! write ends the operation with `ShortRead` / `ShortWrite`. There is no
//! retry at the message level.
//!
//! Every operation races the codec's cancellation token, so a process-wide
//! shutdown fails whatever socket operation is pending with `Cancelled`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Wraps a stream with typed little-endian field I/O and byte counters.
pub struct WireCodec<S> {
    stream: S,
    cancel: CancellationToken,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S> WireCodec<S> {
    pub fn new(stream: S) -> Self {
        Self::with_cancellation(stream, CancellationToken::new())
    }

    pub fn with_cancellation(stream: S, cancel: CancellationToken) -> Self {
        Self {
            stream,
            cancel,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl<S: AsyncRead + Unpin> WireCodec<S> {
    /// Fill `buf` completely from the stream.
    pub async fn read_fixed(&mut self, buf: &mut [u8]) -> Result<(), TransferError> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            r = read_full(&mut self.stream, buf) => r,
        };
        if result.is_ok() {
            self.bytes_read += buf.len() as u64;
        }
        result
    }

    /// Read exactly `width` bytes into a fresh vector.
    pub async fn read_bytes(&mut self, width: usize) -> Result<Vec<u8>, TransferError> {
        let mut buf = vec![0u8; width];
        self.read_fixed(&mut buf).await?;
        Ok(buf)
    }

    pub async fn read_u8(&mut self) -> Result<u8, TransferError> {
        let mut buf = [0u8; 1];
        self.read_fixed(&mut buf).await?;
        Ok(buf[0])
    }

    pub async fn read_u16(&mut self) -> Result<u16, TransferError> {
        let mut buf = [0u8; 2];
        self.read_fixed(&mut buf).await?;
        Ok(u16::from_le_bytes(buf))
    }

    pub async fn read_u64(&mut self) -> Result<u64, TransferError> {
        let mut buf = [0u8; 8];
        self.read_fixed(&mut buf).await?;
        Ok(u64::from_le_bytes(buf))
    }

    pub async fn read_i64(&mut self) -> Result<i64, TransferError> {
        let mut buf = [0u8; 8];
        self.read_fixed(&mut buf).await?;
        Ok(i64::from_le_bytes(buf))
    }
}

impl<S: AsyncWrite + Unpin> WireCodec<S> {
    /// Write all of `buf` to the stream.
    pub async fn write_fixed(&mut self, buf: &[u8]) -> Result<(), TransferError> {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            r = write_full(&mut self.stream, buf) => r,
        };
        if result.is_ok() {
            self.bytes_written += buf.len() as u64;
        }
        result
    }

    pub async fn write_u8(&mut self, value: u8) -> Result<(), TransferError> {
        self.write_fixed(&[value]).await
    }

    pub async fn write_u16(&mut self, value: u16) -> Result<(), TransferError> {
        self.write_fixed(&value.to_le_bytes()).await
    }

    pub async fn write_u64(&mut self, value: u64) -> Result<(), TransferError> {
        self.write_fixed(&value.to_le_bytes()).await
    }

    pub async fn write_i64(&mut self, value: i64) -> Result<(), TransferError> {
        self.write_fixed(&value.to_le_bytes()).await
    }

    pub async fn flush(&mut self) -> Result<(), TransferError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransferError::Cancelled),
            r = self.stream.flush() => r.map_err(TransferError::from),
        }
    }

    /// Close the write side. Errors are ignored: the peer may already be gone.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransferError> {
    let mut got = 0;
    while got < buf.len() {
        let n = reader.read(&mut buf[got..]).await?;
        if n == 0 {
            return Err(TransferError::ShortRead {
                wanted: buf.len(),
                got,
            });
        }
        got += n;
    }
    Ok(())
}

async fn write_full<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> Result<(), TransferError> {
    let mut written = 0;
    while written < buf.len() {
        let n = writer.write(&buf[written..]).await?;
        if n == 0 {
            return Err(TransferError::ShortWrite {
                wanted: buf.len(),
                written,
            });
        }
        written += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_little_endian_layout() {
        let mut codec = WireCodec::new(Vec::new());
        codec.write_u16(0x0102).await.unwrap();
        codec.write_u64(0x0A0B_0C0D).await.unwrap();
        codec.write_u8(0xEE).await.unwrap();
        assert_eq!(codec.bytes_written(), 11);
        assert_eq!(
            codec.into_inner(),
            vec![0x02, 0x01, 0x0D, 0x0C, 0x0B, 0x0A, 0, 0, 0, 0, 0xEE]
        );
    }

    #[tokio::test]
    async fn test_typed_reads() {
        let mut data = Vec::new();
        data.extend_from_slice(&(-5i64).to_le_bytes());
        data.extend_from_slice(&40000u16.to_le_bytes());
        data.extend_from_slice(&u64::MAX.to_le_bytes());
        let mut codec = WireCodec::new(&data[..]);
        assert_eq!(codec.read_i64().await.unwrap(), -5);
        assert_eq!(codec.read_u16().await.unwrap(), 40000);
        assert_eq!(codec.read_u64().await.unwrap(), u64::MAX);
        assert_eq!(codec.bytes_read(), 18);
    }

    #[tokio::test]
    async fn test_short_read_reports_progress() {
        let data = [1u8, 2, 3];
        let mut codec = WireCodec::new(&data[..]);
        match codec.read_u64().await {
            Err(TransferError::ShortRead { wanted, got }) => {
                assert_eq!(wanted, 8);
                assert_eq!(got, 3);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_across_split_writes() {
        let (client, server) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            let mut codec = WireCodec::new(client);
            codec.write_fixed(&[7u8; 64]).await.unwrap();
        });
        let mut codec = WireCodec::new(server);
        let bytes = codec.read_bytes(64).await.unwrap();
        assert_eq!(bytes, vec![7u8; 64]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_fails_pending_read() {
        let (_client, server) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let mut codec = WireCodec::with_cancellation(server, token.clone());
        token.cancel();
        assert!(matches!(codec.read_u8().await, Err(TransferError::Cancelled)));
    }
}
