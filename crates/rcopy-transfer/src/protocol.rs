//! rcopy wire format. All integers little-endian.
//!
//! ```text
//! Control word    [code u8][flags u8]                 flags bit0 = MD5 required
//! File metadata   [mtime i64][size u64][len u16][name utf-8]
//! Metadata ack    [status u64]                        0 = proceed
//! Full chunk      [code u8][payload: table[code] bytes]
//! Explicit chunk  [0x00][len u16][payload: len bytes] len 0 = end of data
//! Chunk ack       [cumulative bytes u64]              not sent for end of data
//! Checksum        [len u16][digest]                   only when MD5 negotiated
//! ```

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::WireCodec;
use crate::error::TransferError;

/// Chunk-size code to payload size.
pub const CHUNK_SIZE_TABLE: [(u8, usize); 5] = [
    (1, 8 * 1024),
    (2, 32 * 1024),
    (3, 128 * 1024),
    (4, 512 * 1024),
    (5, 1024 * 1024),
];

/// Marker byte announcing an explicit 16-bit length. Never a valid code.
pub const EXPLICIT_MARKER: u8 = 0x00;

/// Default chunk-size code (32 KiB).
pub const DEFAULT_CHUNK_CODE: u8 = 2;

/// Control-word flag: MD5 checksum exchange after every file.
pub const FLAG_HASH: u8 = 0x01;

/// Largest payload an explicit chunk can carry.
pub const MAX_EXPLICIT_LEN: usize = u16::MAX as usize;

/// Largest file name accepted on the wire.
pub const MAX_NAME_LEN: usize = u16::MAX as usize;

/// Look up the payload size for a chunk-size code.
pub fn chunk_size_for(code: u8) -> Option<usize> {
    CHUNK_SIZE_TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, size)| *size)
}

/// Length of the next chunk given the bytes still to send.
///
/// Full chunks go out while at least `chunk_size` bytes remain. A shorter tail
/// travels as explicit chunks, which are capped at 65535 bytes by the length
/// field. Returns 0 once nothing remains.
pub fn plan_chunk(remaining: u64, chunk_size: usize) -> usize {
    if remaining >= chunk_size as u64 {
        chunk_size
    } else {
        (remaining as usize).min(MAX_EXPLICIT_LEN)
    }
}

/// Handshake pair sent by the listener: chunk-size code and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlWord {
    pub chunk_size_code: u8,
    pub flags: u8,
}

impl ControlWord {
    pub fn new(chunk_size_code: u8, hashing: bool) -> Result<Self, TransferError> {
        if chunk_size_for(chunk_size_code).is_none() {
            return Err(TransferError::UnknownChunkCode(chunk_size_code));
        }
        Ok(Self {
            chunk_size_code,
            flags: if hashing { FLAG_HASH } else { 0 },
        })
    }

    pub fn hashing(&self) -> bool {
        self.flags & FLAG_HASH != 0
    }

    pub fn chunk_size(&self) -> Result<usize, TransferError> {
        chunk_size_for(self.chunk_size_code)
            .ok_or(TransferError::UnknownChunkCode(self.chunk_size_code))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        [self.chunk_size_code, self.flags]
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        Self {
            chunk_size_code: bytes[0],
            flags: bytes[1],
        }
    }

    pub async fn write_to<S: AsyncWrite + Unpin>(
        self,
        codec: &mut WireCodec<S>,
    ) -> Result<(), TransferError> {
        codec.write_fixed(&self.to_bytes()).await?;
        codec.flush().await
    }

    pub async fn read_from<S: AsyncRead + Unpin>(
        codec: &mut WireCodec<S>,
    ) -> Result<Self, TransferError> {
        let mut buf = [0u8; 2];
        codec.read_fixed(&mut buf).await?;
        Ok(Self::from_bytes(buf))
    }
}

impl Default for ControlWord {
    fn default() -> Self {
        Self {
            chunk_size_code: DEFAULT_CHUNK_CODE,
            flags: FLAG_HASH,
        }
    }
}

/// Per-file metadata announced by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    /// Modification time in unix seconds. 0 means unknown.
    pub mtime: i64,
    pub size: u64,
    pub name: String,
}

impl FileMeta {
    /// Serialize into a single frame so it leaves in one write.
    pub fn encode(&self) -> Result<BytesMut, TransferError> {
        let name = self.name.as_bytes();
        if name.len() > MAX_NAME_LEN {
            return Err(TransferError::NameTooLong(name.len()));
        }
        let mut buf = BytesMut::with_capacity(18 + name.len());
        buf.put_i64_le(self.mtime);
        buf.put_u64_le(self.size);
        buf.put_u16_le(name.len() as u16);
        buf.put_slice(name);
        Ok(buf)
    }

    pub async fn write_to<S: AsyncWrite + Unpin>(
        &self,
        codec: &mut WireCodec<S>,
    ) -> Result<(), TransferError> {
        let frame = self.encode()?;
        codec.write_fixed(&frame).await?;
        codec.flush().await
    }

    /// Read the next metadata frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly before the
    /// first byte. A name that is empty or not UTF-8 yields `InvalidName`
    /// after the whole frame has been consumed, so the stream stays usable.
    pub async fn read_from<S: AsyncRead + Unpin>(
        codec: &mut WireCodec<S>,
    ) -> Result<Option<Self>, TransferError> {
        let mtime = match codec.read_i64().await {
            Ok(v) => v,
            Err(TransferError::ShortRead { got: 0, .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let size = codec.read_u64().await?;
        let name_len = codec.read_u16().await? as usize;
        let raw = codec.read_bytes(name_len).await?;
        if raw.is_empty() {
            return Err(TransferError::InvalidName("empty name".into()));
        }
        let name = String::from_utf8(raw)
            .map_err(|_| TransferError::InvalidName("name is not valid UTF-8".into()))?;
        Ok(Some(Self { mtime, size, name }))
    }
}

/// Receiver's answer to a metadata frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStatus {
    Accepted,
    InvalidName,
    StagingFailed,
    Other(u64),
}

impl MetaStatus {
    pub fn as_u64(self) -> u64 {
        match self {
            Self::Accepted => 0,
            Self::InvalidName => 1,
            Self::StagingFailed => 2,
            Self::Other(v) => v,
        }
    }

    pub fn from_u64(value: u64) -> Self {
        match value {
            0 => Self::Accepted,
            1 => Self::InvalidName,
            2 => Self::StagingFailed,
            v => Self::Other(v),
        }
    }
}

/// Prefix in front of every chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    /// Payload is exactly `table[code]` bytes.
    Full(u8),
    /// Payload length follows explicitly. 0 ends the file's data.
    Explicit(u16),
}

impl ChunkHeader {
    pub const END: ChunkHeader = ChunkHeader::Explicit(0);

    /// Header for a chunk of `len` bytes under `control`.
    pub fn for_len(len: usize, control: ControlWord) -> Result<Self, TransferError> {
        let full = control.chunk_size()?;
        if len == full {
            Ok(Self::Full(control.chunk_size_code))
        } else if len <= MAX_EXPLICIT_LEN && len < full {
            Ok(Self::Explicit(len as u16))
        } else {
            Err(TransferError::ChunkTooLarge { len, max: full.min(MAX_EXPLICIT_LEN) })
        }
    }

    pub async fn write_to<S: AsyncWrite + Unpin>(
        self,
        codec: &mut WireCodec<S>,
    ) -> Result<(), TransferError> {
        match self {
            Self::Full(code) => codec.write_u8(code).await,
            Self::Explicit(len) => {
                let [lo, hi] = len.to_le_bytes();
                codec.write_fixed(&[EXPLICIT_MARKER, lo, hi]).await
            }
        }
    }

    /// Read a header and return the payload length it announces.
    ///
    /// `max` is the negotiated chunk size; anything larger is a protocol
    /// violation the connection cannot recover from.
    pub async fn read_len<S: AsyncRead + Unpin>(
        codec: &mut WireCodec<S>,
        max: usize,
    ) -> Result<usize, TransferError> {
        let marker = codec.read_u8().await?;
        let len = if marker == EXPLICIT_MARKER {
            codec.read_u16().await? as usize
        } else {
            chunk_size_for(marker).ok_or(TransferError::UnexpectedMarker(marker))?
        };
        if len > max {
            return Err(TransferError::ChunkTooLarge { len, max });
        }
        Ok(len)
    }
}

/// Send a digest as `[len u16][bytes]`.
pub async fn write_checksum<S: AsyncWrite + Unpin>(
    codec: &mut WireCodec<S>,
    digest: &[u8],
) -> Result<(), TransferError> {
    codec.write_u16(digest.len() as u16).await?;
    codec.write_fixed(digest).await?;
    codec.flush().await
}

pub async fn read_checksum<S: AsyncRead + Unpin>(
    codec: &mut WireCodec<S>,
) -> Result<Vec<u8>, TransferError> {
    let len = codec.read_u16().await? as usize;
    codec.read_bytes(len).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(meta: &FileMeta) -> FileMeta {
        let mut writer = WireCodec::new(Vec::new());
        meta.write_to(&mut writer).await.unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes.len(), 18 + meta.name.len());
        let mut reader = WireCodec::new(&bytes[..]);
        FileMeta::read_from(&mut reader).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_file_meta_round_trip() {
        let cases = [
            FileMeta { mtime: 0, size: 0, name: "a".into() },
            FileMeta { mtime: 1_700_000_000, size: 10 * 1024 * 1024, name: "dir/sub/file.bin".into() },
            FileMeta { mtime: -86_400, size: u64::MAX, name: "répertoire/データ.txt".into() },
            FileMeta { mtime: i64::MAX, size: 1, name: "x".repeat(MAX_NAME_LEN) },
        ];
        for meta in &cases {
            assert_eq!(&round_trip(meta).await, meta);
        }
    }

    #[tokio::test]
    async fn test_file_meta_clean_close() {
        let mut reader = WireCodec::new(&[][..]);
        assert!(FileMeta::read_from(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_meta_truncated_is_short_read() {
        let frame = FileMeta { mtime: 1, size: 2, name: "abc".into() }.encode().unwrap();
        let mut reader = WireCodec::new(&frame[..frame.len() - 1]);
        let err = FileMeta::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransferError::ShortRead { .. }));
    }

    #[tokio::test]
    async fn test_file_meta_invalid_utf8_consumes_frame() {
        let mut frame = BytesMut::new();
        frame.put_i64_le(0);
        frame.put_u64_le(3);
        frame.put_u16_le(2);
        frame.put_slice(&[0xFF, 0xFE]);
        frame.put_u8(0x42);
        let mut reader = WireCodec::new(&frame[..]);
        let err = FileMeta::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidName(_)));
        assert!(!err.breaks_stream());
        assert_eq!(reader.read_u8().await.unwrap(), 0x42);
    }

    #[test]
    fn test_name_too_long() {
        let meta = FileMeta { mtime: 0, size: 0, name: "y".repeat(MAX_NAME_LEN + 1) };
        assert!(matches!(meta.encode(), Err(TransferError::NameTooLong(_))));
    }

    #[test]
    fn test_chunk_size_table() {
        assert_eq!(chunk_size_for(1), Some(8 * 1024));
        assert_eq!(chunk_size_for(2), Some(32 * 1024));
        assert_eq!(chunk_size_for(5), Some(1024 * 1024));
        assert_eq!(chunk_size_for(0), None);
        assert_eq!(chunk_size_for(6), None);
        assert!(CHUNK_SIZE_TABLE.iter().all(|(code, size)| *code != EXPLICIT_MARKER && *size > 0));
    }

    #[test]
    fn test_control_word() {
        let cw = ControlWord::new(3, true).unwrap();
        assert_eq!(cw.to_bytes(), [3, FLAG_HASH]);
        assert!(cw.hashing());
        assert_eq!(cw.chunk_size().unwrap(), 128 * 1024);
        assert!(!ControlWord::new(3, false).unwrap().hashing());
        assert!(matches!(ControlWord::new(9, true), Err(TransferError::UnknownChunkCode(9))));
        assert!(ControlWord::from_bytes([7, 0]).chunk_size().is_err());
    }

    #[test]
    fn test_chunk_accounting() {
        for code in 1..=5u8 {
            let chunk = chunk_size_for(code).unwrap();
            for size in [0u64, 1, 4095, chunk as u64 - 1, chunk as u64, chunk as u64 + 1, 10 * 1024 * 1024 + 7] {
                let mut remaining = size;
                let mut total = 0u64;
                loop {
                    let n = plan_chunk(remaining, chunk);
                    if n == 0 {
                        break;
                    }
                    assert!(n == chunk || n <= MAX_EXPLICIT_LEN);
                    let cw = ControlWord::new(code, false).unwrap();
                    ChunkHeader::for_len(n, cw).unwrap();
                    total += n as u64;
                    remaining -= n as u64;
                }
                assert_eq!(total, size, "code {} size {}", code, size);
            }
        }
    }

    #[tokio::test]
    async fn test_chunk_header_encoding() {
        let cw = ControlWord::new(2, true).unwrap();
        let mut writer = WireCodec::new(Vec::new());
        ChunkHeader::for_len(32 * 1024, cw).unwrap().write_to(&mut writer).await.unwrap();
        ChunkHeader::for_len(300, cw).unwrap().write_to(&mut writer).await.unwrap();
        ChunkHeader::END.write_to(&mut writer).await.unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes, vec![2, EXPLICIT_MARKER, 0x2C, 0x01, EXPLICIT_MARKER, 0, 0]);

        let mut reader = WireCodec::new(&bytes[..]);
        assert_eq!(ChunkHeader::read_len(&mut reader, 32 * 1024).await.unwrap(), 32 * 1024);
        assert_eq!(ChunkHeader::read_len(&mut reader, 32 * 1024).await.unwrap(), 300);
        assert_eq!(ChunkHeader::read_len(&mut reader, 32 * 1024).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_chunk_header_over_maximum() {
        // code 3 (128 KiB) against an 8 KiB negotiation
        let bytes = [3u8];
        let mut reader = WireCodec::new(&bytes[..]);
        let err = ChunkHeader::read_len(&mut reader, 8 * 1024).await.unwrap_err();
        assert!(matches!(err, TransferError::ChunkTooLarge { .. }));

        let bytes = [EXPLICIT_MARKER, 0x01, 0x20];
        let mut reader = WireCodec::new(&bytes[..]);
        let err = ChunkHeader::read_len(&mut reader, 8 * 1024).await.unwrap_err();
        assert!(matches!(err, TransferError::ChunkTooLarge { len: 8193, .. }));

        let bytes = [0x7Fu8];
        let mut reader = WireCodec::new(&bytes[..]);
        let err = ChunkHeader::read_len(&mut reader, 8 * 1024).await.unwrap_err();
        assert!(matches!(err, TransferError::UnexpectedMarker(0x7F)));
    }

    #[test]
    fn test_meta_status_values() {
        assert_eq!(MetaStatus::from_u64(0), MetaStatus::Accepted);
        assert_eq!(MetaStatus::InvalidName.as_u64(), 1);
        assert_eq!(MetaStatus::from_u64(2), MetaStatus::StagingFailed);
        assert_eq!(MetaStatus::from_u64(77).as_u64(), 77);
    }
}
