//! Streaming content digest used for the end-of-file checksum exchange.

use md5::{Digest, Md5};

/// Incremental MD5 accumulator, or a no-op when hashing was not negotiated.
///
/// `digest()` can be called at any point and does not reset the state. The
/// disabled variant always returns an empty digest, which callers treat as
/// "no checksum exchange".
#[derive(Clone)]
pub enum RollingHash {
    Md5(Md5),
    Disabled,
}

impl RollingHash {
    pub fn new(enabled: bool) -> Self {
        if enabled {
            Self::Md5(Md5::new())
        } else {
            Self::Disabled
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Md5(_))
    }

    pub fn add(&mut self, data: &[u8]) {
        if let Self::Md5(hasher) = self {
            hasher.update(data);
        }
    }

    /// Digest of everything added so far.
    pub fn digest(&self) -> Vec<u8> {
        match self {
            Self::Md5(hasher) => hasher.clone().finalize().to_vec(),
            Self::Disabled => Vec::new(),
        }
    }

    pub fn hex_digest(&self) -> String {
        hex::encode(self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incremental_matches_known_digest() {
        let mut hash = RollingHash::new(true);
        hash.add(b"a");
        hash.add(b"");
        hash.add(b"bc");
        assert_eq!(hash.hex_digest(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_digest_does_not_finalize() {
        let mut hash = RollingHash::new(true);
        hash.add(b"ab");
        let first = hash.digest();
        assert_eq!(first, hash.digest());
        hash.add(b"c");
        assert_ne!(first, hash.digest());
        assert_eq!(hash.digest().len(), 16);
    }

    #[test]
    fn test_disabled_is_empty() {
        let mut hash = RollingHash::new(false);
        hash.add(b"ignored");
        assert!(!hash.is_enabled());
        assert!(hash.digest().is_empty());
        assert_eq!(hash.hex_digest(), "");
    }
}
