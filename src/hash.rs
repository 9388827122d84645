//! SHA-256 content digests.

use std::fmt;

use openssl::sha::Sha256;
use thiserror::Error;

/// A 32-byte SHA-256 digest, used throughout the meta-tree as a chunk's
/// identity. Total ordering is lexicographic on the raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sha256Digest([u8; 32]);

#[derive(Error, Debug)]
pub enum ParseDigestError {
    #[error("digest must be exactly 32 bytes, got {0}")]
    WrongLength(usize),
    #[error("invalid hex digest: {0}")]
    InvalidHex(String),
}

impl Sha256Digest {
    /// Computes the digest of a block of data.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finish())
    }

    /// A streaming hasher for callers that don't want to buffer the whole input.
    pub fn hasher() -> Hasher {
        Hasher(Sha256::new())
    }

    /// Parses a digest from 32 raw bytes.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses a digest from a raw byte slice, failing if the length is wrong.
    pub fn parse_raw(bytes: &[u8]) -> Result<Self, ParseDigestError> {
        if bytes.len() != 32 {
            return Err(ParseDigestError::WrongLength(bytes.len()));
        }
        let mut raw = [0u8; 32];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }

    /// Parses a digest from its 64-character lower-case hex form.
    pub fn parse_hex(s: &str) -> Result<Self, ParseDigestError> {
        if s.len() != 64 {
            return Err(ParseDigestError::InvalidHex(s.to_string()));
        }
        let mut raw = [0u8; 32];
        for (i, byte) in raw.iter_mut().enumerate() {
            let hi = s.as_bytes()[i * 2];
            let lo = s.as_bytes()[i * 2 + 1];
            let hi = (hi as char)
                .to_digit(16)
                .ok_or_else(|| ParseDigestError::InvalidHex(s.to_string()))?;
            let lo = (lo as char)
                .to_digit(16)
                .ok_or_else(|| ParseDigestError::InvalidHex(s.to_string()))?;
            *byte = ((hi << 4) | lo) as u8;
        }
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The lower-case 64-character hex form of this digest.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in &self.0 {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

impl fmt::Debug for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Digest({})", self.to_hex())
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A streaming SHA-256 hasher, for encoding large chunks without buffering
/// the whole digest input up front.
pub struct Hasher(Sha256);

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Sha256Digest {
        Sha256Digest(self.0.finish())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let digest = Sha256Digest::hash(b"helloworld");
        let hex = digest.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, hex.to_lowercase());
        assert_eq!(Sha256Digest::parse_hex(&hex).unwrap(), digest);
    }

    #[test]
    fn equal_content_equal_digest() {
        assert_eq!(Sha256Digest::hash(b"abc"), Sha256Digest::hash(b"abc"));
        assert_ne!(Sha256Digest::hash(b"abc"), Sha256Digest::hash(b"abd"));
    }

    #[test]
    fn ordering_is_lexicographic_on_raw_bytes() {
        let a = Sha256Digest::from_raw([0u8; 32]);
        let mut high = [0u8; 32];
        high[31] = 1;
        let b = Sha256Digest::from_raw(high);
        assert!(a < b);
    }

    #[test]
    fn streaming_hasher_matches_one_shot() {
        let mut hasher = Sha256Digest::hasher();
        hasher.update(b"hello");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), Sha256Digest::hash(b"helloworld"));
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Sha256Digest::parse_raw(&[0u8; 31]).is_err());
        assert!(Sha256Digest::parse_hex("abcd").is_err());
    }
}
