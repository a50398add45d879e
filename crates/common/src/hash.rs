use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Digest algorithm for blocks and whole files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha256
    }
}

impl HashAlgorithm {
    /// Raw digest length in bytes.
    pub fn digest_len(self) -> usize {
        32
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "SHA256",
            HashAlgorithm::Blake3 => "BLAKE3",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "SHA256" | "SHA-256" => Ok(HashAlgorithm::Sha256),
            "BLAKE3" => Ok(HashAlgorithm::Blake3),
            other => Err(Error::user(format!("unknown hash algorithm: {other}"))),
        }
    }

    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => Hasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    /// One-shot digest of a byte slice.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

/// Incremental digest over stream boundaries.
pub enum Hasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Blake3(h) => h.finalize().as_bytes().to_vec(),
        }
    }
}

/// Catalog representation of a digest: standard base64.
pub fn to_base64(raw: &[u8]) -> String {
    STANDARD.encode(raw)
}

/// Inverse of [`to_base64`].
pub fn from_base64(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|err| Error::integrity(format!("undecodable hash {encoded:?}: {err}")))
}

/// Entry-name representation of a digest: url-safe base64, no padding.
pub fn to_url_safe(raw: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(raw)
}

pub fn from_url_safe(encoded: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|err| Error::integrity(format!("undecodable entry name {encoded:?}: {err}")))
}

/// Convert a catalog hash to the entry-name form.
pub fn base64_to_url_safe(encoded: &str) -> Result<String> {
    Ok(to_url_safe(&from_base64(encoded)?))
}

/// Convert an entry-name hash back to the catalog form.
pub fn url_safe_to_base64(encoded: &str) -> Result<String> {
    Ok(to_base64(&from_url_safe(encoded)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_lengths() {
        assert_eq!(HashAlgorithm::Sha256.digest(b"abc").len(), 32);
        assert_eq!(HashAlgorithm::Blake3.digest(b"abc").len(), 32);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = HashAlgorithm::Sha256.hasher();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), HashAlgorithm::Sha256.digest(b"hello world"));
    }

    #[test]
    fn test_base64_round_trip() {
        let raw = HashAlgorithm::Sha256.digest(b"payload");
        let encoded = to_base64(&raw);
        assert_eq!(from_base64(&encoded).unwrap(), raw);

        let url = base64_to_url_safe(&encoded).unwrap();
        assert!(!url.contains('+') && !url.contains('/') && !url.contains('='));
        assert_eq!(url_safe_to_base64(&url).unwrap(), encoded);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(HashAlgorithm::parse("sha256").unwrap(), HashAlgorithm::Sha256);
        assert_eq!(HashAlgorithm::parse("BLAKE3").unwrap(), HashAlgorithm::Blake3);
        assert!(HashAlgorithm::parse("md5").is_err());
    }
}
