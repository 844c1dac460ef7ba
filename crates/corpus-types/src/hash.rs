use std::fmt;

use serde::{Deserialize, Serialize};

/// A cryptographic digest of some content, used as an opaque byte string.
///
/// Resources are deduplicated by their content hash, and documents are
/// identified by the hash the preprocessing module computed for them. The
/// engine never recomputes a digest itself, it only compares and stores the
/// bytes it was given.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(Vec<u8>);

impl ContentHash {
    pub fn new(bytes: impl Into<Vec<u8>>) -> ContentHash {
        ContentHash(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex rendition, used for on-disk directory names.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for ContentHash {
    fn from(bytes: Vec<u8>) -> ContentHash {
        ContentHash(bytes)
    }
}

impl From<&[u8]> for ContentHash {
    fn from(bytes: &[u8]) -> ContentHash {
        ContentHash(bytes.to_vec())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_rendition() {
        let hash = ContentHash::new(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(hash.to_hex(), "deadbeef");
        assert_eq!(format!("{hash}"), "deadbeef");
        assert_eq!(format!("{hash:?}"), "ContentHash(deadbeef)");
    }

    #[test]
    fn ordering_is_bytewise() {
        let a = ContentHash::new(b"aa".as_slice());
        let b = ContentHash::new(b"ab".as_slice());
        assert!(a < b);
        assert_eq!(a, ContentHash::new(b"aa".to_vec()));
    }
}
