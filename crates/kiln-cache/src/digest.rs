use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};
use std::path::Path;

/// A stable SHA-256 content digest stored as a lowercase hex string.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digest of an arbitrary byte slice.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes.as_ref());
        Self(hex::encode(hasher.finalize()))
    }

    /// Digest of bytes read from `reader`, streaming in 64 KiB chunks so large
    /// payload files are never pulled into memory whole.
    pub fn from_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = [0_u8; 64 * 1024];
        loop {
            let read = reader.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Digest of a file's contents.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(file)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex() {
        let digest = ContentDigest::from_bytes(b"hello");
        assert_eq!(
            digest.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn reader_and_bytes_agree() {
        let payload = vec![0xA5_u8; 3 * 64 * 1024 + 17];
        let from_bytes = ContentDigest::from_bytes(&payload);
        let from_reader = ContentDigest::from_reader(std::io::Cursor::new(&payload)).unwrap();
        assert_eq!(from_bytes, from_reader);
    }

    #[test]
    fn file_digest_matches_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("payload.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            ContentDigest::from_file(&path).unwrap(),
            ContentDigest::from_bytes(b"hello")
        );
    }
}
