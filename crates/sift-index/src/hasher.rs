//! Content fingerprints for files and entities.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// SHA256 of a file's bytes, hex encoded.
///
/// The path only locates the bytes; it is not part of the fingerprint, so a
/// rename with unchanged content keeps its hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed hex digest.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read a file and hash its bytes.
pub async fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let bytes = tokio::fs::read(path).await?;
    Ok(ContentHash::of(&bytes))
}

/// SHA256 over several fields with a separator, used for derived identifiers.
pub(crate) fn digest_fields(fields: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field);
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_sha256_hex() {
        let hash = ContentHash::of(b"test content\n");
        assert_eq!(hash.as_str().len(), 64);
        assert!(hash.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_depends_only_on_bytes() {
        assert_eq!(ContentHash::of(b"def a(): pass"), ContentHash::of(b"def a(): pass"));
        assert_ne!(ContentHash::of(b"def a(): pass"), ContentHash::of(b"def b(): pass"));
    }

    #[tokio::test]
    async fn test_hash_file_ignores_path() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("one.py");
        let second = dir.path().join("two.py");
        std::fs::write(&first, "x = 1\n").unwrap();
        std::fs::write(&second, "x = 1\n").unwrap();

        let a = hash_file(&first).await.unwrap();
        let b = hash_file(&second).await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_digest_fields_separates_fields() {
        assert_ne!(digest_fields(&[b"ab", b"c"]), digest_fields(&[b"a", b"bc"]));
    }
}
