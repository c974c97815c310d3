//! Content-addressed identifiers for uploaded files
//!
//! SHA-256 over the full file content, truncated to 16 lowercase hex
//! characters. Identical bytes always give the identical hash, regardless of
//! file name or location.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use stemsync_common::{Error, Result};

/// Hex characters kept from the digest
pub const HASH_LEN: usize = 16;

const CHUNK_SIZE: usize = 64 * 1024;

/// 16-character lowercase hex content identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentHash(String);

impl ContentHash {
    /// Accept an existing hash string (e.g. from a URL path)
    ///
    /// Returns `None` unless the value is exactly 16 lowercase hex characters,
    /// which also keeps it safe to join onto a directory path.
    pub fn parse(value: &str) -> Option<Self> {
        let valid = value.len() == HASH_LEN
            && value
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| ContentHash(value.to_string()))
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

/// Hash any reader in 64 KiB chunks
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<ContentHash> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let hex = format!("{:x}", hasher.finalize());
    Ok(ContentHash(hex[..HASH_LEN].to_string()))
}

/// Hash a file on the calling thread
pub fn hash_file(path: &Path) -> Result<ContentHash> {
    let file = std::fs::File::open(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to open {} for hashing: {}", path.display(), e),
        ))
    })?;

    let hash = hash_reader(std::io::BufReader::new(file)).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read {} for hashing: {}", path.display(), e),
        ))
    })?;

    tracing::debug!(path = %path.display(), hash = %hash, "Calculated content hash");
    Ok(hash)
}

/// Hash a file on the blocking pool
pub async fn hash_file_async(path: &Path) -> Result<ContentHash> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| Error::Internal(format!("Hash calculation task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, bytes: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_known_digest_prefix() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223...
        let hash = hash_reader(&b"abc"[..]).unwrap();
        assert_eq!(hash.as_str(), "ba7816bf8f01cfea");
    }

    #[test]
    fn test_identical_content_identical_hash() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let a = write_file(&dir, "a.wav", &content);
        let b = write_file(&dir, "renamed.bin", &content);

        let ha = hash_file(&a).unwrap();
        let hb = hash_file(&b).unwrap();
        assert_eq!(ha, hb);
        assert_eq!(ha.as_str().len(), 16);
        assert!(ha.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_single_byte_change_changes_hash() {
        let dir = TempDir::new().unwrap();
        let mut content: Vec<u8> = (0..150_000u32).map(|i| (i % 7) as u8).collect();
        let a = write_file(&dir, "a.wav", &content);
        // Flip a byte past the first chunk boundary
        content[100_000] ^= 0x01;
        let b = write_file(&dir, "b.wav", &content);

        assert_ne!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = hash_file(&dir.path().join("missing.wav")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_parse_validates() {
        assert!(ContentHash::parse("0123456789abcdef").is_some());
        assert!(ContentHash::parse("0123456789ABCDEF").is_none());
        assert!(ContentHash::parse("../../etc/passwd").is_none());
        assert!(ContentHash::parse("0123").is_none());
    }

    #[tokio::test]
    async fn test_async_matches_sync() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.wav", b"some audio bytes");
        assert_eq!(hash_file_async(&path).await.unwrap(), hash_file(&path).unwrap());
    }
}
