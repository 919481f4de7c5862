//! BLAKE3 content hashing with the `blake3:` tag used across witnesses.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Chunk size for file/stream hashing.
const CHUNK_SIZE: usize = 1024 * 1024; // 1 MiB

/// Hash a byte slice, returning a `blake3:<hex>` tagged digest.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(data).to_hex())
}

/// Hash a file's contents, chunked at 1 MiB.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    hash_reader(file)
}

/// Hash an arbitrary reader, chunked at 1 MiB.
pub fn hash_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).context("Failed to read stream for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Check that a file's digest matches an expected `blake3:` tagged value.
pub fn verify_file(path: &Path, expected: &str) -> Result<bool> {
    Ok(hash_file(path)? == expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bytes_and_file_agree() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, b"counterfactual").unwrap();

        let from_bytes = hash_bytes(b"counterfactual");
        let from_file = hash_file(&path).unwrap();
        assert_eq!(from_bytes, from_file);
        assert!(from_bytes.starts_with("blake3:"));
    }

    #[test]
    fn reader_matches_bytes_across_chunks() {
        // Force more than one chunk through the reader path.
        let data = vec![0xabu8; CHUNK_SIZE + 17];
        let from_reader = hash_reader(&data[..]).unwrap();
        assert_eq!(from_reader, hash_bytes(&data));
    }

    #[test]
    fn verify_detects_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.txt");
        std::fs::write(&path, "one").unwrap();

        let good = hash_file(&path).unwrap();
        assert!(verify_file(&path, &good).unwrap());
        assert!(!verify_file(&path, "blake3:00").unwrap());
    }
}
