//! Content hashing

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

/// Hash and size of a file's contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    /// Lowercase hex SHA-256
    pub hash: String,
    /// Size in bytes
    pub size: u64,
}

/// Stream a file through SHA-256
pub fn hash_file(path: &Path) -> io::Result<FileDigest> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok(FileDigest {
        hash: format!("{:x}", hasher.finalize()),
        size,
    })
}

/// SHA-256 of an in-memory buffer
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.txt");
        std::fs::write(&path, "hello world").unwrap();

        let digest = hash_file(&path).unwrap();
        assert_eq!(digest.size, 11);
        assert_eq!(digest.hash, hash_bytes(b"hello world"));
        assert_eq!(
            digest.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_hash_missing_file() {
        assert!(hash_file(Path::new("/nonexistent/file")).is_err());
    }
}
