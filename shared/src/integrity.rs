//! Post-transfer integrity checking: size and streamed SHA-256 against a
//! declared manifest. Verification never deletes anything; what to do with a
//! bad artifact is the caller's decision.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Read block size for digesting large files.
const HASH_BLOCK: usize = 1024 * 1024;

/// Declared metadata a received file must match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileManifest {
    pub size: u64,
    pub sha256: String,
}

impl FileManifest {
    /// Build a manifest for an existing file (the sender side).
    pub fn for_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            size: path.metadata()?.len(),
            sha256: hash_file(path)?,
        })
    }
}

/// Streamed lowercase-hex SHA-256 of a file.
pub fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; HASH_BLOCK];
    loop {
        let n = file.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hex(&hasher.finalize()))
}

/// Verify `path` against the manifest. Size is checked first; a digest over a
/// wrong-sized file is meaningless, so the checksum is skipped on a size
/// mismatch. Hex comparison is case-insensitive.
pub fn verify_file(path: impl AsRef<Path>, manifest: &FileManifest) -> Result<()> {
    let path = path.as_ref();
    let actual_size = path.metadata()?.len();
    if actual_size != manifest.size {
        return Err(Error::SizeMismatch {
            expected: manifest.size,
            actual: actual_size,
        });
    }
    let actual_digest = hash_file(path)?;
    if !actual_digest.eq_ignore_ascii_case(&manifest.sha256) {
        return Err(Error::ChecksumMismatch {
            expected: manifest.sha256.clone(),
            actual: actual_digest,
        });
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.txt");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_verify_accepts_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        fs::write(&path, vec![9u8; 5000]).unwrap();
        let manifest = FileManifest::for_file(&path).unwrap();
        verify_file(&path, &manifest).unwrap();
    }

    #[test]
    fn test_verify_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        fs::write(&path, b"case test").unwrap();
        let mut manifest = FileManifest::for_file(&path).unwrap();
        manifest.sha256 = manifest.sha256.to_uppercase();
        verify_file(&path, &manifest).unwrap();
    }

    #[test]
    fn test_truncation_reports_both_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        fs::write(&path, vec![3u8; 1000]).unwrap();
        let manifest = FileManifest::for_file(&path).unwrap();
        // Truncate by one byte after the manifest was taken.
        fs::write(&path, vec![3u8; 999]).unwrap();
        match verify_file(&path, &manifest) {
            Err(Error::SizeMismatch { expected, actual }) => {
                assert_eq!(expected, 1000);
                assert_eq!(actual, 999);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // The bad artifact is still there: cleanup is the caller's call.
        assert!(path.exists());
    }

    #[test]
    fn test_corruption_with_correct_size_is_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let mut content = vec![7u8; 1000];
        fs::write(&path, &content).unwrap();
        let manifest = FileManifest::for_file(&path).unwrap();
        content[500] ^= 0x01;
        fs::write(&path, &content).unwrap();
        assert!(matches!(
            verify_file(&path, &manifest),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = FileManifest {
            size: 1,
            sha256: "00".to_owned(),
        };
        assert!(matches!(
            verify_file(dir.path().join("absent"), &manifest),
            Err(Error::Io(_))
        ));
    }
}
