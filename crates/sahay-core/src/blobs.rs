//! Content-addressed blob store.
//!
//! Encrypted complaint evidence and therapy-pack files live outside the
//! relational store, keyed by the SHA-256 of their content. Reads verify
//! the digest, so a corrupted or swapped file can never be served under a
//! valid key. The layout shards by the first two hex characters to keep
//! directories small.

use std::fs;
use std::path::{Path, PathBuf};

use subtle::ConstantTimeEq;

use crate::canonical::sha256;
use crate::error::Error;

/// Filesystem-backed content-addressed storage.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Opens (and creates) the store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns `Transient` if the root cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, Error> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| Error::Transient(e.to_string()))?;
        Ok(Self { root })
    }

    fn path_for(&self, digest_hex: &str) -> PathBuf {
        self.root.join(&digest_hex[..2]).join(digest_hex)
    }

    /// Stores content and returns its hex digest. Idempotent: identical
    /// content lands on the same key.
    ///
    /// # Errors
    ///
    /// Returns `Transient` on I/O failure.
    pub fn put(&self, content: &[u8]) -> Result<String, Error> {
        let digest = sha256(content).to_hex();
        let path = self.path_for(&digest);
        if path.exists() {
            return Ok(digest);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Transient(e.to_string()))?;
        }
        // Write then rename so a crashed write never leaves a partial blob
        // under a valid key.
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).map_err(|e| Error::Transient(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| Error::Transient(e.to_string()))?;
        Ok(digest)
    }

    /// Loads content by digest, verifying it before returning.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown digests, `Validation` for malformed keys or
    /// content that no longer matches its digest.
    pub fn get(&self, digest_hex: &str) -> Result<Vec<u8>, Error> {
        if digest_hex.len() != 64 || !digest_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Validation("malformed content digest".into()));
        }
        let path = self.path_for(digest_hex);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound("blob"))
            },
            Err(e) => return Err(Error::Transient(e.to_string())),
        };

        let actual = sha256(&content).to_hex();
        if !bool::from(actual.as_bytes().ct_eq(digest_hex.to_lowercase().as_bytes())) {
            return Err(Error::Validation("blob content does not match digest".into()));
        }
        Ok(content)
    }

    /// Whether a digest is present.
    #[must_use]
    pub fn contains(&self, digest_hex: &str) -> bool {
        digest_hex.len() == 64 && self.path_for(digest_hex).exists()
    }
}
