use crate::layout::StoreLayout;
use crate::{fsync_dir, StoreError};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use strata_schema::BlobDigest;
use tempfile::NamedTempFile;

/// Content-addressable blob store backed by blake3 hashing.
///
/// Blobs are stored as files named by their hex digest. Writes go through a
/// temp file in the staging directory and are renamed into place, so a blob
/// file either holds its full content or does not exist.
#[derive(Debug, Clone)]
pub struct BlobStore {
    layout: StoreLayout,
}

impl BlobStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn path(&self, digest: &str) -> PathBuf {
        self.layout.blobs_dir().join(digest)
    }

    /// Store data and return its digest. Existing blobs are not rewritten.
    pub fn put(&self, data: &[u8]) -> Result<BlobDigest, StoreError> {
        let (digest, _) = self.put_reader(&mut &data[..])?;
        Ok(digest)
    }

    /// Stream a blob into the store, hashing as it is copied.
    /// Returns the digest and the number of bytes written.
    pub fn put_reader(&self, reader: &mut dyn Read) -> Result<(BlobDigest, u64), StoreError> {
        let mut tmp = NamedTempFile::new_in(self.layout.staging_dir())?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut size = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            size += n as u64;
        }

        let digest = hasher.finalize().to_hex().to_string();
        let dest = self.path(&digest);
        if !dest.exists() {
            tmp.as_file().sync_all()?;
            tmp.persist(&dest).map_err(|e| StoreError::Io(e.error))?;
            fsync_dir(&self.layout.blobs_dir())?;
        }
        Ok((BlobDigest::new(digest), size))
    }

    /// Retrieve a blob, verifying its digest on read.
    pub fn get(&self, digest: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path(digest);
        if !path.exists() {
            return Err(StoreError::BlobNotFound(digest.to_owned()));
        }
        let data = fs::read(&path)?;

        let actual = blake3::hash(&data).to_hex();
        if actual.as_str() != digest {
            return Err(StoreError::IntegrityFailure {
                name: digest.to_owned(),
                expected: digest.to_owned(),
                actual: actual.to_string(),
            });
        }
        Ok(data)
    }

    /// Open a blob for streaming reads. No digest verification.
    pub fn open(&self, digest: &str) -> Result<File, StoreError> {
        let path = self.path(digest);
        if !path.exists() {
            return Err(StoreError::BlobNotFound(digest.to_owned()));
        }
        Ok(File::open(path)?)
    }

    pub fn exists(&self, digest: &str) -> bool {
        self.path(digest).exists()
    }

    pub fn remove(&self, digest: &str) -> Result<(), StoreError> {
        let path = self.path(digest);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.blobs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut digests = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    digests.push(name.to_owned());
                }
            }
        }
        digests.sort();
        Ok(digests)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, BlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, BlobStore::new(layout))
    }

    #[test]
    fn put_and_get_roundtrip() {
        let (_dir, store) = test_store();
        let digest = store.put(b"hello strata").unwrap();
        assert_eq!(store.get(&digest).unwrap(), b"hello strata");
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = test_store();
        let d1 = store.put(b"same").unwrap();
        let d2 = store.put(b"same").unwrap();
        assert_eq!(d1, d2);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn put_reader_reports_size() {
        let (_dir, store) = test_store();
        let data = vec![0xABu8; 200 * 1024];
        let (digest, size) = store.put_reader(&mut data.as_slice()).unwrap();
        assert_eq!(size, data.len() as u64);
        assert_eq!(digest.as_str(), blake3::hash(&data).to_hex().as_str());
    }

    #[test]
    fn put_leaves_staging_empty() {
        let (dir, store) = test_store();
        store.put(b"a").unwrap();
        store.put(b"a").unwrap();
        let staging = StoreLayout::new(dir.path()).staging_dir();
        assert_eq!(fs::read_dir(staging).unwrap().count(), 0);
    }

    #[test]
    fn integrity_check_on_read() {
        let (_dir, store) = test_store();
        let digest = store.put(b"test data").unwrap();
        fs::write(store.path(&digest), b"corrupted").unwrap();
        assert!(matches!(
            store.get(&digest),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn missing_blob_is_not_found() {
        let (_dir, store) = test_store();
        assert!(!store.exists("nope"));
        assert!(matches!(store.get("nope"), Err(StoreError::BlobNotFound(_))));
        assert!(store.open("nope").is_err());
        assert!(store.remove("nope").is_ok());
    }

    #[test]
    fn remove_blob() {
        let (_dir, store) = test_store();
        let digest = store.put(b"data").unwrap();
        assert!(store.exists(&digest));
        store.remove(&digest).unwrap();
        assert!(!store.exists(&digest));
    }
}
