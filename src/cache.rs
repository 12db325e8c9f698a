use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::checksum::{Checksum, HashAlgorithm, HashWriter};

/// Content-addressed download cache. Entries live under
/// `<root>/<algorithm>/<hex-digest>`; insertion goes through a temporary
/// file in the root that is renamed into place once the digest has been
/// verified, so concurrent writers of distinct digests never observe
/// partial files.
pub struct FileCache {
    root: PathBuf,
    fsync: bool,
}

#[derive(Debug)]
pub enum CacheError {
    UnsupportedHash(String),
    ChecksumMismatch {
        expected: String,
        actual: String,
    },
    Io(std::io::Error),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CacheError::UnsupportedHash(msg) => write!(f, "unsupported hash: {}", msg),
            CacheError::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch (actual {}, expected {})", actual, expected)
            }
            CacheError::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for CacheError {}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err)
    }
}

impl FileCache {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("could not create cache directory {:?}", root))?;
        let r = Self {
            root: root.to_path_buf(),
            fsync: true,
        };
        Ok(r)
    }

    pub fn set_fsync(&mut self, fsync: bool) {
        self.fsync = fsync;
    }

    fn entry_path(&self, algorithm: HashAlgorithm, digest: &[u8]) -> PathBuf {
        self.root.join(algorithm.as_str()).join(hex::encode(digest))
    }

    /// Returns the path of the cached representation, if present.
    pub fn lookup(&self, csum: &Checksum) -> Option<PathBuf> {
        let path = self.entry_path(csum.algorithm, &csum.value);
        if path.is_file() {
            Some(path)
        } else {
            None
        }
    }

    /// Starts inserting an entry expected to match CSUM. The returned
    /// writer verifies digest and length on `finish`.
    pub fn add(&self, csum: &Checksum) -> Result<CacheWriter<'_>, CacheError> {
        if csum.value.len() != csum.algorithm.digest_len() {
            return Err(CacheError::UnsupportedHash(format!(
                "{} digest has {} bytes",
                csum.algorithm,
                csum.value.len()
            )));
        }
        let file = tempfile::Builder::new()
            .prefix("download.")
            .tempfile_in(&self.root)?;
        let r = CacheWriter {
            cache: self,
            expected: csum.clone(),
            hasher: HashWriter::new(csum.algorithm),
            file,
        };
        Ok(r)
    }

    /// Enumerates all `(algorithm, digest)` pairs in the cache. Temporary
    /// files and entries with unparsable names are skipped.
    pub fn digests(&self) -> Result<Vec<(HashAlgorithm, Vec<u8>)>> {
        let mut result = Vec::new();
        for entry in walkdir::WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let algorithm = match entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .and_then(|n| HashAlgorithm::of_str(n).ok())
            {
                Some(v) => v,
                None => continue,
            };
            let digest = match entry.file_name().to_str().and_then(|n| hex::decode(n).ok()) {
                Some(v) if v.len() == algorithm.digest_len() => v,
                _ => continue,
            };
            result.push((algorithm, digest));
        }
        Ok(result)
    }

    pub fn remove(&self, algorithm: HashAlgorithm, digest: &[u8]) -> Result<()> {
        let path = self.entry_path(algorithm, digest);
        fs::remove_file(&path).with_context(|| format!("could not remove {:?}", path))?;
        Ok(())
    }
}

/// In-flight cache insertion. Write the entry contents, then call
/// `finish` to verify and publish it.
pub struct CacheWriter<'a> {
    cache: &'a FileCache,
    expected: Checksum,
    hasher: HashWriter,
    file: tempfile::NamedTempFile,
}

impl CacheWriter<'_> {
    pub fn finish(self) -> Result<PathBuf, CacheError> {
        let CacheWriter {
            cache,
            expected,
            hasher,
            mut file,
        } = self;
        file.flush()?;
        let octets = hasher.octets();
        let digest = hasher.finish();
        if digest != expected.value {
            return Err(CacheError::ChecksumMismatch {
                expected: expected.hex(),
                actual: hex::encode(digest),
            });
        }
        if let Some(length) = expected.length {
            if octets != length {
                return Err(CacheError::ChecksumMismatch {
                    expected: format!("{} bytes", length),
                    actual: format!("{} bytes", octets),
                });
            }
        }
        if cache.fsync {
            file.as_file().sync_all()?;
        }
        let target = cache.entry_path(expected.algorithm, &expected.value);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        file.persist(&target).map_err(|err| CacheError::Io(err.error))?;
        Ok(target)
    }
}

impl Write for CacheWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write_all(buf)?;
        self.hasher.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::hash_bytes;

    fn checksum_of(data: &[u8]) -> Checksum {
        Checksum {
            algorithm: HashAlgorithm::Sha256,
            value: hash_bytes(HashAlgorithm::Sha256, data),
            length: Some(data.len() as u64),
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let body = b"cache me";
        let csum = checksum_of(body);

        assert!(cache.lookup(&csum).is_none());
        let mut writer = cache.add(&csum).unwrap();
        writer.write_all(body).unwrap();
        let path = writer.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert_eq!(cache.lookup(&csum), Some(path));
        assert_eq!(cache.digests().unwrap(), vec![(HashAlgorithm::Sha256, csum.value)]);
    }

    #[test]
    fn test_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let csum = checksum_of(b"expected body");
        let mut writer = cache.add(&csum).unwrap();
        writer.write_all(b"other body!!!").unwrap();
        match writer.finish() {
            Err(CacheError::ChecksumMismatch { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(cache.lookup(&csum).is_none());
        // The temporary file is cleaned up with the writer.
        assert_eq!(cache.digests().unwrap(), vec![]);
    }

    #[test]
    fn test_length_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let mut csum = checksum_of(b"12345");
        csum.length = Some(4);
        let mut writer = cache.add(&csum).unwrap();
        writer.write_all(b"12345").unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_unsupported_hash() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let csum = Checksum {
            algorithm: HashAlgorithm::Sha256,
            value: vec![0; 20],
            length: None,
        };
        match cache.add(&csum) {
            Err(CacheError::UnsupportedHash(_)) => {}
            _ => panic!("truncated digest must be rejected"),
        }
    }
}
