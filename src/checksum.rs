use std::fmt;
use std::io::{Read, Write};

use anyhow::{bail, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// SHA-256 of the empty byte string, used for ghost files whose contents
/// never made it into the payload.
pub const EMPTY_SHA256: &str =
    "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn of_str(s: &str) -> Result<Self> {
        let r = match s {
            "md5" => HashAlgorithm::Md5,
            // Old repodata calls SHA-1 just "sha".
            "sha" | "sha1" => HashAlgorithm::Sha1,
            "sha256" => HashAlgorithm::Sha256,
            _ => bail!("unknown hash type {:?}", s),
        };
        Ok(r)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A digest value together with the algorithm that produced it and, when
/// known, the length of the hashed data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    pub value: Vec<u8>,
    pub length: Option<u64>,
}

impl Checksum {
    pub fn from_hex(algorithm: &str, length: Option<u64>, digest: &str) -> Result<Self> {
        let algorithm = HashAlgorithm::of_str(algorithm)?;
        let value = hex::decode(digest.trim())
            .map_err(|err| anyhow::anyhow!("malformed {} digest: {}", algorithm, err))?;
        let r = Self {
            algorithm,
            value,
            length,
        };
        Ok(r)
    }

    pub fn empty_sha256() -> Self {
        Self {
            algorithm: HashAlgorithm::Sha256,
            value: hex::decode(EMPTY_SHA256).unwrap(),
            length: Some(0),
        }
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.value)
    }
}

impl serde::Serialize for Checksum {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{}:{}", self.algorithm, self.hex()))
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

/// Incremental digest with a running octet counter. Implements
/// `std::io::Write` so it can sit behind `io::copy`.
pub struct HashWriter {
    hasher: Hasher,
    octets: u64,
}

impl HashWriter {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let hasher = match algorithm {
            HashAlgorithm::Md5 => Hasher::Md5(Md5::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
        };
        Self { hasher, octets: 0 }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
        self.octets += data.len() as u64;
    }

    pub fn octets(&self) -> u64 {
        self.octets
    }

    pub fn finish(self) -> Vec<u8> {
        match self.hasher {
            Hasher::Md5(h) => h.finalize().to_vec(),
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

impl Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> Vec<u8> {
    let mut hasher = HashWriter::new(algorithm);
    hasher.update(data);
    hasher.finish()
}

/// Hashes a file with SHA-256 and SHA-1 in one read pass.
pub fn hash_file_pair(path: &std::path::Path) -> Result<(Checksum, Checksum)> {
    let mut file = std::fs::File::open(path)?;
    let mut sha256 = HashWriter::new(HashAlgorithm::Sha256);
    let mut sha1 = HashWriter::new(HashAlgorithm::Sha1);
    let mut buffer = [0; 8192];

    loop {
        let count = file.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        sha256.update(&buffer[..count]);
        sha1.update(&buffer[..count]);
    }

    let length = Some(sha256.octets());
    let r = (
        Checksum {
            algorithm: HashAlgorithm::Sha256,
            value: sha256.finish(),
            length,
        },
        Checksum {
            algorithm: HashAlgorithm::Sha1,
            value: sha1.finish(),
            length,
        },
    );
    Ok(r)
}

#[test]
fn test_empty_sha256() {
    assert_eq!(hash_bytes(HashAlgorithm::Sha256, b""), Checksum::empty_sha256().value);
    assert_eq!(Checksum::empty_sha256().length, Some(0));
}

#[test]
fn test_hash_writer_octets() {
    let mut w = HashWriter::new(HashAlgorithm::Sha1);
    w.update(b"abc");
    w.update(b"def");
    assert_eq!(w.octets(), 6);
    assert_eq!(hex::encode(w.finish()), "1f8ac10f23c5b5bc1167bda84b833e5c057a77d2");
}

#[test]
fn test_of_str_aliases() {
    assert_eq!(HashAlgorithm::of_str("sha").unwrap(), HashAlgorithm::Sha1);
    assert_eq!(HashAlgorithm::of_str("sha256").unwrap(), HashAlgorithm::Sha256);
    assert!(HashAlgorithm::of_str("sha512").is_err());
}
