//! Streaming content hashing and the name → algorithm registry.

use crate::error::{CacheError, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::{
    fs,
    io::{BufReader, Read},
    path::Path,
};
use xxhash_rust::xxh64::Xxh64;

/// Chunk size for streamed file hashing.
const STREAM_BUF: usize = 64 * 1024;

/// A content hash algorithm selectable by name.
///
/// `XX` streams file contents through the hasher; `XXMM` maps the file
/// into memory first, which is faster for large artifact blobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha1,
    Md5,
    Xx,
    XxMm,
}

/// Resolves algorithm names from configuration documents.
pub struct HashFactory;

impl HashFactory {
    /// Returns the algorithm registered under `name`.
    ///
    /// Unknown names fail configuration, there is no fallback algorithm.
    pub fn of(name: &str) -> Result<HashAlgorithm> {
        match name {
            "SHA-256" => Ok(HashAlgorithm::Sha256),
            "SHA-1" => Ok(HashAlgorithm::Sha1),
            "MD5" => Ok(HashAlgorithm::Md5),
            "XX" => Ok(HashAlgorithm::Xx),
            "XXMM" => Ok(HashAlgorithm::XxMm),
            other => Err(CacheError::config(format!("unknown hash algorithm \"{other}\""))),
        }
    }
}

impl HashAlgorithm {
    /// The registry name of the algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "SHA-256",
            Self::Sha1 => "SHA-1",
            Self::Md5 => "MD5",
            Self::Xx => "XX",
            Self::XxMm => "XXMM",
        }
    }

    /// Starts a stateful incremental hasher, used for aggregate checksums.
    pub fn hasher(&self) -> Box<dyn Hasher> {
        match self {
            Self::Sha256 => Box::new(DigestHasher(Sha256::new())),
            Self::Sha1 => Box::new(DigestHasher(Sha1::new())),
            Self::Md5 => Box::new(DigestHasher(Md5::new())),
            Self::Xx | Self::XxMm => Box::new(XxHasher(Xxh64::new(0))),
        }
    }

    /// Hashes a byte slice to a hex string.
    pub fn hash_bytes(&self, bytes: &[u8]) -> String {
        let mut hasher = self.hasher();
        hasher.update(bytes);
        hasher.finalize()
    }

    /// Hashes a file's contents to a hex string.
    pub fn hash_file(&self, path: &Path) -> Result<String> {
        match self {
            Self::XxMm => self.hash_file_mmap(path),
            _ => self.hash_file_streamed(path),
        }
    }

    fn hash_file_streamed(&self, path: &Path) -> Result<String> {
        let file = fs::File::open(path).map_err(|err| CacheError::io(err, path))?;
        let mut reader = BufReader::with_capacity(STREAM_BUF, file);
        let mut hasher = self.hasher();
        let mut buf = [0u8; STREAM_BUF];
        loop {
            let read = reader.read(&mut buf).map_err(|err| CacheError::io(err, path))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(hasher.finalize())
    }

    fn hash_file_mmap(&self, path: &Path) -> Result<String> {
        let file = fs::File::open(path).map_err(|err| CacheError::io(err, path))?;
        let meta = file.metadata().map_err(|err| CacheError::io(err, path))?;
        if meta.len() == 0 {
            return Ok(self.hash_bytes(&[]));
        }
        // SAFETY: the mapping is dropped before this function returns and the
        // cache never hashes files it is concurrently writing.
        let mmap = unsafe { memmap2::Mmap::map(&file).map_err(|err| CacheError::io(err, path))? };
        Ok(self.hash_bytes(&mmap))
    }
}

/// Incremental update/finalize form of a [`HashAlgorithm`].
pub trait Hasher {
    fn update(&mut self, bytes: &[u8]);
    /// Consumes the hasher and returns the lowercase hex digest.
    fn finalize(self: Box<Self>) -> String;
}

struct DigestHasher<D: Digest>(D);

impl<D: Digest> Hasher for DigestHasher<D> {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(self: Box<Self>) -> String {
        hex::encode(self.0.finalize())
    }
}

struct XxHasher(Xxh64);

impl Hasher for XxHasher {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn finalize(self: Box<Self>) -> String {
        format!("{:016x}", self.0.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tempdir;

    #[test]
    fn resolves_known_names() {
        for name in ["SHA-256", "SHA-1", "MD5", "XX", "XXMM"] {
            assert_eq!(HashFactory::of(name).unwrap().name(), name);
        }
    }

    #[test]
    fn rejects_unknown_names() {
        let err = HashFactory::of("CRC-32").unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn sha256_known_vector() {
        let algo = HashFactory::of("SHA-256").unwrap();
        assert_eq!(
            algo.hash_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn incremental_matches_oneshot() {
        for algo in [HashAlgorithm::Sha256, HashAlgorithm::Sha1, HashAlgorithm::Md5, HashAlgorithm::Xx] {
            let mut hasher = algo.hasher();
            hasher.update(b"hello ");
            hasher.update(b"world");
            assert_eq!(hasher.finalize(), algo.hash_bytes(b"hello world"));
        }
    }

    #[test]
    fn mmap_and_streamed_agree() {
        let tmp = tempdir("hash").unwrap();
        let path = tmp.path().join("blob.bin");
        fs::write(&path, vec![0xa5u8; 3 * STREAM_BUF + 17]).unwrap();
        let streamed = HashAlgorithm::Xx.hash_file(&path).unwrap();
        let mapped = HashAlgorithm::XxMm.hash_file(&path).unwrap();
        assert_eq!(streamed, mapped);
    }

    #[test]
    fn mmap_empty_file() {
        let tmp = tempdir("hash").unwrap();
        let path = tmp.path().join("empty.bin");
        fs::write(&path, b"").unwrap();
        assert_eq!(
            HashAlgorithm::XxMm.hash_file(&path).unwrap(),
            HashAlgorithm::Xx.hash_bytes(&[])
        );
    }
}
