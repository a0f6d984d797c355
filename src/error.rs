//! Error types for the cache engine.

use std::{
    fmt,
    io,
    path::{Path, PathBuf},
};

/// The result type used throughout the crate.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors surfaced by the cache engine.
///
/// Local recovery kinds (corrupt records, failed restores, partial saves)
/// are handled in place and never reach this type; what remains here is
/// fatal for the module or the run.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Bad configuration document, unknown hash algorithm, invalid remote URL.
    #[error("invalid cache configuration: {0}")]
    Config(String),
    /// I/O failure while hashing module inputs.
    #[error("failed to fingerprint module inputs: {0}")]
    Fingerprint(String),
    /// Cyclic fingerprint request between modules.
    #[error("cyclic fingerprint request: {}", chain.join(" -> "))]
    Cycle {
        /// The partial module-key chain that closed the cycle.
        chain: Vec<String>,
    },
    /// An archive entry would escape the destination directory.
    #[error("archive entry escapes destination directory: \"{}\"", path.display())]
    Security { path: PathBuf },
    /// A phase does not belong to any known lifecycle.
    #[error("phase \"{0}\" is not part of any lifecycle")]
    Phase(String),
    #[error(transparent)]
    Io(#[from] CacheIoError),
    #[error(transparent)]
    Xml(#[from] quick_xml::DeError),
    #[error("{0}")]
    Message(String),
}

impl CacheError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        CacheIoError::new(err, path).into()
    }

    pub fn config(msg: impl fmt::Display) -> Self {
        CacheError::Config(msg.to_string())
    }

    pub fn fingerprint(msg: impl fmt::Display) -> Self {
        CacheError::Fingerprint(msg.to_string())
    }

    pub fn security(path: impl Into<PathBuf>) -> Self {
        CacheError::Security { path: path.into() }
    }

    pub fn msg(msg: impl fmt::Display) -> Self {
        CacheError::Message(msg.to_string())
    }
}

/// An io error bound to the path it occurred on.
#[derive(Debug, thiserror::Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct CacheIoError {
    io: io::Error,
    path: PathBuf,
}

impl CacheIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path the error occurred on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying io error.
    pub fn source(&self) -> &io::Error {
        &self.io
    }
}

impl From<CacheIoError> for io::Error {
    fn from(err: CacheIoError) -> Self {
        err.io
    }
}
