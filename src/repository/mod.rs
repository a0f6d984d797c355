//! The two-tier build record repository.
//!
//! The local tier is a content-addressed directory layout under the cache
//! root; the remote tier is an HTTP endpoint consulted through a
//! pluggable transport. Lookup prefers local records, lets remote records
//! override non-final local ones, and throttles repeated negative remote
//! lookups through an on-disk marker.

pub mod local;
pub mod remote;

pub use local::LocalRepository;
pub use remote::{RemoteRepository, RemoteTransport};
