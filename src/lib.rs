//! A consistent-hashing, blocking client for a memcached-compatible cache
//! cluster: per-server connection state machines, pipelined multi-get,
//! CAS, key namespacing, and pluggable value (de)serialization and
//! compression. If compression is undesired, disable the `zlib` feature
//! (on by default).

pub mod client;
pub mod connection;
pub mod error;
pub mod key;
#[cfg(unix)]
pub mod multiget;
pub mod pool;
pub(crate) mod protocol;
pub mod ring;
pub mod server;
pub mod value;

#[cfg(feature = "zlib")]
pub mod zlib;

pub use client::{CasOutcome, Client, ClientConfig, TlsConfig};
pub use connection::{ConnState, ConnectionOptions};
pub use error::Error;
pub use key::{KeyDigest, Md5Hasher, NamespaceSource};
pub use pool::{ClientManager, Pool};
pub use server::{Endpoint, ServerDescriptor, ServerList};
pub use value::{Raw, ValueCompressor, ValueSerializer};

#[cfg(unix)]
pub use multiget::MultiGetEntry;
