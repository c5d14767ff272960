//! The public facade: a handful of get/set-style operations plus CAS,
//! counters, multi-get, and the whole-cluster fan-outs (`stats`, `version`,
//! `flush`), all funneled through one request chokepoint per §4.6/§4.8.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::RwLock;
use std::time::Duration;

use log::warn;
use serde::{de::DeserializeOwned, Serialize};

use crate::connection::ConnectionOptions;
use crate::error::Error;
use crate::key::{KeyDigest, KeyNormalizer, Md5Hasher, NamespaceSource};
use crate::protocol::{FlushExtras, IncrDecrExtras, Opaque, Packet, SetExtras, Status, TouchExtras};
use crate::ring::Ring;
use crate::server::ServerList;
use crate::value::{BincodeSerializer, NoCompressor, ValueCodec, ValueCompressor, ValueSerializer};

#[cfg(unix)]
use crate::multiget::MultiGetCoordinator;

/// A placeholder for a future TLS configuration. The handshake itself is
/// out of scope for this crate; this only exists so a caller's config
/// struct has somewhere to put one down.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig;

/// Every knob from the option table this crate's configuration exposes.
/// Defaults match the table exactly.
#[derive(Clone)]
pub struct ClientConfig<S: ValueSerializer = BincodeSerializer, C: ValueCompressor = NoCompressor, D: KeyDigest = Md5Hasher> {
    pub servers: ServerList,
    pub namespace: NamespaceSource,
    pub failover: bool,
    /// Stored for parity with the option table but not branched on: every
    /// [`Ring`] connection is `Mutex`-guarded regardless, since sharing a
    /// `Connection` across threads without exclusion isn't expressible
    /// safely in Rust. See `DESIGN.md`.
    pub threadsafe: bool,
    pub expires_in: u32,
    pub compress: bool,
    pub compression_min_size: usize,
    pub serializer: S,
    pub compressor: C,
    pub cache_nils: bool,
    pub digest: D,
    pub socket_timeout: Duration,
    pub socket_max_failures: u32,
    pub socket_failure_delay: Duration,
    pub down_retry_delay: Duration,
    pub value_max_bytes: usize,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_context: Option<TlsConfig>,
    pub keepalive: bool,
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,
    /// Stored for parity with the option table. Swallowing a network error
    /// into a sentinel return value instead of propagating `Err` is a
    /// session-adapter concern this crate's facade does not implement; every
    /// operation here always returns a `Result`, matching `raise_errors =
    /// true`.
    pub raise_errors: bool,
}

impl ClientConfig<BincodeSerializer, NoCompressor, Md5Hasher> {
    /// A config with every default from the option table except the
    /// compressor, which is `NoCompressor` here. Use
    /// [`ClientConfig::with_zlib`] (behind the `zlib` feature) to match the
    /// table's actual default.
    pub fn new(servers: impl Into<ServerList>) -> Self {
        Self {
            servers: servers.into(),
            namespace: NamespaceSource::None,
            failover: true,
            threadsafe: true,
            expires_in: 0,
            compress: true,
            compression_min_size: 4096,
            serializer: BincodeSerializer,
            compressor: NoCompressor,
            cache_nils: false,
            digest: Md5Hasher,
            socket_timeout: Duration::from_secs(1),
            socket_max_failures: 2,
            socket_failure_delay: Duration::from_millis(100),
            down_retry_delay: Duration::from_secs(30),
            value_max_bytes: 1024 * 1024,
            username: None,
            password: None,
            ssl_context: None,
            keepalive: true,
            sndbuf: None,
            rcvbuf: None,
            raise_errors: true,
        }
    }
}

#[cfg(feature = "zlib")]
impl ClientConfig<BincodeSerializer, crate::zlib::ZlibCompressor, Md5Hasher> {
    /// The table's actual default configuration: zlib compression enabled.
    pub fn with_zlib(servers: impl Into<ServerList>) -> Self {
        let base = ClientConfig::new(servers);
        ClientConfig {
            servers: base.servers,
            namespace: base.namespace,
            failover: base.failover,
            threadsafe: base.threadsafe,
            expires_in: base.expires_in,
            compress: base.compress,
            compression_min_size: base.compression_min_size,
            serializer: base.serializer,
            compressor: crate::zlib::ZlibCompressor::default(),
            cache_nils: base.cache_nils,
            digest: base.digest,
            socket_timeout: base.socket_timeout,
            socket_max_failures: base.socket_max_failures,
            socket_failure_delay: base.socket_failure_delay,
            down_retry_delay: base.down_retry_delay,
            value_max_bytes: base.value_max_bytes,
            username: base.username,
            password: base.password,
            ssl_context: base.ssl_context,
            keepalive: base.keepalive,
            sndbuf: base.sndbuf,
            rcvbuf: base.rcvbuf,
            raise_errors: base.raise_errors,
        }
    }
}

impl<S: ValueSerializer, C: ValueCompressor, D: KeyDigest> ClientConfig<S, C, D> {
    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            socket_timeout: self.socket_timeout,
            socket_max_failures: self.socket_max_failures,
            socket_failure_delay: self.socket_failure_delay,
            down_retry_delay: self.down_retry_delay,
            keepalive: self.keepalive,
            sndbuf: self.sndbuf,
            rcvbuf: self.rcvbuf,
        }
    }
}

/// The outcome of a [`Client::cas`] call.
#[derive(Debug)]
pub enum CasOutcome<V> {
    /// The value was present, the producer ran, and the write landed with
    /// the CAS token unchanged from the read.
    Updated(V),
    /// Another writer stored a new value between the read and the write;
    /// the producer's result was discarded.
    Conflict,
    /// The key was not present; the producer never ran.
    Missing,
}

/// A lazily-built [`Ring`] that can be torn down and rebuilt from scratch
/// by [`Client::reset`], per the source's "ring is created lazily on first
/// operation" lifecycle note.
struct RingHandle<'a>(std::sync::RwLockReadGuard<'a, Option<Ring>>);

impl<'a> Deref for RingHandle<'a> {
    type Target = Ring;
    fn deref(&self) -> &Ring {
        self.0.as_ref().expect("ring initialized by Client::ring")
    }
}

/// A connection to a memcached-compatible cluster: consistent hashing,
/// per-server connection state machines, key namespacing, and value
/// (de)serialization, all behind a blocking, thread-per-caller API.
pub struct Client<S: ValueSerializer = BincodeSerializer, C: ValueCompressor = NoCompressor, D: KeyDigest = Md5Hasher> {
    descriptors: Vec<crate::server::ServerDescriptor>,
    connection_options: ConnectionOptions,
    failover: bool,
    ring: RwLock<Option<Ring>>,
    normalizer: KeyNormalizer<D>,
    codec: ValueCodec<S, C>,
    expires_in: u32,
    #[allow(dead_code)] // stored for parity; see the `cache_nils` doc on `ClientConfig`.
    cache_nils: bool,
    socket_timeout: Duration,
}

impl<S: ValueSerializer, C: ValueCompressor, D: KeyDigest> Client<S, C, D> {
    pub fn new(config: ClientConfig<S, C, D>) -> Result<Self, Error> {
        let connection_options = config.connection_options();
        let mut descriptors = config.servers.resolve()?;
        for descriptor in &mut descriptors {
            if descriptor.username.is_none() {
                descriptor.username = config.username.clone();
                descriptor.password = config.password.clone();
            }
        }

        let normalizer = KeyNormalizer::new(config.namespace, config.digest);
        let codec = ValueCodec::new(
            config.serializer,
            config.compressor,
            config.compress,
            config.compression_min_size,
            config.value_max_bytes,
        );

        Ok(Self {
            descriptors,
            connection_options,
            failover: config.failover,
            ring: RwLock::new(None),
            normalizer,
            codec,
            expires_in: config.expires_in,
            cache_nils: config.cache_nils,
            socket_timeout: config.socket_timeout,
        })
    }

    fn ring(&self) -> Result<RingHandle<'_>, Error> {
        {
            let guard = self.ring.read().expect("ring lock poisoned");
            if guard.is_some() {
                return Ok(RingHandle(guard));
            }
        }
        {
            let mut guard = self.ring.write().expect("ring lock poisoned");
            if guard.is_none() {
                let ring = Ring::new(self.descriptors.clone(), self.connection_options, self.failover)?;
                *guard = Some(ring);
            }
        }
        let guard = self.ring.read().expect("ring lock poisoned");
        Ok(RingHandle(guard))
    }

    /// Normalize `raw_key`, resolve it to a server, and run one request
    /// against that server's connection, retrying exactly once against a
    /// freshly-resolved server if the first attempt fails with a network
    /// error, per §4.6.
    fn perform(&self, raw_key: &[u8], build: impl Fn(&[u8], Opaque) -> Packet) -> Result<Packet, Error> {
        let key = self.normalizer.normalize(raw_key)?;
        let ring = self.ring()?;

        let first = {
            let index = ring.server_for_key(&key)?;
            let mut conn = ring.connection(index);
            conn.request(|opaque| build(&key, opaque))
        };

        match first {
            Err(err) if err.is_network() => {
                let index = ring.server_for_key(&key)?;
                let mut conn = ring.connection(index);
                conn.request(|opaque| build(&key, opaque))
            }
            other => other,
        }
    }

    fn get_with_cas<V: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<(V, u64)>, Error> {
        let response = self.perform(key, |k, opaque| Packet::get(k, opaque))?;
        match response.error_for_status() {
            Ok(()) => {
                let value = self.codec.decode(&response.value, response.response_flags())?;
                Ok(Some((value, response.header.cas)))
            }
            Err(Status::KeyNotFound) => Ok(None),
            Err(status) => Err(status.into()),
        }
    }

    /// Fetch and deserialize a value.
    pub fn get<V: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<V>, Error> {
        Ok(self.get_with_cas::<V>(key)?.map(|(value, _cas)| value))
    }

    /// Fetch a value's raw wire bytes, undoing compression but not
    /// deserializing.
    pub fn get_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let response = self.perform(key, |k, opaque| Packet::get(k, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(Some(self.codec.decode_raw(&response.value, response.response_flags())?)),
            Err(Status::KeyNotFound) => Ok(None),
            Err(status) => Err(status.into()),
        }
    }

    /// Store a value unconditionally.
    pub fn set<V: Serialize>(&self, key: &[u8], value: &V, ttl: Option<u32>) -> Result<(), Error> {
        let (bytes, flags) = self.codec.encode_value(value)?;
        let extras = SetExtras::new(flags, ttl.unwrap_or(self.expires_in));
        let response = self.perform(key, move |k, opaque| Packet::set(k, bytes.clone(), extras, 0, opaque))?;
        response.error_for_status()?;
        Ok(())
    }

    /// Store a value's raw bytes unconditionally, bypassing the serializer
    /// and compressor; see [`crate::value::Raw`].
    pub fn set_raw(&self, key: &[u8], bytes: &[u8], ttl: Option<u32>) -> Result<(), Error> {
        let (bytes, flags) = self.codec.encode_raw(bytes)?;
        let extras = SetExtras::new(flags, ttl.unwrap_or(self.expires_in));
        let response = self.perform(key, move |k, opaque| Packet::set(k, bytes.clone(), extras, 0, opaque))?;
        response.error_for_status()?;
        Ok(())
    }

    /// Store a value only if the key is not already present. Returns
    /// `false` if it was.
    pub fn add<V: Serialize>(&self, key: &[u8], value: &V, ttl: Option<u32>) -> Result<bool, Error> {
        let (bytes, flags) = self.codec.encode_value(value)?;
        let extras = SetExtras::new(flags, ttl.unwrap_or(self.expires_in));
        let response = self.perform(key, move |k, opaque| Packet::add(k, bytes.clone(), extras, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(true),
            Err(Status::KeyExists) => Ok(false),
            Err(status) => Err(status.into()),
        }
    }

    /// Store a value only if the key is already present. Returns `false`
    /// if it was not.
    pub fn replace<V: Serialize>(&self, key: &[u8], value: &V, ttl: Option<u32>) -> Result<bool, Error> {
        let (bytes, flags) = self.codec.encode_value(value)?;
        let extras = SetExtras::new(flags, ttl.unwrap_or(self.expires_in));
        let response =
            self.perform(key, move |k, opaque| Packet::replace(k, bytes.clone(), extras, 0, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(true),
            Err(Status::ItemNotStored) => Ok(false),
            Err(status) => Err(status.into()),
        }
    }

    /// Delete a key. Returns `false` if it was not present; not an error.
    pub fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        let response = self.perform(key, |k, opaque| Packet::delete(k, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(true),
            Err(Status::KeyNotFound) => Ok(false),
            Err(status) => Err(status.into()),
        }
    }

    /// Append raw bytes to an existing value. Operates on raw bytes only,
    /// per the binary protocol's own append/prepend semantics.
    pub fn append(&self, key: &[u8], bytes: &[u8]) -> Result<bool, Error> {
        let owned = bytes.to_vec();
        let response = self.perform(key, move |k, opaque| Packet::append(k, owned.clone(), 0, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(true),
            Err(Status::ItemNotStored) => Ok(false),
            Err(status) => Err(status.into()),
        }
    }

    /// Prepend raw bytes to an existing value.
    pub fn prepend(&self, key: &[u8], bytes: &[u8]) -> Result<bool, Error> {
        let owned = bytes.to_vec();
        let response = self.perform(key, move |k, opaque| Packet::prepend(k, owned.clone(), 0, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(true),
            Err(Status::ItemNotStored) => Ok(false),
            Err(status) => Err(status.into()),
        }
    }

    fn counter(&self, key: &[u8], delta: u64, initial: Option<u64>, ttl: u32, increment: bool) -> Result<Option<u64>, Error> {
        let expire = match initial {
            Some(_) => ttl,
            None => IncrDecrExtras::FAIL_IF_ABSENT,
        };
        let extras = IncrDecrExtras::new(delta, initial.unwrap_or(0), expire);
        let response = self.perform(key, move |k, opaque| {
            if increment {
                Packet::incr(k, extras, opaque)
            } else {
                Packet::decr(k, extras, opaque)
            }
        })?;
        match response.error_for_status() {
            Ok(()) => Ok(Some(response.counter_value()?)),
            Err(Status::KeyNotFound) => Ok(None),
            Err(status) => Err(status.into()),
        }
    }

    /// Increment a 64-bit counter by `delta`. `None` for `initial` means
    /// fail instead of seeding the counter if the key is absent.
    pub fn incr(&self, key: &[u8], delta: u64, initial: Option<u64>, ttl: u32) -> Result<Option<u64>, Error> {
        self.counter(key, delta, initial, ttl, true)
    }

    /// Decrement a 64-bit counter by `delta`. The server clamps the result
    /// at zero rather than underflowing.
    pub fn decr(&self, key: &[u8], delta: u64, initial: Option<u64>, ttl: u32) -> Result<Option<u64>, Error> {
        self.counter(key, delta, initial, ttl, false)
    }

    /// Reset a key's expiry without touching its value.
    pub fn touch(&self, key: &[u8], ttl: u32) -> Result<bool, Error> {
        let extras = TouchExtras::new(ttl);
        let response = self.perform(key, move |k, opaque| Packet::touch(k, extras, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(true),
            Err(Status::KeyNotFound) => Ok(false),
            Err(status) => Err(status.into()),
        }
    }

    /// Fetch a value and reset its expiry in one round trip.
    pub fn gat<V: DeserializeOwned>(&self, key: &[u8], ttl: u32) -> Result<Option<V>, Error> {
        let extras = TouchExtras::new(ttl);
        let response = self.perform(key, move |k, opaque| Packet::gat(k, extras, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(Some(self.codec.decode(&response.value, response.response_flags())?)),
            Err(Status::KeyNotFound) => Ok(None),
            Err(status) => Err(status.into()),
        }
    }

    /// Read-modify-write: read the current value and CAS token, call
    /// `producer` with the current value, and write the result back only
    /// if the token is unchanged.
    pub fn cas<V, F>(&self, key: &[u8], ttl: u32, producer: F) -> Result<CasOutcome<V>, Error>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce(V) -> V,
    {
        let (value, token) = match self.get_with_cas::<V>(key)? {
            Some(pair) => pair,
            None => return Ok(CasOutcome::Missing),
        };
        let updated = producer(value);
        let (bytes, flags) = self.codec.encode_value(&updated)?;
        let extras = SetExtras::new(flags, ttl);
        let response = self.perform(key, move |k, opaque| Packet::set(k, bytes.clone(), extras, token, opaque))?;
        match response.error_for_status() {
            Ok(()) => Ok(CasOutcome::Updated(updated)),
            Err(Status::KeyExists) => Ok(CasOutcome::Conflict),
            Err(status) => Err(status.into()),
        }
    }

    /// Like [`cas`](Client::cas), but `producer` also runs when the key is
    /// absent (with `None`), and the follow-up write is unconditional
    /// (CAS token zero) rather than contingent on a prior read.
    pub fn cas_insert<V, F>(&self, key: &[u8], ttl: u32, producer: F) -> Result<V, Error>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce(Option<V>) -> V,
    {
        let current = self.get_with_cas::<V>(key)?;
        let (value_opt, token) = match current {
            Some((value, token)) => (Some(value), token),
            None => (None, 0),
        };
        let updated = producer(value_opt);
        let (bytes, flags) = self.codec.encode_value(&updated)?;
        let extras = SetExtras::new(flags, ttl);
        let response = self.perform(key, move |k, opaque| Packet::set(k, bytes.clone(), extras, token, opaque))?;
        response.error_for_status()?;
        Ok(updated)
    }

    /// Read a value, or produce and store one with `ttl` if it was absent.
    pub fn fetch<V, F>(&self, key: &[u8], ttl: u32, producer: F) -> Result<V, Error>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> V,
    {
        match self.get::<V>(key) {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(Error::Unmarshal(_)) => {}
            Err(err) => return Err(err),
        }
        let produced = producer();
        self.add(key, &produced, Some(ttl))?;
        Ok(produced)
    }

    #[cfg(unix)]
    fn multi_get_entries(&self, keys: &[&[u8]]) -> Result<Vec<crate::multiget::MultiGetEntry>, Error> {
        let mut normalized = Vec::with_capacity(keys.len());
        for key in keys {
            match self.normalizer.normalize(key) {
                Ok(wire_key) => normalized.push(wire_key),
                Err(err) => warn!("dropping key from multi-get: {}", err),
            }
        }
        let ring = self.ring()?;
        MultiGetCoordinator::new(&ring).fetch(&normalized, self.socket_timeout)
    }

    /// Fetch several keys in one pipelined round per server. Keys that fail
    /// to normalize or whose values fail to deserialize are silently
    /// dropped from the result rather than failing the whole call, per
    /// §4.7/§7.
    #[cfg(unix)]
    pub fn get_multi<V: DeserializeOwned>(&self, keys: &[&[u8]]) -> Result<HashMap<Vec<u8>, V>, Error> {
        let mut out = HashMap::new();
        for entry in self.multi_get_entries(keys)? {
            match self.codec.decode::<V>(&entry.value, entry.flags) {
                Ok(value) => {
                    out.insert(self.normalizer.denormalize(&entry.key), value);
                }
                Err(err) => warn!("dropping multi-get entry after decode failure: {}", err),
            }
        }
        Ok(out)
    }

    /// Like [`get_multi`](Client::get_multi), additionally returning each
    /// entry's CAS token for a follow-up [`cas`](Client::cas) call.
    #[cfg(unix)]
    pub fn get_multi_cas<V: DeserializeOwned>(&self, keys: &[&[u8]]) -> Result<HashMap<Vec<u8>, (V, u64)>, Error> {
        let mut out = HashMap::new();
        for entry in self.multi_get_entries(keys)? {
            match self.codec.decode::<V>(&entry.value, entry.flags) {
                Ok(value) => {
                    out.insert(self.normalizer.denormalize(&entry.key), (value, entry.cas));
                }
                Err(err) => warn!("dropping multi-get entry after decode failure: {}", err),
            }
        }
        Ok(out)
    }

    /// `STAT [type]` against every server, keyed by server name. A server
    /// that can't be reached contributes its own `Err` rather than failing
    /// the whole fan-out.
    pub fn stats(&self, stat_type: Option<&str>) -> Result<HashMap<String, Result<HashMap<String, String>, Error>>, Error> {
        let ring = self.ring()?;
        let mut out = HashMap::new();
        for index in 0..ring.len() {
            let name = ring.descriptor(index).name();
            out.insert(name, self.stats_for_server(&ring, index, stat_type));
        }
        Ok(out)
    }

    fn stats_for_server(&self, ring: &Ring, index: usize, stat_type: Option<&str>) -> Result<HashMap<String, String>, Error> {
        let key = stat_type.map(|s| s.as_bytes().to_vec());
        let mut conn = ring.connection(index);
        let packets = conn.request_multi(move |opaque| Packet::stat(key.as_deref(), opaque))?;
        let mut stats = HashMap::new();
        for packet in packets {
            if packet.key.is_empty() {
                continue;
            }
            packet.error_for_status()?;
            stats.insert(
                String::from_utf8_lossy(&packet.key).into_owned(),
                String::from_utf8_lossy(&packet.value).into_owned(),
            );
        }
        Ok(stats)
    }

    /// `VERSION` against every server, keyed by server name.
    pub fn version(&self) -> Result<HashMap<String, Result<String, Error>>, Error> {
        let ring = self.ring()?;
        let mut out = HashMap::new();
        for index in 0..ring.len() {
            let name = ring.descriptor(index).name();
            let mut conn = ring.connection(index);
            let result = conn.request(|opaque| Packet::version(opaque)).and_then(|response| {
                response.error_for_status()?;
                Ok(String::from_utf8_lossy(&response.value).into_owned())
            });
            out.insert(name, result);
        }
        Ok(out)
    }

    /// `FLUSH` every server, staggering each by an additional `delay`
    /// seconds so a cluster-wide flush doesn't land in the same instant
    /// everywhere (server 0 at 0s, server 1 at `delay`s, server 2 at
    /// `2*delay`s, ...).
    pub fn flush(&self, delay: u32) -> Result<(), Error> {
        let ring = self.ring()?;
        for index in 0..ring.len() {
            let staggered = delay.saturating_mul(index as u32);
            let mut conn = ring.connection(index);
            let response = conn.request(move |opaque| Packet::flush_with_delay(FlushExtras { delay: staggered }, opaque))?;
            response.error_for_status()?;
        }
        Ok(())
    }

    /// Send a `NOOP` to every connected server; used by the connection
    /// pool to validate a checked-out client.
    pub(crate) fn keep_alive(&self) -> Result<(), Error> {
        let ring = self.ring()?;
        for index in 0..ring.len() {
            let mut conn = ring.connection(index);
            if conn.is_alive() {
                let response = conn.request(|opaque| Packet::noop(opaque))?;
                response.error_for_status()?;
            }
        }
        Ok(())
    }

    /// Probe the ring for at least one live server, raising
    /// [`Error::Ring`] if none are reachable.
    pub fn alive(&self) -> Result<(), Error> {
        let ring = self.ring()?;
        ring.server_for_key(b"\0memsync-alive-probe\0")?;
        Ok(())
    }

    /// Close every open socket. The ring itself, and its consistent-hash
    /// layout, stay intact; the next operation reconnects lazily.
    pub fn close(&self) {
        if let Ok(guard) = self.ring.read() {
            if let Some(ring) = guard.as_ref() {
                ring.reset();
            }
        }
    }

    /// Close every open socket and discard the ring entirely. The next
    /// operation rebuilds it from scratch, including re-resolving the
    /// server list's weights into ring points.
    pub fn reset(&self) {
        let mut guard = self.ring.write().expect("ring lock poisoned");
        if let Some(ring) = guard.as_ref() {
            ring.reset();
        }
        *guard = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[derive(Debug, PartialEq, ::serde_derive::Serialize, ::serde_derive::Deserialize)]
    struct Greeting(String);

    /// Read one request frame (any opcode) and reply with a response frame
    /// carrying `status`/`flags`/`value`/`cas`. Key and extras length in the
    /// response are always zero; that's all the facade tests below need.
    fn respond(sock: &mut std::net::TcpStream, status: u16, flags: u32, value: &[u8], cas: u64) {
        let mut header_buf = [0u8; crate::protocol::Header::SIZE];
        sock.read_exact(&mut header_buf).unwrap();
        let opaque = u32::from_be_bytes(header_buf[12..16].try_into().unwrap());
        let body_len = u32::from_be_bytes(header_buf[8..12].try_into().unwrap());
        let mut body = vec![0u8; body_len as usize];
        sock.read_exact(&mut body).unwrap();

        let extras: Vec<u8> = if flags != 0 {
            flags.to_be_bytes().to_vec()
        } else {
            Vec::new()
        };
        let response_header = crate::protocol::Header {
            magic: 0x81,
            opcode: header_buf[1],
            key_length: 0,
            extras_length: extras.len() as u8,
            data_type: 0,
            vbucket_or_status: status,
            body_len: (extras.len() + value.len()) as u32,
            opaque,
            cas,
        };
        let bytes: Vec<u8> = [&response_header.to_bytes()[..], &extras[..], value].concat();
        sock.write_all(&bytes).unwrap();
    }

    #[test]
    fn get_returns_none_on_key_not_found() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            respond(&mut sock, 0x0001, 0, b"", 0); // KeyNotFound
        });

        let config = ClientConfig::new(format!("{}:{}", addr.ip(), addr.port()));
        let client = Client::new(config).unwrap();
        let result: Option<Greeting> = client.get(b"missing").unwrap();
        assert!(result.is_none());
        handle.join().unwrap();
    }

    #[test]
    fn set_then_read_back_round_trips_through_the_codec() {
        let encoded = bincode::serialize(&Greeting("hi".to_string())).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            respond(&mut sock, 0, 0, b"", 0); // SET ack
            respond(&mut sock, 0, 1, &encoded, 0); // GET: FLAG_SERIALIZED
        });

        let config = ClientConfig::new(format!("{}:{}", addr.ip(), addr.port()));
        let client = Client::new(config).unwrap();
        client.set(b"greeting", &Greeting("hi".to_string()), None).unwrap();
        let value: Option<Greeting> = client.get(b"greeting").unwrap();
        assert_eq!(Some(Greeting("hi".to_string())), value);
        handle.join().unwrap();
    }

    #[test]
    fn cas_reports_missing_without_calling_the_producer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            respond(&mut sock, 0x0001, 0, b"", 0); // GET: KeyNotFound
        });

        let config = ClientConfig::new(format!("{}:{}", addr.ip(), addr.port()));
        let client = Client::new(config).unwrap();
        let outcome = client
            .cas::<Greeting, _>(b"missing", 60, |_| panic!("producer must not run"))
            .unwrap();
        assert!(matches!(outcome, CasOutcome::Missing));
        handle.join().unwrap();
    }
}
