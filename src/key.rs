//! Validates, namespaces, and length-bounds a key before it goes on the
//! wire, and reverses the namespacing on the way back for multi-get.

use std::sync::Arc;

use md5::{Digest, Md5};

use crate::error::Error;

/// Memcached keys are capped at 250 bytes on the wire.
pub const MAX_KEY_LENGTH: usize = 250;

/// A fixed string or a zero-argument producer, called once per
/// [`normalize`](KeyNormalizer::normalize)/[`denormalize`](KeyNormalizer::denormalize)
/// call, that is prepended to every key. Modeled as its own type rather than
/// an `Option<String>` plus a hidden memoized attribute, per the source's
/// "dynamic namespace producer" design note.
#[derive(Clone)]
pub enum NamespaceSource {
    None,
    Fixed(String),
    Dynamic(Arc<dyn Fn() -> String + Send + Sync>),
}

impl NamespaceSource {
    pub fn fixed<S: Into<String>>(namespace: S) -> Self {
        NamespaceSource::Fixed(namespace.into())
    }

    pub fn dynamic<F: Fn() -> String + Send + Sync + 'static>(producer: F) -> Self {
        NamespaceSource::Dynamic(Arc::new(producer))
    }

    /// The namespace string for this call, or `None` if no namespace is
    /// configured.
    pub fn resolve(&self) -> Option<String> {
        match self {
            NamespaceSource::None => None,
            NamespaceSource::Fixed(ns) => Some(ns.clone()),
            NamespaceSource::Dynamic(producer) => Some(producer()),
        }
    }
}

impl std::fmt::Debug for NamespaceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NamespaceSource::None => write!(f, "NamespaceSource::None"),
            NamespaceSource::Fixed(ns) => write!(f, "NamespaceSource::Fixed({:?})", ns),
            NamespaceSource::Dynamic(_) => write!(f, "NamespaceSource::Dynamic(..)"),
        }
    }
}

/// Produces a hex digest of a byte string. The default is [`Md5Hasher`];
/// implement this to plug in another `digest_class`.
pub trait KeyDigest: Clone + Send + Sync {
    fn digest_hex(&self, data: &[u8]) -> String;
}

/// MD5 digest, hex-encoded. This crate's default `digest_class`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Hasher;

impl KeyDigest for Md5Hasher {
    fn digest_hex(&self, data: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(data);
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Validates, namespaces, and length-bounds keys before they go on the wire.
pub struct KeyNormalizer<D: KeyDigest> {
    namespace: NamespaceSource,
    digest: D,
}

impl<D: KeyDigest> KeyNormalizer<D> {
    pub fn new(namespace: NamespaceSource, digest: D) -> Self {
        Self { namespace, digest }
    }

    /// Validate, namespace, and length-bound `key`, returning the bytes
    /// actually sent on the wire.
    pub fn normalize(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        if key.is_empty() {
            return Err(Error::InvalidKey("key must not be empty".into()));
        }
        for &byte in key {
            if byte < 0x21 || byte == 0x7F {
                return Err(Error::InvalidKey(format!(
                    "key contains forbidden byte {:#04x}",
                    byte
                )));
            }
        }

        let namespace = self.namespace.resolve();
        let mut full = Vec::with_capacity(key.len() + 32);
        if let Some(ns) = &namespace {
            full.extend_from_slice(ns.as_bytes());
            full.push(b':');
        }
        full.extend_from_slice(key);

        if full.len() <= MAX_KEY_LENGTH {
            return Ok(full);
        }

        // Too long even after namespacing: replace with a digested form
        // that is guaranteed to fit within MAX_KEY_LENGTH.
        let ns_len = namespace.as_ref().map(String::len).unwrap_or(0);
        let prefix_len = (212usize.saturating_sub(ns_len)).min(full.len());
        let prefix = &full[..prefix_len];
        let digest = self.digest.digest_hex(&full);

        let mut digested = Vec::with_capacity(prefix_len + 5 + digest.len());
        digested.extend_from_slice(prefix);
        digested.extend_from_slice(b":md5:");
        digested.extend_from_slice(digest.as_bytes());
        Ok(digested)
    }

    /// Strip a leading `namespace:` exactly once, for re-associating
    /// multi-get responses with the keys the caller asked for.
    pub fn denormalize(&self, key: &[u8]) -> Vec<u8> {
        if let Some(ns) = self.namespace.resolve() {
            let prefix_len = ns.len() + 1;
            if key.len() > prefix_len && key[..ns.len()] == *ns.as_bytes() && key[ns.len()] == b':' {
                return key[prefix_len..].to_vec();
            }
        }
        key.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyNormalizer, Md5Hasher, NamespaceSource, MAX_KEY_LENGTH};

    fn normalizer(namespace: NamespaceSource) -> KeyNormalizer<Md5Hasher> {
        KeyNormalizer::new(namespace, Md5Hasher)
    }

    #[test]
    fn empty_key_is_rejected() {
        let n = normalizer(NamespaceSource::None);
        assert!(n.normalize(b"").is_err());
    }

    #[test]
    fn forbidden_bytes_are_rejected() {
        let n = normalizer(NamespaceSource::None);
        assert!(n.normalize(b"has space").is_err());
        assert!(n.normalize(&[0x7F]).is_err());
        assert!(n.normalize(&[0x01]).is_err());
    }

    #[test]
    fn namespace_is_prepended() {
        let n = normalizer(NamespaceSource::fixed("ns"));
        assert_eq!(b"ns:abc".to_vec(), n.normalize(b"abc").unwrap());
    }

    #[test]
    fn round_trips_through_denormalize_when_short() {
        let n = normalizer(NamespaceSource::fixed("ns"));
        let wire = n.normalize(b"abc").unwrap();
        assert_eq!(b"abc".to_vec(), n.denormalize(&wire));
    }

    #[test]
    fn dynamic_namespace_is_recomputed_each_call() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let n = normalizer(NamespaceSource::dynamic(move || {
            format!("gen{}", counter_clone.fetch_add(1, Ordering::SeqCst))
        }));
        assert_eq!(b"gen0:k".to_vec(), n.normalize(b"k").unwrap());
        assert_eq!(b"gen1:k".to_vec(), n.normalize(b"k").unwrap());
    }

    #[test]
    fn long_key_is_digested_and_fits_the_wire_limit() {
        let n = normalizer(NamespaceSource::fixed("ns"));
        let long_key = "k".repeat(300);
        let wire = n.normalize(long_key.as_bytes()).unwrap();

        assert!(wire.len() <= MAX_KEY_LENGTH);
        let wire_str = String::from_utf8(wire).unwrap();
        assert!(wire_str.starts_with("ns:"));
        let mut parts = wire_str.rsplitn(3, ':');
        let hex = parts.next().unwrap();
        let marker = parts.next().unwrap();
        assert_eq!("md5", marker);
        assert_eq!(32, hex.len());
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
