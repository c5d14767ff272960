//! Consistent-hash ring over a server list: each server claims
//! `160 * weight` points, and a key maps to the first alive server found
//! walking forward from its hashed position, per §4.5.

use std::sync::{Mutex, MutexGuard};

use murmur3::murmur3_32;

use crate::connection::{Connection, ConnectionOptions};
use crate::error::Error;
use crate::server::ServerDescriptor;

const POINTS_PER_WEIGHT: usize = 160;

/// Maps keys onto a fixed set of connections via consistent hashing, with
/// failover to the next alive server when one is down.
pub struct Ring {
    connections: Vec<Mutex<Connection>>,
    descriptors: Vec<ServerDescriptor>,
    points: Vec<(u32, usize)>,
    failover: bool,
}

impl Ring {
    pub fn new(
        descriptors: Vec<ServerDescriptor>,
        options: ConnectionOptions,
        failover: bool,
    ) -> Result<Self, Error> {
        if descriptors.is_empty() {
            return Err(Error::Ring("no servers configured".into()));
        }

        let mut points = Vec::new();
        for (index, descriptor) in descriptors.iter().enumerate() {
            let name = descriptor.name();
            let count = POINTS_PER_WEIGHT * descriptor.weight.max(1) as usize;
            for i in 0..count {
                let point_key = format!("{}:{}", name, i);
                let mut bytes = point_key.as_bytes();
                let hash = murmur3_32(&mut bytes, 0)
                    .map_err(|e| Error::Ring(format!("failed to hash ring point: {}", e)))?;
                points.push((hash, index));
            }
        }
        points.sort_unstable();

        let connections = descriptors
            .iter()
            .cloned()
            .map(|d| Mutex::new(Connection::new(d, options)))
            .collect();

        Ok(Self {
            connections,
            descriptors,
            points,
            failover,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn descriptor(&self, index: usize) -> &ServerDescriptor {
        &self.descriptors[index]
    }

    fn position_for_hash(&self, hash: u32) -> usize {
        self.points
            .binary_search_by_key(&hash, |(h, _)| *h)
            .unwrap_or_else(|next| next % self.points.len())
    }

    fn is_alive(&self, server_index: usize) -> bool {
        self.connections[server_index]
            .lock()
            .expect("connection mutex poisoned")
            .is_alive()
    }

    /// Resolve `key` to a server index, walking forward through the ring
    /// past down servers when `failover` is enabled.
    pub fn server_for_key(&self, key: &[u8]) -> Result<usize, Error> {
        let mut bytes = key;
        let hash = murmur3_32(&mut bytes, 0)
            .map_err(|e| Error::Ring(format!("failed to hash key: {}", e)))?;
        let start = self.position_for_hash(hash);
        let home = self.points[start].1;
        if self.is_alive(home) {
            return Ok(home);
        }
        if !self.failover {
            return Err(Error::Ring(format!(
                "{} is down and failover is disabled",
                self.descriptors[home].name()
            )));
        }

        let mut tried = std::collections::HashSet::new();
        tried.insert(home);
        let n = self.points.len();
        for step in 1..n {
            let candidate = self.points[(start + step) % n].1;
            if tried.contains(&candidate) {
                continue;
            }
            tried.insert(candidate);
            if self.is_alive(candidate) {
                return Ok(candidate);
            }
            if tried.len() == self.descriptors.len() {
                break;
            }
        }
        Err(Error::Ring("no live server found for key".into()))
    }

    /// Borrow one connection directly, already resolved to its index.
    pub fn connection(&self, index: usize) -> MutexGuard<'_, Connection> {
        self.connections[index].lock().expect("connection mutex poisoned")
    }

    /// Lock every connection in the ring, in index order, and hand the
    /// guards to `f`. Used by the multi-get coordinator so a pipelined
    /// drain on several connections can't interleave with unrelated
    /// single-key requests on the same sockets.
    pub fn lock<R>(&self, f: impl FnOnce(&mut [MutexGuard<'_, Connection>]) -> R) -> R {
        let mut guards: Vec<MutexGuard<'_, Connection>> = self
            .connections
            .iter()
            .map(|c| c.lock().expect("connection mutex poisoned"))
            .collect();
        f(&mut guards)
    }

    /// Close every connection and drop it from service; used when the
    /// ring itself is being torn down.
    pub fn reset(&self) {
        for conn in &self.connections {
            conn.lock().expect("connection mutex poisoned").close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Ring;
    use crate::connection::ConnectionOptions;
    use crate::server::{Endpoint, ServerDescriptor};

    fn descriptor(host: &str, port: u16, weight: u32) -> ServerDescriptor {
        ServerDescriptor {
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port,
            },
            weight,
            username: None,
            password: None,
        }
    }

    #[test]
    fn same_key_always_maps_to_the_same_server() {
        let ring = Ring::new(
            vec![descriptor("a", 1, 1), descriptor("b", 2, 1), descriptor("c", 3, 1)],
            ConnectionOptions::default(),
            true,
        )
        .unwrap();

        let first = ring.server_for_key(b"some-key").unwrap();
        let second = ring.server_for_key(b"some-key").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn heavier_weight_claims_more_ring_points() {
        let ring = Ring::new(
            vec![descriptor("a", 1, 1), descriptor("b", 2, 9)],
            ConnectionOptions::default(),
            true,
        )
        .unwrap();

        let heavy_points = ring.points.iter().filter(|(_, idx)| *idx == 1).count();
        let light_points = ring.points.iter().filter(|(_, idx)| *idx == 0).count();
        assert!(heavy_points > light_points);
    }

    #[test]
    fn rejects_an_empty_server_list() {
        assert!(Ring::new(vec![], ConnectionOptions::default(), true).is_err());
    }

    #[test]
    fn failover_disabled_surfaces_a_ring_error_for_a_down_server() {
        let ring = Ring::new(vec![descriptor("a", 1, 1)], ConnectionOptions::default(), false).unwrap();
        {
            let mut conn = ring.connection(0);
            conn.close();
        }
        let err = ring.server_for_key(b"anything").unwrap_err();
        assert!(matches!(err, crate::error::Error::Ring(_)));
    }
}
