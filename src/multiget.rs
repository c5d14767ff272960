//! Pipelined multi-get: group keys by server, fire a quiet `GETKQ` per key
//! plus a trailing `NOOP`, and drain every participating connection under
//! one shared deadline by multiplexing on socket readiness, per §4.7.
//!
//! Readiness multiplexing needs a raw, pollable file descriptor per
//! connection, which ties this module to Unix sockets.

use std::collections::{HashMap, HashSet};
use std::io;
use std::time::{Duration, Instant};

use log::warn;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::error::Error;
use crate::ring::Ring;

/// One key's worth of a multi-get response.
#[derive(Debug, Clone)]
pub struct MultiGetEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
}

/// Drives a pipelined multi-get across every server the requested keys
/// land on.
pub struct MultiGetCoordinator<'a> {
    ring: &'a Ring,
}

impl<'a> MultiGetCoordinator<'a> {
    pub fn new(ring: &'a Ring) -> Self {
        Self { ring }
    }

    /// Fetch every key in `keys` (already namespaced and wire-ready),
    /// aborting the whole operation if it doesn't finish within `timeout`.
    pub fn fetch(&self, keys: &[Vec<u8>], timeout: Duration) -> Result<Vec<MultiGetEntry>, Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_server: HashMap<usize, Vec<Vec<u8>>> = HashMap::new();
        for key in keys {
            let server_index = match self.ring.server_for_key(key) {
                Ok(index) => index,
                Err(err) => {
                    warn!("dropping key from multi-get, ring lookup failed: {}", err);
                    continue;
                }
            };
            by_server.entry(server_index).or_default().push(key.clone());
        }

        let deadline = Instant::now() + timeout;

        self.ring.lock(|guards| {
            let mut poll = Poll::new()?;
            let mut events = Events::with_capacity(by_server.len().max(1));
            let mut active: HashSet<usize> = HashSet::new();

            for (&server_index, server_keys) in &by_server {
                guards[server_index].send_multiget(server_keys)?;
                guards[server_index].multi_response_start()?;
                let fd = guards[server_index]
                    .raw_fd()
                    .expect("connection must hold an open socket after send_multiget");
                poll.registry()
                    .register(&mut SourceFd(&fd), Token(server_index), Interest::READABLE)?;
                active.insert(server_index);
            }

            let mut results = Vec::new();
            while !active.is_empty() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    for &server_index in &active {
                        guards[server_index].multi_response_abort();
                    }
                    return Err(Error::from(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "multi-get did not complete within the configured socket timeout",
                    )));
                }

                poll.poll(&mut events, Some(remaining))?;
                for event in events.iter() {
                    let server_index = event.token().0;
                    if !active.contains(&server_index) {
                        continue;
                    }
                    match guards[server_index].multi_response_nonblock() {
                        Ok(frames) => {
                            for (key, value, flags, cas) in frames {
                                results.push(MultiGetEntry { key, value, flags, cas });
                            }
                            if guards[server_index].multi_response_completed() {
                                guards[server_index].multi_response_finish()?;
                                active.remove(&server_index);
                                let fd = guards[server_index]
                                    .raw_fd()
                                    .expect("socket stays open on a clean drain finish");
                                let _ = poll.registry().deregister(&mut SourceFd(&fd));
                            }
                        }
                        Err(err) => {
                            guards[server_index].multi_response_abort();
                            active.remove(&server_index);
                            return Err(err);
                        }
                    }
                }
            }

            Ok(results)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::server::{Endpoint, ServerDescriptor};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn fetches_keys_routed_to_a_single_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = sock.read(&mut chunk).unwrap();
                buf.extend_from_slice(&chunk[..n]);
                // Two GETKQ requests (24-byte header + key, no extras/value)
                // plus one NOOP (24-byte header only): 3*24 + len("foo") + len("missing").
                if buf.len() >= 24 * 3 + 3 + 7 {
                    break;
                }
            }

            // Reply with one GETKQ response for "foo" and a NOOP.
            let mut response = Vec::new();
            let key = b"foo";
            let value = b"bar";
            let body_len = (key.len() + value.len()) as u32;
            response.extend_from_slice(&[0x81, 0x0d]); // magic, opcode GETKQ
            response.extend_from_slice(&(key.len() as u16).to_be_bytes());
            response.push(0); // extras_length
            response.push(0); // data_type
            response.extend_from_slice(&[0, 0]); // status
            response.extend_from_slice(&body_len.to_be_bytes());
            response.extend_from_slice(&[0, 0, 0, 2]); // opaque (2nd key's opaque)
            response.extend_from_slice(&[0u8; 8]); // cas
            response.extend_from_slice(key);
            response.extend_from_slice(value);

            response.extend_from_slice(&[0x81, 0x0a]); // magic, opcode NOOP
            response.extend_from_slice(&[0, 0]); // key_length
            response.push(0);
            response.push(0);
            response.extend_from_slice(&[0, 0]);
            response.extend_from_slice(&0u32.to_be_bytes());
            response.extend_from_slice(&[0, 0, 0, 3]); // noop opaque
            response.extend_from_slice(&[0u8; 8]);

            sock.write_all(&response).unwrap();
        });

        let descriptor = ServerDescriptor {
            endpoint: Endpoint::Tcp {
                host: addr.ip().to_string(),
                port: addr.port(),
            },
            weight: 1,
            username: None,
            password: None,
        };
        let ring = Ring::new(vec![descriptor], ConnectionOptions::default(), true).unwrap();
        let coordinator = MultiGetCoordinator::new(&ring);
        let results = coordinator
            .fetch(&[b"foo".to_vec(), b"missing".to_vec()], Duration::from_secs(2))
            .unwrap();

        assert_eq!(1, results.len());
        assert_eq!(b"foo".to_vec(), results[0].key);
        assert_eq!(b"bar".to_vec(), results[0].value);
        handle.join().unwrap();
    }
}
