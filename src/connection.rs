//! Owns one socket to one server: its state machine, down-timer, and the
//! blocking request/response cycle plus the quiet-pipeline primitives the
//! multi-get coordinator drains.

use std::io::{self, Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use socket2::SockRef;

use crate::error::Error;
use crate::protocol::{Header, Opaque, Packet, ProtocolError};
use crate::server::{Endpoint, ServerDescriptor};

/// One of [`Connection`]'s externally visible states, per §4.4.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnState {
    Unconnected,
    Connecting,
    Authenticating,
    Ready,
    Down(Instant),
    Closed,
}

/// Knobs that govern a connection's socket and retry behavior. Cloned into
/// every [`Connection`] a [`crate::ring::Ring`] owns.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub socket_timeout: Duration,
    pub socket_max_failures: u32,
    pub socket_failure_delay: Duration,
    pub down_retry_delay: Duration,
    pub keepalive: bool,
    pub sndbuf: Option<usize>,
    pub rcvbuf: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            socket_timeout: Duration::from_secs(1),
            socket_max_failures: 2,
            socket_failure_delay: Duration::from_millis(100),
            down_retry_delay: Duration::from_secs(30),
            keepalive: true,
            sndbuf: None,
            rcvbuf: None,
        }
    }
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn connect(endpoint: &Endpoint, timeout: Duration) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let mut last_err = None;
                for addr in std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), *port))? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(stream) => return Ok(Stream::Tcp(stream)),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
                }))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => UnixStream::connect(path).map(Stream::Unix),
        }
    }

    fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        let timeout = Some(timeout);
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            #[cfg(unix)]
            Stream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Stream::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    fn apply_socket_options(&self, opts: &ConnectionOptions) -> io::Result<()> {
        if let Stream::Tcp(s) = self {
            let sock = SockRef::from(s);
            sock.set_keepalive(opts.keepalive)?;
            if let Some(sndbuf) = opts.sndbuf {
                sock.set_send_buffer_size(sndbuf)?;
            }
            if let Some(rcvbuf) = opts.rcvbuf {
                sock.set_recv_buffer_size(rcvbuf)?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// Tracks an in-flight pipelined multi-get drain on this connection.
struct PendingMultiGet {
    noop_opaque: Opaque,
    buffer: Vec<u8>,
    completed: bool,
}

/// One server connection: socket, state machine, and the opaque counter
/// used to correlate requests with responses.
pub struct Connection {
    descriptor: ServerDescriptor,
    options: ConnectionOptions,
    stream: Option<Stream>,
    state: ConnState,
    opaque_counter: u32,
    consecutive_failures: u32,
    pending: Option<PendingMultiGet>,
}

impl Connection {
    pub fn new(descriptor: ServerDescriptor, options: ConnectionOptions) -> Self {
        Self {
            descriptor,
            options,
            stream: None,
            state: ConnState::Unconnected,
            opaque_counter: 0,
            consecutive_failures: 0,
            pending: None,
        }
    }

    pub fn name(&self) -> String {
        self.descriptor.name()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// A connection is alive when it is `Ready`, untested, or its down
    /// timer has elapsed — i.e. the next request is expected to succeed or
    /// at least get a fair try.
    pub fn is_alive(&self) -> bool {
        match self.state {
            ConnState::Closed => false,
            ConnState::Down(until) => Instant::now() >= until,
            _ => true,
        }
    }

    fn next_opaque(&mut self) -> Opaque {
        self.opaque_counter = self.opaque_counter.wrapping_add(1);
        if self.opaque_counter == 0 {
            self.opaque_counter = 1;
        }
        self.opaque_counter
    }

    fn mark_down(&mut self) {
        warn!("marking {} down for {:?}", self.name(), self.options.down_retry_delay);
        self.stream = None;
        self.state = ConnState::Down(Instant::now() + self.options.down_retry_delay);
        self.consecutive_failures = 0;
    }

    fn connect(&mut self) -> Result<(), Error> {
        self.state = ConnState::Connecting;
        let stream = Stream::connect(&self.descriptor.endpoint, self.options.socket_timeout)
            .map_err(Error::from)?;
        stream.set_timeouts(self.options.socket_timeout)?;
        stream.apply_socket_options(&self.options)?;
        self.stream = Some(stream);
        if self.descriptor.username.is_some() {
            self.state = ConnState::Authenticating;
        } else {
            self.state = ConnState::Ready;
            self.consecutive_failures = 0;
        }
        Ok(())
    }

    fn authenticate(&mut self) -> Result<(), Error> {
        let username = self.descriptor.username.clone().unwrap_or_default();
        let password = self.descriptor.password.clone().unwrap_or_default();
        let mut data = Vec::with_capacity(username.len() + password.len() + 2);
        data.push(0);
        data.extend_from_slice(username.as_bytes());
        data.push(0);
        data.extend_from_slice(password.as_bytes());

        let opaque = self.next_opaque();
        let packet = Packet::sasl_auth(b"PLAIN", data, opaque);
        self.write_packet(packet)?;
        let response = self.read_packet()?;
        match response.error_for_status() {
            Ok(()) => {
                self.state = ConnState::Ready;
                self.consecutive_failures = 0;
                Ok(())
            }
            Err(status) => {
                self.mark_down();
                Err(status.into())
            }
        }
    }

    fn ensure_ready(&mut self) -> Result<(), Error> {
        loop {
            match self.state {
                ConnState::Ready => return Ok(()),
                ConnState::Closed => {
                    return Err(Error::from(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "connection is closed",
                    )))
                }
                ConnState::Down(until) => {
                    if Instant::now() >= until {
                        self.state = ConnState::Unconnected;
                    } else {
                        return Err(Error::from(io::Error::new(
                            io::ErrorKind::NotConnected,
                            "server is down",
                        )));
                    }
                }
                ConnState::Unconnected | ConnState::Connecting => self.connect()?,
                ConnState::Authenticating => self.authenticate()?,
            }
        }
    }

    fn stream_mut(&mut self) -> Result<&mut Stream, Error> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::from(io::Error::new(io::ErrorKind::NotConnected, "no socket")))
    }

    fn write_packet(&mut self, packet: Packet) -> Result<(), Error> {
        let bytes: Vec<u8> = packet.into();
        self.stream_mut()?.write_all(&bytes).map_err(Error::from)
    }

    fn read_packet(&mut self) -> Result<Packet, Error> {
        let mut header_buf = [0u8; Header::SIZE];
        self.stream_mut()?.read_exact(&mut header_buf)?;
        let header = Header::read_response(&header_buf)?;
        let mut body = vec![0u8; header.body_len as usize];
        if !body.is_empty() {
            self.stream_mut()?.read_exact(&mut body)?;
        }
        Ok(header.read_packet(&body)?)
    }

    /// Send one request and block for its response, retrying the
    /// handshake+send up to `socket_max_failures` times on a network error
    /// before marking the server down, per §4.4.
    pub fn request(&mut self, build: impl Fn(Opaque) -> Packet) -> Result<Packet, Error> {
        let mut attempt = 0;
        loop {
            match self.try_request(&build) {
                Ok(packet) => return Ok(packet),
                Err(err) if err.is_network() => {
                    attempt += 1;
                    self.consecutive_failures += 1;
                    debug!(
                        "request to {} failed (attempt {}/{}): {}",
                        self.name(),
                        attempt,
                        self.options.socket_max_failures,
                        err
                    );
                    if attempt >= self.options.socket_max_failures {
                        self.mark_down();
                        return Err(err);
                    }
                    self.stream = None;
                    self.state = ConnState::Unconnected;
                    thread::sleep(self.options.socket_failure_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_request(&mut self, build: &impl Fn(Opaque) -> Packet) -> Result<Packet, Error> {
        self.ensure_ready()?;
        let opaque = self.next_opaque();
        let packet = build(opaque);
        self.write_packet(packet)?;
        let response = self.read_packet()?;
        if response.header.opaque != opaque {
            return Err(ProtocolError::UnexpectedOpaque {
                expected: opaque,
                got: response.header.opaque,
            }
            .into());
        }
        Ok(response)
    }

    /// Send one request and collect every response frame up to and
    /// including the one with an empty key, for STAT's one-request/
    /// many-response reply shape. Subject to the same retry policy as
    /// [`request`](Connection::request).
    pub fn request_multi(&mut self, build: impl Fn(Opaque) -> Packet) -> Result<Vec<Packet>, Error> {
        let mut attempt = 0;
        loop {
            match self.try_request_multi(&build) {
                Ok(packets) => return Ok(packets),
                Err(err) if err.is_network() => {
                    attempt += 1;
                    self.consecutive_failures += 1;
                    if attempt >= self.options.socket_max_failures {
                        self.mark_down();
                        return Err(err);
                    }
                    self.stream = None;
                    self.state = ConnState::Unconnected;
                    thread::sleep(self.options.socket_failure_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_request_multi(&mut self, build: &impl Fn(Opaque) -> Packet) -> Result<Vec<Packet>, Error> {
        self.ensure_ready()?;
        let opaque = self.next_opaque();
        let packet = build(opaque);
        self.write_packet(packet)?;
        let mut out = Vec::new();
        loop {
            let response = self.read_packet()?;
            if response.header.opaque != opaque {
                return Err(ProtocolError::UnexpectedOpaque {
                    expected: opaque,
                    got: response.header.opaque,
                }
                .into());
            }
            let done = response.key.is_empty();
            out.push(response);
            if done {
                return Ok(out);
            }
        }
    }

    /// Write one `GETQ` per key followed by a `NOOP`, without reading.
    pub fn send_multiget(&mut self, keys: &[Vec<u8>]) -> Result<(), Error> {
        self.ensure_ready()?;
        let mut bytes = Vec::new();
        for key in keys {
            let opaque = self.next_opaque();
            bytes.extend(Vec::<u8>::from(Packet::getkq(key, opaque)));
        }
        let noop_opaque = self.next_opaque();
        bytes.extend(Vec::<u8>::from(Packet::noop(noop_opaque)));
        self.stream_mut()?.write_all(&bytes)?;
        self.pending = Some(PendingMultiGet {
            noop_opaque,
            buffer: Vec::new(),
            completed: false,
        });
        Ok(())
    }

    /// Mark this connection as awaiting a multi-get drain and switch its
    /// socket to non-blocking mode for [`multi_response_nonblock`].
    pub fn multi_response_start(&mut self) -> Result<(), Error> {
        self.stream_mut()?.set_nonblocking(true)?;
        Ok(())
    }

    #[cfg(unix)]
    pub fn raw_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(Stream::as_raw_fd)
    }

    /// Read whatever is immediately available and parse zero or more
    /// `GETKQ` responses out of it, returning `(key, value, flags, cas)`.
    pub fn multi_response_nonblock(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>, u32, u64)>, Error> {
        let mut chunk = [0u8; 4096];
        loop {
            let stream = self.stream_mut()?;
            match stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::from(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-drain",
                    )))
                }
                Ok(n) => {
                    let pending = self.pending.as_mut().expect("drain started");
                    pending.buffer.extend_from_slice(&chunk[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.drain_buffered_frames()
    }

    fn drain_buffered_frames(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>, u32, u64)>, Error> {
        let mut out = Vec::new();
        loop {
            let pending = self.pending.as_mut().expect("drain started");
            if pending.buffer.len() < Header::SIZE {
                return Ok(out);
            }
            let header = Header::read_response(&pending.buffer[..Header::SIZE])?;
            let frame_len = Header::SIZE + header.body_len as usize;
            if pending.buffer.len() < frame_len {
                return Ok(out);
            }
            let body = pending.buffer[Header::SIZE..frame_len].to_vec();
            let packet = header.read_packet(&body)?;
            pending.buffer.drain(..frame_len);

            if packet.is_noop() && packet.header.opaque == pending.noop_opaque {
                pending.completed = true;
                return Ok(out);
            }
            if packet.error_for_status().is_ok() {
                out.push((
                    packet.key.clone(),
                    packet.value.clone(),
                    packet.response_flags(),
                    packet.header.cas,
                ));
            }
        }
    }

    pub fn multi_response_completed(&self) -> bool {
        self.pending.as_ref().map(|p| p.completed).unwrap_or(true)
    }

    /// Discard any buffered bytes and close the socket, per §4.4 — used
    /// when the coordinator's whole-operation deadline expires.
    pub fn multi_response_abort(&mut self) {
        self.pending = None;
        self.stream = None;
        self.state = ConnState::Unconnected;
    }

    /// Switch the socket back to blocking mode once a drain has completed,
    /// so ordinary `request()` calls resume working as normal.
    pub fn multi_response_finish(&mut self) -> Result<(), Error> {
        if let Some(stream) = &self.stream {
            stream.set_nonblocking(false)?;
        }
        self.pending = None;
        Ok(())
    }

    /// Close the socket and move to `Closed`. Terminal for this instance;
    /// the ring replaces it on reset.
    pub fn close(&mut self) {
        self.stream = None;
        self.pending = None;
        self.state = ConnState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.pending.is_some() {
            let _ = self.multi_response_finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn spawn_echo_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[test]
    fn opaque_counter_skips_zero_and_wraps() {
        let descriptor = ServerDescriptor {
            endpoint: Endpoint::Tcp {
                host: "localhost".into(),
                port: 1,
            },
            weight: 1,
            username: None,
            password: None,
        };
        let mut conn = Connection::new(descriptor, ConnectionOptions::default());
        conn.opaque_counter = u32::MAX;
        let first = conn.next_opaque();
        assert_eq!(0, first.wrapping_sub(u32::MAX)); // wraps to 0 internally...
        assert_ne!(0, conn.opaque_counter); // ...but is never exposed as 0
    }

    #[test]
    fn unconnected_is_alive_until_probed() {
        let descriptor = ServerDescriptor {
            endpoint: Endpoint::Tcp {
                host: "localhost".into(),
                port: 1,
            },
            weight: 1,
            username: None,
            password: None,
        };
        let conn = Connection::new(descriptor, ConnectionOptions::default());
        assert!(conn.is_alive());
    }

    #[test]
    fn down_becomes_alive_again_after_the_timer_elapses() {
        let descriptor = ServerDescriptor {
            endpoint: Endpoint::Tcp {
                host: "localhost".into(),
                port: 1,
            },
            weight: 1,
            username: None,
            password: None,
        };
        let mut conn = Connection::new(descriptor, ConnectionOptions::default());
        conn.state = ConnState::Down(Instant::now() - Duration::from_millis(1));
        assert!(conn.is_alive());
        conn.state = ConnState::Down(Instant::now() + Duration::from_secs(30));
        assert!(!conn.is_alive());
    }

    #[test]
    fn get_round_trips_against_a_mock_server() {
        let (listener, addr) = spawn_echo_server();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut header_buf = [0u8; Header::SIZE];
            sock.read_exact(&mut header_buf).unwrap();
            // Requests carry the request magic (0x80); patch it to parse the
            // rest of the header fields with the same reader the real
            // client uses for responses.
            let mut peek = header_buf;
            peek[0] = 0x81;
            let header = Header::read_response(&peek).unwrap();
            let mut body = vec![0u8; header.body_len as usize];
            sock.read_exact(&mut body).unwrap();

            let mut response_header = header;
            response_header.magic = 0x81;
            response_header.extras_length = 0;
            response_header.key_length = 0;
            let value = b"bar".to_vec();
            response_header.body_len = value.len() as u32;
            let bytes: Vec<u8> = [&response_header.to_bytes()[..], &value[..]].concat();
            sock.write_all(&bytes).unwrap();
        });

        let mut parts = addr.rsplitn(2, ':');
        let port: u16 = parts.next().unwrap().parse().unwrap();
        let host = parts.next().unwrap().to_string();
        let descriptor = ServerDescriptor {
            endpoint: Endpoint::Tcp { host, port },
            weight: 1,
            username: None,
            password: None,
        };
        let mut conn = Connection::new(descriptor, ConnectionOptions::default());
        let response = conn.request(|opaque| Packet::get(b"foo", opaque)).unwrap();
        assert_eq!(b"bar".to_vec(), response.value);
        handle.join().unwrap();
    }
}
