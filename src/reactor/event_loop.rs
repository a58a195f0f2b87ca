//! Single-threaded reactor driving the connection lifecycle contract.
//!
//! Readiness-based model: one poll call per loop iteration tells us which
//! sockets are ready, then we perform non-blocking syscalls. Uses epoll on
//! Linux, kqueue on macOS. Registration is edge-triggered, so every dispatch
//! must drain the socket before returning.
//!
//! All registry mutation, contract dispatch, and the once-per-second timeout
//! sweep happen on the one thread that calls [`Reactor::run`]; there is no
//! locking because there is nothing to race with.

use crate::reactor::connection::Connection;
use crate::reactor::registry::{ConnId, Registry};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Poll wait per loop iteration; bounds how late a timeout sweep can run.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum spacing between timeout sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const EVENTS_CAPACITY: usize = 64;

/// Error from reactor construction, naming the step that failed.
///
/// Setup failures are fatal: a reactor that could not bind, listen, or
/// register its listener must not run.
#[derive(Debug, Error)]
#[error("{step} failed during reactor setup: {source}")]
pub struct SetupError {
    pub step: &'static str,
    #[source]
    pub source: io::Error,
}

fn setup(step: &'static str) -> impl FnOnce(io::Error) -> SetupError {
    move |source| SetupError { step, source }
}

/// Which close variant a teardown invokes.
enum Close {
    /// The peer hung up.
    Client,
    /// The server is terminating the connection (failure or timeout).
    Server,
}

/// The event loop: owns the listener, the poll instance, and the registry,
/// and is the single authority over connection lifetimes.
pub struct Reactor<C: Connection> {
    poll: Poll,
    listener: TcpListener,
    registry: Registry<C>,
    timeout: Duration,
    last_sweep: Instant,
}

impl<C: Connection> Reactor<C> {
    /// Bind and listen on `host:port` and register the listener with a new
    /// poll instance.
    ///
    /// Every step is fatal on failure; the returned [`SetupError`] names the
    /// failing step and carries the OS error.
    pub fn new(
        host: &str,
        port: u16,
        timeout: Duration,
        max_connections: usize,
    ) -> Result<Self, SetupError> {
        let ip: IpAddr = host.parse().map_err(|e| SetupError {
            step: "parse listen address",
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        })?;
        let addr = SocketAddr::new(ip, port);

        let socket = socket2::Socket::new(
            match addr {
                SocketAddr::V4(_) => socket2::Domain::IPV4,
                SocketAddr::V6(_) => socket2::Domain::IPV6,
            },
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .map_err(setup("create socket"))?;

        socket
            .set_reuse_address(true)
            .map_err(setup("set SO_REUSEADDR"))?;
        socket.bind(&addr.into()).map_err(setup("bind"))?;
        socket
            .set_nonblocking(true)
            .map_err(setup("set non-blocking"))?;
        socket.listen(libc::SOMAXCONN).map_err(setup("listen"))?;

        let mut listener = TcpListener::from_std(socket.into());

        let poll = Poll::new().map_err(setup("create poll"))?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(setup("register listener"))?;

        Ok(Self {
            poll,
            listener,
            registry: Registry::new(max_connections),
            timeout,
            last_sweep: Instant::now(),
        })
    }

    /// Address the listener is bound to. Useful when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of currently registered connections.
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Run the event loop for the lifetime of the process.
    ///
    /// Only a failing poll call returns; per-connection errors never
    /// propagate out of their own teardown.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.turn(&mut events, POLL_INTERVAL)?;
        }
    }

    /// One loop iteration: a single bounded poll, event dispatch, then the
    /// time-gated sweep. Split out from `run` so tests can drive the loop.
    fn turn(&mut self, events: &mut Events, wait: Duration) -> io::Result<()> {
        if let Err(e) = self.poll.poll(events, Some(wait)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                self.accept_ready();
            } else {
                self.dispatch(event);
            }
        }

        // The sweep runs after dispatch, so a connection that received data
        // this iteration is checked against its fresh activity timestamp.
        if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
            if !self.registry.is_empty() {
                self.sweep();
            }
            self.last_sweep = Instant::now();
        }

        Ok(())
    }

    /// Drain the accept queue. The listener is edge-triggered like everything
    /// else, so we must accept until the call would block.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Expected race between notification and consumption;
                    // never fatal to the process.
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Register one accepted stream and hand it to the contract constructor.
    ///
    /// Any failure here discards the candidate connection without a registry
    /// entry; the stream drops and the descriptor closes on every exit path.
    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.registry.len() >= self.registry.capacity() {
            warn!(peer = %peer, "connection limit reached, rejecting");
            return;
        }

        let id = self.registry.vacant_id();
        let mut conn = C::open(stream, peer, self.timeout);

        // mio registers edge-triggered; hangup notification is implicit.
        if let Err(e) = self.poll.registry().register(
            conn.stream_mut(),
            id.token(),
            Interest::READABLE.add(Interest::WRITABLE),
        ) {
            warn!(peer = %peer, error = %e, "failed to register connection, dropping");
            return;
        }

        let inserted = self.registry.insert(conn);
        debug_assert_eq!(inserted, Some(id));
        debug!(id = ?id, peer = %peer, "accepted connection");
    }

    /// Route one readiness event to the connection's contract methods.
    ///
    /// Flags are evaluated in a fixed order and teardown short-circuits:
    /// readable first (so final bytes sent with a close are still delivered),
    /// then hangup, then writable. A connection torn down by an earlier step
    /// never sees a later one.
    fn dispatch(&mut self, event: &mio::event::Event) {
        let id = ConnId::from_token(event.token());

        // Stale event for a connection already removed this iteration.
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        if event.is_readable() && !conn.read_ready() {
            self.teardown(id, Close::Server);
            return;
        }

        if event.is_read_closed() {
            self.teardown(id, Close::Client);
            return;
        }

        if event.is_writable() {
            let Some(conn) = self.registry.get_mut(id) else {
                return;
            };
            if !conn.write_ready() {
                self.teardown(id, Close::Server);
            }
        }
    }

    /// Evict every connection whose heartbeat reports it dead.
    ///
    /// Two-phase so removal never invalidates the traversal: collect the
    /// failing handles first, then tear each down.
    fn sweep(&mut self) {
        let dead: Vec<ConnId> = self
            .registry
            .iter_mut()
            .filter_map(|(id, conn)| (!conn.heartbeat()).then_some(id))
            .collect();

        for id in dead {
            debug!(id = ?id, "evicting connection on failed heartbeat");
            self.teardown(id, Close::Server);
        }
    }

    /// Remove, deregister, and close a connection.
    ///
    /// Removal happens first, so no lifecycle method can ever run against a
    /// connection still visible in the registry; the close method consumes
    /// the connection and dropping it releases the descriptor.
    fn teardown(&mut self, id: ConnId, close: Close) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
            debug!(id = ?id, error = %e, "deregister failed");
        }
        match close {
            Close::Client => conn.client_close(),
            Close::Server => conn.server_close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::echo::EchoConn;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn reactor<C: Connection>(timeout: Duration) -> (Reactor<C>, Events) {
        let reactor = Reactor::new("127.0.0.1", 0, timeout, 32).unwrap();
        (reactor, Events::with_capacity(EVENTS_CAPACITY))
    }

    fn pump<C: Connection>(reactor: &mut Reactor<C>, events: &mut Events, turns: u32) {
        for _ in 0..turns {
            reactor
                .turn(events, Duration::from_millis(20))
                .expect("turn failed");
        }
    }

    #[test]
    fn test_setup_fails_on_bad_address() {
        let err = Reactor::<EchoConn>::new("not-an-ip", 0, Duration::from_secs(5), 32)
            .err()
            .expect("expected setup failure");
        assert_eq!(err.step, "parse listen address");
    }

    #[test]
    fn test_setup_fails_on_occupied_port() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Reactor::<EchoConn>::new("127.0.0.1", port, Duration::from_secs(5), 32)
            .err()
            .expect("expected setup failure");
        assert_eq!(err.step, "bind");
    }

    #[test]
    fn test_spurious_accept_wake_is_harmless() {
        let (mut reactor, _events) = reactor::<EchoConn>(Duration::from_secs(5));

        // Nothing pending: the accept loop hits WouldBlock immediately.
        reactor.accept_ready();
        assert_eq!(reactor.connection_count(), 0);
    }

    #[test]
    fn test_echoes_ping() {
        let (mut reactor, mut events) = reactor::<EchoConn>(Duration::from_secs(5));
        let addr = reactor.local_addr().unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        pump(&mut reactor, &mut events, 5);
        assert_eq!(reactor.connection_count(), 1);

        client.write_all(b"ping").unwrap();
        pump(&mut reactor, &mut events, 5);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(reactor.connection_count(), 1);
    }

    #[test]
    fn test_idle_connection_is_evicted() {
        let (mut reactor, mut events) = reactor::<EchoConn>(Duration::from_millis(500));
        let addr = reactor.local_addr().unwrap();

        let mut client = StdTcpStream::connect(addr).unwrap();
        pump(&mut reactor, &mut events, 5);
        assert_eq!(reactor.connection_count(), 1);

        // Stay idle past the timeout and past the sweep gate.
        thread::sleep(Duration::from_millis(1100));
        pump(&mut reactor, &mut events, 2);
        assert_eq!(reactor.connection_count(), 0);

        // Server-side close reaches the client as EOF.
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_disconnect_removes_only_that_connection() {
        let (mut reactor, mut events) = reactor::<EchoConn>(Duration::from_secs(5));
        let addr = reactor.local_addr().unwrap();

        let client_a = StdTcpStream::connect(addr).unwrap();
        let mut client_b = StdTcpStream::connect(addr).unwrap();
        pump(&mut reactor, &mut events, 5);
        assert_eq!(reactor.connection_count(), 2);

        drop(client_a);
        pump(&mut reactor, &mut events, 5);
        assert_eq!(reactor.connection_count(), 1);

        // B is still registered and still dispatched.
        client_b.write_all(b"still here").unwrap();
        pump(&mut reactor, &mut events, 5);

        client_b
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 32];
        let n = client_b.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"still here");
    }

    #[test]
    fn test_large_burst_is_fully_echoed() {
        let (mut reactor, mut events) = reactor::<EchoConn>(Duration::from_secs(5));
        let addr = reactor.local_addr().unwrap();

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        // The client writes more than the socket buffers hold, forcing the
        // echo side through its pending-write path, then reads everything
        // back.
        let handle = thread::spawn(move || {
            let mut client = StdTcpStream::connect(addr).unwrap();
            client.write_all(&payload).unwrap();
            let mut echoed = vec![0u8; payload.len()];
            client.read_exact(&mut echoed).unwrap();
            echoed
        });

        let deadline = Instant::now() + Duration::from_secs(10);
        while !handle.is_finished() {
            assert!(Instant::now() < deadline, "echo did not complete in time");
            pump(&mut reactor, &mut events, 1);
        }

        assert_eq!(handle.join().unwrap(), expected);
    }

    // Instrumented contract implementations for lifecycle accounting. Each
    // mock gets its own counters so parallel tests cannot interfere.

    static HANGUP_CLIENT_CLOSES: AtomicUsize = AtomicUsize::new(0);
    static HANGUP_SERVER_CLOSES: AtomicUsize = AtomicUsize::new(0);

    struct HangupProbe {
        stream: TcpStream,
    }

    impl Connection for HangupProbe {
        fn open(stream: TcpStream, _peer: SocketAddr, _timeout: Duration) -> Self {
            Self { stream }
        }

        fn stream_mut(&mut self) -> &mut TcpStream {
            &mut self.stream
        }

        fn read_ready(&mut self) -> bool {
            let mut buf = [0u8; 1024];
            loop {
                match self.stream.read(&mut buf) {
                    Ok(0) => return true,
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                    Err(_) => return false,
                }
            }
        }

        fn write_ready(&mut self) -> bool {
            true
        }

        fn heartbeat(&mut self) -> bool {
            true
        }

        fn client_close(self) {
            HANGUP_CLIENT_CLOSES.fetch_add(1, Ordering::SeqCst);
        }

        fn server_close(self) {
            HANGUP_SERVER_CLOSES.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_hangup_invokes_client_close_exactly_once() {
        let (mut reactor, mut events) = reactor::<HangupProbe>(Duration::from_secs(5));
        let addr = reactor.local_addr().unwrap();

        let client = StdTcpStream::connect(addr).unwrap();
        pump(&mut reactor, &mut events, 5);
        assert_eq!(reactor.connection_count(), 1);

        drop(client);
        pump(&mut reactor, &mut events, 5);

        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(HANGUP_CLIENT_CLOSES.load(Ordering::SeqCst), 1);
        assert_eq!(HANGUP_SERVER_CLOSES.load(Ordering::SeqCst), 0);

        // Nothing left to dispatch against; the counts stay put.
        pump(&mut reactor, &mut events, 3);
        assert_eq!(HANGUP_CLIENT_CLOSES.load(Ordering::SeqCst), 1);
    }

    static DEAD_HEARTBEATS: AtomicUsize = AtomicUsize::new(0);
    static DEAD_CLIENT_CLOSES: AtomicUsize = AtomicUsize::new(0);
    static DEAD_SERVER_CLOSES: AtomicUsize = AtomicUsize::new(0);

    struct DeadOnArrival {
        stream: TcpStream,
    }

    impl Connection for DeadOnArrival {
        fn open(stream: TcpStream, _peer: SocketAddr, _timeout: Duration) -> Self {
            Self { stream }
        }

        fn stream_mut(&mut self) -> &mut TcpStream {
            &mut self.stream
        }

        fn read_ready(&mut self) -> bool {
            let mut buf = [0u8; 1024];
            while matches!(self.stream.read(&mut buf), Ok(1..)) {}
            true
        }

        fn write_ready(&mut self) -> bool {
            true
        }

        fn heartbeat(&mut self) -> bool {
            DEAD_HEARTBEATS.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn client_close(self) {
            DEAD_CLIENT_CLOSES.fetch_add(1, Ordering::SeqCst);
        }

        fn server_close(self) {
            DEAD_SERVER_CLOSES.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_failed_heartbeat_invokes_server_close_exactly_once() {
        let (mut reactor, mut events) = reactor::<DeadOnArrival>(Duration::from_secs(5));
        let addr = reactor.local_addr().unwrap();

        let _client = StdTcpStream::connect(addr).unwrap();
        pump(&mut reactor, &mut events, 5);
        assert_eq!(reactor.connection_count(), 1);

        // Wait out the sweep gate; the first sweep evicts it.
        thread::sleep(Duration::from_millis(1100));
        pump(&mut reactor, &mut events, 2);

        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(DEAD_SERVER_CLOSES.load(Ordering::SeqCst), 1);
        assert_eq!(DEAD_CLIENT_CLOSES.load(Ordering::SeqCst), 0);

        let beats = DEAD_HEARTBEATS.load(Ordering::SeqCst);
        assert_eq!(beats, 1, "no heartbeat may run after removal");

        // Later sweeps find an empty registry; no dispatch after removal.
        thread::sleep(Duration::from_millis(1100));
        pump(&mut reactor, &mut events, 2);
        assert_eq!(DEAD_HEARTBEATS.load(Ordering::SeqCst), beats);
        assert_eq!(DEAD_SERVER_CLOSES.load(Ordering::SeqCst), 1);
    }
}
