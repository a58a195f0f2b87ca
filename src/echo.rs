//! Echo connection: the demo implementation of the reactor's contract.
//!
//! Everything read is written straight back. Output that cannot be sent
//! without blocking is parked in a pending buffer and flushed when the socket
//! reports writable again, so partial writes survive heavy traffic.

use crate::reactor::Connection;
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 4096;

/// One echo peer.
pub struct EchoConn {
    stream: TcpStream,
    peer: SocketAddr,
    timeout: Duration,
    /// Updated on every successful read or write; heartbeat compares
    /// against it.
    last_active: Instant,
    /// Output accepted but not yet written to the socket.
    pending: BytesMut,
}

impl EchoConn {
    /// Queue data for the peer and push as much as the socket takes.
    fn send(&mut self, data: &[u8]) -> bool {
        self.pending.extend_from_slice(data);
        self.flush()
    }

    /// Write pending output until done or the socket would block.
    ///
    /// Whatever remains is retried on the next writable edge.
    fn flush(&mut self) -> bool {
        while !self.pending.is_empty() {
            match self.stream.write(&self.pending) {
                Ok(0) => {
                    warn!(peer = %self.peer, "write returned zero");
                    return false;
                }
                Ok(n) => {
                    self.pending.advance(n);
                    self.last_active = Instant::now();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "write failed");
                    return false;
                }
            }
        }
        true
    }
}

impl Connection for EchoConn {
    fn open(stream: TcpStream, peer: SocketAddr, timeout: Duration) -> Self {
        Self {
            stream,
            peer,
            timeout,
            last_active: Instant::now(),
            pending: BytesMut::new(),
        }
    }

    fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    fn read_ready(&mut self) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        let mut data = BytesMut::new();

        // Drain everything available; no further read event arrives until
        // the peer sends more.
        loop {
            match self.stream.read(&mut chunk) {
                // Peer sent FIN; the hangup event drives teardown.
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "read failed");
                    return false;
                }
            }
        }

        // Readable with nothing to read: usually the peer closing.
        if data.is_empty() {
            return true;
        }

        self.last_active = Instant::now();
        debug!(
            peer = %self.peer,
            bytes = data.len(),
            msg = %String::from_utf8_lossy(&data),
            "client said"
        );

        self.send(&data)
    }

    fn write_ready(&mut self) -> bool {
        self.flush()
    }

    fn heartbeat(&mut self) -> bool {
        if self.last_active.elapsed() >= self.timeout {
            info!(peer = %self.peer, "connection timed out");
            return false;
        }
        true
    }

    fn client_close(self) {
        info!(peer = %self.peer, "connection closed by client");
        // Dropping the stream releases the descriptor.
    }

    fn server_close(self) {
        info!(peer = %self.peer, "connection closed by server");
    }
}
