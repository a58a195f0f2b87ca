//! The per-connection lifecycle contract driven by the reactor.
//!
//! The reactor owns the event loop and the registry; everything
//! protocol-specific lives behind this trait. Implementations own their
//! socket, their buffers, and their idle-time bookkeeping.

use mio::net::TcpStream;
use std::net::SocketAddr;
use std::time::Duration;

/// Lifecycle contract for one accepted TCP peer.
///
/// The reactor constructs an implementation at accept time, dispatches
/// readiness events to it, checks its liveness once per second, and finally
/// consumes it through exactly one of the two close methods. Dropping the
/// owned stream releases the descriptor, so close methods need no explicit
/// syscall.
pub trait Connection {
    /// Build a connection from a freshly accepted non-blocking stream.
    ///
    /// `timeout` is the idle duration after which `heartbeat` should report
    /// the connection dead.
    fn open(stream: TcpStream, peer: SocketAddr, timeout: Duration) -> Self
    where
        Self: Sized;

    /// Access the underlying stream so the reactor can register and
    /// deregister it with the poll instance.
    fn stream_mut(&mut self) -> &mut TcpStream;

    /// The socket has data to read.
    ///
    /// Events are edge-triggered: no further read notification arrives until
    /// the peer sends new data, so implementations MUST loop until the read
    /// would block. A drain that yields zero bytes is a spurious wake and
    /// returns `true`.
    ///
    /// Returns `false` on abnormal failure; the reactor then removes the
    /// connection and invokes `server_close`.
    fn read_ready(&mut self) -> bool;

    /// The socket became writable.
    ///
    /// Responsible for retrying any output buffered by an earlier partial
    /// write. Returns `false` on unrecoverable write failure.
    fn write_ready(&mut self) -> bool;

    /// Periodic liveness check, invoked roughly once per second.
    ///
    /// Returns `false` once the connection has been idle for at least its
    /// configured timeout; the reactor then evicts it via `server_close`.
    fn heartbeat(&mut self) -> bool;

    /// The peer closed the connection. Invoked exactly once, after removal
    /// from the registry.
    fn client_close(self);

    /// The server is terminating the connection (failure or timeout).
    /// Invoked exactly once, after removal from the registry.
    fn server_close(self);
}
