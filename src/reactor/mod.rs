//! The reactor core: event loop, connection registry, and the lifecycle
//! contract.
//!
//! One thread, one poll instance, one owning registry. The event loop
//! translates OS readiness events into contract calls and is the single
//! authority over when a connection is created and destroyed.

mod connection;
mod event_loop;
mod registry;

pub use connection::Connection;
pub use event_loop::{Reactor, SetupError};
pub use registry::{ConnId, Registry};
