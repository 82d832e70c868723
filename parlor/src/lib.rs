//! parlor is a multi-user chat server speaking a length-prefixed text
//! protocol over long-lived TCP connections.
//!
//! One event-loop thread multiplexes all sockets; decoded messages are
//! dispatched on a small worker pool. Accounts live in a MySQL credential
//! store, named group conversations persist across restarts as a JSON
//! snapshot, and operators can register extra commands from a Lua script.

pub mod auth;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod groups;
pub mod net;
pub mod pool;
pub mod script;
pub mod snapshot;
pub mod store;

/// TCP port the server listens on.
pub const LISTEN_PORT: u16 = 5008;

/// Stable, opaque handle for a live connection. Issued by the connection
/// table and never reused within a process lifetime.
pub type ClientId = u64;
