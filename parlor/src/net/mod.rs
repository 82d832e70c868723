//! Socket-facing modules: the framing codec, the connection table and the
//! event loop that drives them.

pub mod codec;
pub mod registry;
pub mod server;
