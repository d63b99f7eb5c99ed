//! Wire-level support for tunneling a remote-desktop protocol through
//! message-oriented transport: a stateful instruction framer that
//! reassembles length-prefixed instructions from arbitrary fragments, and
//! the connect handshake that runs before raw relay begins.
//!
//! Kept in a dedicated crate so the relay only depends on the decoded
//! instruction surface, not on framing internals.

pub mod framer;
pub mod handshake;

pub use framer::{Framer, FramingError, Instruction, MAX_BUFFER};
pub use handshake::{Tunnel, TunnelEvent};
