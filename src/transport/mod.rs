//! # Transport Abstraction
//!
//! The broker link is modeled as a reliable, framed, bidirectional packet
//! pipe. Everything above this seam (handshake, sessions, flow control,
//! acknowledgements) works in whole [`Packet`] values; the byte-level
//! wire codec is not this crate's concern and the bundled implementations
//! frame packets with a length-prefixed bincode encoding purely as a
//! stand-in.
//!
//! ## Threading contract
//!
//! - `send` may be called from any thread; implementations serialize
//!   writers internally.
//! - `recv` is called only by the connection's read-channel thread.
//! - `shutdown` may be called from any thread and must unblock a pending
//!   `recv`; it is idempotent.
//!
//! ## Implementations
//!
//! - [`TcpTransport`]: a socket2-tuned TCP stream.
//! - [`LoopbackTransport`]: an in-process pipe pair used by the test
//!   suite's scripted broker.
//!
//! An SSL transport plugs in through the same trait; it is not bundled.

use crate::config::{ConnectionConfig, TransportKind};
use crate::error::{MqError, MqResult};
use crate::packet::Packet;

pub mod loopback;
pub mod tcp;

pub use loopback::LoopbackTransport;
pub use tcp::TcpTransport;

/// A reliable framed packet pipe to the broker.
pub trait Transport: Send + Sync {
    /// Writes one packet. Callable from any thread.
    fn send(&self, packet: &Packet) -> MqResult<()>;

    /// Blocks until the next inbound packet arrives or the pipe dies.
    /// Called only from the read-channel thread.
    fn recv(&self) -> MqResult<Packet>;

    /// Tears the pipe down, waking a blocked `recv`. Idempotent.
    fn shutdown(&self) -> MqResult<()>;
}

/// Opens the transport selected by `config`.
pub fn connect(config: &ConnectionConfig) -> MqResult<Box<dyn Transport>> {
    match config.transport {
        TransportKind::Tcp => Ok(Box::new(TcpTransport::connect(&config.host, config.port)?)),
        TransportKind::Ssl => Err(MqError::ConnectionUnsupportedTransport),
    }
}
