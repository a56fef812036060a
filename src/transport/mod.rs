//! Message-oriented transport sockets.
//!
//! The connection manager never touches a wire directly. Everything it needs from the network is
//! expressed by two small traits defined here:
//!
//! - [`Context`]: a factory, optionally shared by the whole process, that opens connect-mode
//!   sockets to a string endpoint.
//! - [`Socket`]: one connected socket. Sends and receives whole messages, where a message is an
//!   ordered sequence of opaque binary [`Frame`]s. Neither direction ever blocks the caller.
//!
//! # Binary Format
//!
//! The bundled [`TcpContext`] writes every message as a single `bincode` value:
//!
//! - The number of frames as a big-endian `u64`.
//! - For every frame, its length as a big-endian `u64` followed by the raw bytes.
//!
//! Partial reads are buffered until a complete message can be decoded, so a socket can be polled
//! from an event loop without ever stalling on a half-received message.
//!
//! # Envelopes
//!
//! Requests travel with a routing envelope in front of the payload, the same convention used by
//! router/dealer sockets: one or more routing frames, then an empty delimiter frame, then the
//! payload. A peer must send the envelope back untouched in front of its reply.
//!
//! # See Also
//!
//! - [`manager`](crate::manager): Owns the sockets produced by a [`Context`].
//! - [`server`](crate::server): A reply server speaking the same framing.
mod codec;
mod tcp;

use std::io;

use thiserror::Error;

pub use codec::{FrameCodec, FramedStream, MAX_MESSAGE_SIZE};
pub use tcp::{TcpContext, TcpSocket, parse_endpoint};

/// A single opaque part of a message.
pub type Frame = Vec<u8>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
}

/// Produces connected sockets. A single context may be shared by several managers.
pub trait Context: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Socket>, TransportError>;
}

/// A connected, message-oriented socket owned by exactly one thread at a time.
pub trait Socket: Send {
    /// Queues a message for sending and pushes out as much as the socket accepts right now.
    fn send(&mut self, message: &[Frame]) -> Result<(), TransportError>;

    /// Returns the next fully received message, or `None` if nothing complete has arrived yet.
    fn poll_recv(&mut self) -> Result<Option<Vec<Frame>>, TransportError>;

    /// Endpoint this socket is connected to.
    fn endpoint(&self) -> &str;
}

/// Splits a message at its first empty frame. Returns the envelope (delimiter included) and the
/// payload, or `None` if the message has no delimiter.
pub fn split_envelope(mut message: Vec<Frame>) -> Option<(Vec<Frame>, Vec<Frame>)> {
    let delimiter = message.iter().position(|frame| frame.is_empty())?;
    let payload = message.split_off(delimiter + 1);
    Some((message, payload))
}
