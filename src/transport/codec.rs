use std::io::{self, Read, Write};

use bincode::{
    config::{BigEndian, Configuration, Fixint, Limit},
    error::DecodeError,
};

use super::{Frame, TransportError};

/// Largest encoded message accepted from a peer.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Width of the frame-count and frame-length prefixes under fixed-int encoding.
const LEN_PREFIX: usize = std::mem::size_of::<u64>();

type WireConfig = Configuration<BigEndian, Fixint, Limit<MAX_MESSAGE_SIZE>>;

/// Encodes and decodes whole multi-frame messages.
#[derive(Clone, Copy)]
pub struct FrameCodec {
    config: WireConfig,
}

impl Default for FrameCodec {
    fn default() -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<MAX_MESSAGE_SIZE>();
        Self { config }
    }
}

impl FrameCodec {
    /// Appends the encoded message to `out`.
    pub fn encode(&self, message: &[Frame], out: &mut Vec<u8>) -> Result<(), TransportError> {
        bincode::encode_into_std_write(message, out, self.config)?;
        Ok(())
    }

    /// Decodes the first message in `buf`. Returns the message and the number of bytes it used,
    /// or `None` when `buf` does not yet hold a complete message.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Vec<Frame>, usize)>, TransportError> {
        let Some(len) = self.message_len(buf)? else {
            return Ok(None);
        };
        if buf.len() < len {
            return Ok(None);
        }
        let (message, used) =
            bincode::decode_from_slice::<Vec<Frame>, _>(&buf[..len], self.config)?;
        Ok(Some((message, used)))
    }

    /// Total encoded size of the first message in `buf`, read from its length prefixes alone.
    /// Returns `None` while the prefixes themselves are incomplete. Payload bytes are never
    /// touched, so this stays cheap on a partially received message.
    pub fn message_len(&self, buf: &[u8]) -> Result<Option<usize>, TransportError> {
        let Some(frames) = read_prefix(buf, 0) else {
            return Ok(None);
        };
        let mut end = LEN_PREFIX;
        for _ in 0..frames {
            let Some(len) = read_prefix(buf, end) else {
                return Ok(None);
            };
            end = usize::try_from(len)
                .ok()
                .and_then(|len| (end + LEN_PREFIX).checked_add(len))
                .filter(|&end| end <= MAX_MESSAGE_SIZE)
                .ok_or(DecodeError::LimitExceeded)?;
        }
        Ok(Some(end))
    }
}

fn read_prefix(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at + LEN_PREFIX)?;
    Some(u64::from_be_bytes(bytes.try_into().ok()?))
}

/// Buffered message stream over any byte stream.
///
/// Works with both blocking and non-blocking streams: `WouldBlock` and `TimedOut` are treated as
/// "nothing more right now" instead of errors.
pub struct FramedStream<T: Read + Write> {
    stream: T,
    codec: FrameCodec,
    inbound: Vec<u8>,
    /// Inbound length below which no complete message can be buffered.
    wanted: usize,
    outbound: Vec<u8>,
}

impl<T: Read + Write> FramedStream<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            codec: FrameCodec::default(),
            inbound: Vec::new(),
            wanted: 0,
            outbound: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    /// Queues `message` and flushes as much of the outbound buffer as the stream takes.
    pub fn write_message(&mut self, message: &[Frame]) -> Result<(), TransportError> {
        self.codec.encode(message, &mut self.outbound)?;
        self.flush()
    }

    /// Writes buffered bytes until the buffer is empty or the stream would block.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient(&e) => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush().or_else(|e| {
            if is_transient(&e) {
                Ok(())
            } else {
                Err(TransportError::Io(e))
            }
        })
    }

    /// Returns true while encoded bytes are still waiting to be written.
    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Returns the next complete message, reading at most once from the stream.
    pub fn read_message(&mut self) -> Result<Option<Vec<Frame>>, TransportError> {
        if let Some(message) = self.take_message()? {
            return Ok(Some(message));
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(TransportError::Closed),
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_transient(&e) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }

        self.take_message()
    }

    fn take_message(&mut self) -> Result<Option<Vec<Frame>>, TransportError> {
        if self.inbound.len() < self.wanted {
            return Ok(None);
        }
        match self.codec.decode(&self.inbound)? {
            Some((message, used)) => {
                self.inbound.drain(..used);
                self.wanted = 0;
                Ok(Some(message))
            }
            None => {
                // Nothing to retry until the rest of the message, or at least one more byte of
                // its prefixes, has arrived.
                self.wanted = match self.codec.message_len(&self.inbound)? {
                    Some(len) => len,
                    None => self.inbound.len() + 1,
                };
                Ok(None)
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
