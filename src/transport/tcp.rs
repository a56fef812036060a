use std::{
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, trace};

use super::{Context, Frame, FramedStream, Socket, TransportError};

const TCP_SCHEME: &str = "tcp://";

/// Resolves a `tcp://host:port` endpoint into socket addresses.
pub fn parse_endpoint(endpoint: &str) -> Result<Vec<SocketAddr>, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let address = endpoint
        .strip_prefix(TCP_SCHEME)
        .ok_or_else(|| invalid("expected a 'tcp://host:port' address"))?;
    if address.is_empty() {
        return Err(invalid("missing host and port"));
    }

    let addrs = address
        .to_socket_addrs()
        .map_err(|e| invalid(&e.to_string()))?
        .collect::<Vec<_>>();
    if addrs.is_empty() {
        return Err(invalid("address did not resolve"));
    }
    Ok(addrs)
}

/// Opens non-blocking TCP sockets speaking the framed message format.
#[derive(Debug, Clone)]
pub struct TcpContext {
    connect_timeout: Duration,
}

impl TcpContext {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpContext {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl Context for TcpContext {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Socket>, TransportError> {
        let socket = TcpSocket::connect(endpoint, self.connect_timeout)?;
        Ok(Box::new(socket))
    }
}

pub struct TcpSocket {
    endpoint: String,
    stream: FramedStream<TcpStream>,
}

impl TcpSocket {
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self, TransportError> {
        let mut last_err = None;

        for addr in parse_endpoint(endpoint)? {
            trace!("connecting to {addr} for {endpoint}");
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    debug!("connected to {endpoint} via {addr}");
                    return Ok(Self {
                        endpoint: endpoint.to_string(),
                        stream: FramedStream::new(stream),
                    });
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.map_or(TransportError::Closed, TransportError::Io))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.stream.get_ref().local_addr().ok()
    }
}

impl Socket for TcpSocket {
    fn send(&mut self, message: &[Frame]) -> Result<(), TransportError> {
        self.stream.write_message(message)
    }

    fn poll_recv(&mut self) -> Result<Option<Vec<Frame>>, TransportError> {
        if self.stream.has_pending_writes() {
            self.stream.flush()?;
        }
        self.stream.read_message()
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
