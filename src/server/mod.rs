//! A reply server for the framed message transport.
//!
//! Accepts TCP connections, reads enveloped requests, and answers each through a handler. Used by
//! the `rpcmux_echo` binary and by tests as the remote side of a [`Connection`](crate::Connection).
//!
//! # Overview
//!
//! - Each accepted connection is served by one thread of a fixed [`ThreadPool`]; requests on a
//!   connection are answered in order.
//! - The routing envelope in front of every request is copied back in front of the reply.
//! - A handler returning `None` leaves the request unanswered.
//! - Everything winds down when the server's [`ShutdownToken`] (or the process-wide one) fires.
mod pool;

use std::{
    io,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    shutdown::ShutdownToken,
    transport::{Frame, FramedStream, TransportError, split_envelope},
};

pub use pool::ThreadPool;

/// How often idle loops look at the shutdown token.
const IDLE_TICK: Duration = Duration::from_millis(20);

pub type Handler = Arc<dyn Fn(Vec<Frame>) -> Option<Vec<Frame>> + Send + Sync>;

pub struct Server {
    listener: TcpListener,
    pool: ThreadPool,
    handler: Handler,
}

impl Server {
    pub fn bind<A, F>(address: A, pool_size: usize, handler: F) -> Result<Self, TransportError>
    where
        A: ToSocketAddrs,
        F: Fn(Vec<Frame>) -> Option<Vec<Frame>> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            pool: ThreadPool::new(pool_size.max(1))?,
            handler: Arc::new(handler),
        })
    }

    /// A server that replies with the request payload unchanged.
    pub fn echo<A: ToSocketAddrs>(address: A, pool_size: usize) -> Result<Self, TransportError> {
        Self::bind(address, pool_size, Some)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The `tcp://` endpoint clients use to reach this server.
    pub fn endpoint(&self) -> io::Result<String> {
        Ok(format!("tcp://{}", self.local_addr()?))
    }

    /// Accepts and serves connections until `token` fires. Returns once every connection has
    /// been closed.
    pub fn serve(self, token: ShutdownToken) -> Result<(), TransportError> {
        info!("listening at {}", self.local_addr()?);

        while !token.should_stop() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {peer}");
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(IDLE_TICK))?;

                    let handler = Arc::clone(&self.handler);
                    let token = token.clone();
                    self.pool.execute(move || {
                        if let Err(e) = handle_connection(stream, handler, token) {
                            warn!("connection from {peer} failed: {e}");
                        }
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(IDLE_TICK),
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("server shutting down");
        Ok(())
    }

    /// Serves on a background thread until the returned handle is stopped or dropped.
    pub fn spawn(self) -> Result<ServerHandle, TransportError> {
        let endpoint = self.endpoint()?;
        let token = ShutdownToken::new();
        let serve_token = token.clone();
        let thread = thread::Builder::new()
            .name("rpcmux-server".to_string())
            .spawn(move || {
                if let Err(e) = self.serve(serve_token) {
                    warn!("server stopped with error: {e}");
                }
            })?;

        Ok(ServerHandle {
            endpoint,
            token,
            thread: Some(thread),
        })
    }
}

/// Owns a server running on a background thread.
pub struct ServerHandle {
    endpoint: String,
    token: ShutdownToken,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stops accepting, closes every connection and waits for the server thread.
    pub fn stop(&mut self) {
        self.token.trigger();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(
    stream: TcpStream,
    handler: Handler,
    token: ShutdownToken,
) -> Result<(), TransportError> {
    let mut transport = FramedStream::new(stream);

    while !token.should_stop() {
        let message = match transport.read_message() {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(TransportError::Closed) => {
                debug!("peer closed connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some((mut envelope, payload)) = split_envelope(message) else {
            warn!("dropping request without a routing envelope");
            continue;
        };
        if let Some(reply) = handler(payload) {
            envelope.extend(reply);
            transport.write_message(&envelope)?;
        }
    }
    Ok(())
}
