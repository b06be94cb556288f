//! Peer sessions
//!
//! A peer session is one short-lived TCP connection to one backend: it is
//! opened for a single request, reads exactly one reply frame and is
//! dropped. Every phase runs under its own deadline (connect, send, read);
//! an expired deadline is reported as a transport failure just like a reset.

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tfsproxy_common::config::TimeoutConfig;
use tfsproxy_common::{Error, Result, ServerAddr};
use tfsproxy_proto::codec::{Decoded, Frame, HEADER_SIZE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Backend role a session talks to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    RootServer,
    RcServer,
    NameServer,
    MetaServer,
    DataServer,
}

impl PeerRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RootServer => "root server",
            Self::RcServer => "rc server",
            Self::NameServer => "name server",
            Self::MetaServer => "meta server",
            Self::DataServer => "data server",
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/reply exchange with a backend.
///
/// The engine only talks to the cluster through this trait so tests can
/// script backend behaviour.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one encoded packet to `addr` and wait for its reply
    async fn call(&self, role: PeerRole, addr: ServerAddr, packet: Bytes) -> Result<Frame>;
}

/// One connection to one backend
pub struct PeerSession {
    role: PeerRole,
    addr: ServerAddr,
    stream: TcpStream,
    buf: BytesMut,
    timeouts: TimeoutConfig,
}

impl PeerSession {
    /// Open a connection within the connect deadline
    pub async fn connect(role: PeerRole, addr: ServerAddr, timeouts: &TimeoutConfig) -> Result<Self> {
        let stream = timeout(timeouts.connect(), TcpStream::connect(addr.socket_addr()))
            .await
            .map_err(|_| Error::Timeout(format!("connect to {role} {addr}")))?
            .map_err(|e| Error::ConnectionFailed(format!("{role} {addr}: {e}")))?;
        stream.set_nodelay(true)?;
        trace!("connected to {} {}", role, addr);
        Ok(Self {
            role,
            addr,
            stream,
            buf: BytesMut::with_capacity(HEADER_SIZE),
            timeouts: timeouts.clone(),
        })
    }

    pub async fn send(&mut self, packet: &[u8]) -> Result<()> {
        timeout(self.timeouts.send(), self.stream.write_all(packet))
            .await
            .map_err(|_| Error::Timeout(format!("send to {} {}", self.role, self.addr)))?
            .map_err(|e| self.io_error(&e))
    }

    /// Read one reply frame. The header is read first; its length sizes
    /// the rest of the read.
    pub async fn recv(&mut self) -> Result<Frame> {
        loop {
            match Frame::decode(&mut self.buf)? {
                Decoded::Complete(frame) => {
                    debug!(
                        "{} {} replied {:?} with {} bytes",
                        self.role,
                        self.addr,
                        frame.msg_type(),
                        frame.body.len()
                    );
                    return Ok(frame);
                }
                Decoded::NeedMore(n) => {
                    self.buf.reserve(n);
                    let read = timeout(self.timeouts.read(), self.stream.read_buf(&mut self.buf))
                        .await
                        .map_err(|_| {
                            Error::Timeout(format!("read from {} {}", self.role, self.addr))
                        })?
                        .map_err(|e| self.io_error(&e))?;
                    if read == 0 {
                        return Err(Error::ConnectionReset(format!(
                            "{} {} closed the connection",
                            self.role, self.addr
                        )));
                    }
                }
            }
        }
    }

    fn io_error(&self, e: &std::io::Error) -> Error {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => Error::Timeout(format!("{} {}: {e}", self.role, self.addr)),
            ErrorKind::ConnectionRefused => {
                Error::ConnectionFailed(format!("{} {}: {e}", self.role, self.addr))
            }
            _ => Error::ConnectionReset(format!("{} {}: {e}", self.role, self.addr)),
        }
    }
}

/// Transport opening a fresh [`PeerSession`] per call
#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    timeouts: TimeoutConfig,
}

impl TcpTransport {
    #[must_use]
    pub const fn new(timeouts: TimeoutConfig) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, role: PeerRole, addr: ServerAddr, packet: Bytes) -> Result<Frame> {
        let mut session = PeerSession::connect(role, addr, &self.timeouts).await?;
        session.send(&packet).await?;
        session.recv().await
    }
}
