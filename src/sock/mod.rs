//! Socket I/O gateway: timed connect/read/write with per-operation
//! deadlines and out-of-band write-timeout enforcement.

pub mod timeout;

pub use timeout::{TimeoutGuard, TimeoutWheel};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::error::Transience;
use crate::spi::Codec;
use crate::stats::DiscoveryStats;
use crate::wire::frame::{self, FrameError, FrameReader, Receipt};
use crate::wire::{CodecError, Envelope, encode_frame};

/// Classified socket-layer failures. Classification happens here; retries
/// are the transport's business.
#[derive(Debug, Error)]
pub enum SockError {
    #[error("peer unreachable at {addr}: {source}")]
    Unreachable {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("socket {op} timed out")]
    Timeout { op: &'static str },
    #[error("connection closed by peer")]
    Closed,
    #[error("decode failed: {0}")]
    Decode(#[from] CodecError),
    #[error("protocol violation: {0}")]
    Protocol(FrameError),
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl SockError {
    pub fn transience(&self) -> Transience {
        match self {
            SockError::Unreachable { .. } | SockError::Timeout { .. } => Transience::Retryable,
            SockError::Closed | SockError::Io(_) => Transience::Unknown,
            SockError::Decode(_) | SockError::Protocol(_) => Transience::Permanent,
        }
    }

    fn classify(op: &'static str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                SockError::Timeout { op }
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => SockError::Closed,
            _ => SockError::Io(err),
        }
    }
}

impl From<FrameError> for SockError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(io) => SockError::classify("frame", io),
            other => SockError::Protocol(other),
        }
    }
}

/// Gateway shared by every worker of one node.
#[derive(Clone)]
pub struct SockIo {
    codec: Arc<dyn Codec>,
    wheel: TimeoutWheel,
    stats: Arc<DiscoveryStats>,
    sock_timeout: Duration,
    max_frame_bytes: usize,
}

impl SockIo {
    pub fn new(
        codec: Arc<dyn Codec>,
        wheel: TimeoutWheel,
        stats: Arc<DiscoveryStats>,
        sock_timeout: Duration,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            codec,
            wheel,
            stats,
            sock_timeout,
            max_frame_bytes,
        }
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.max_frame_bytes
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Timed connect completing the magic-header exchange before returning.
    ///
    /// The initiator writes its header first and expects the responder's
    /// header back within the socket timeout.
    pub fn open(&self, addr: SocketAddr) -> Result<TcpStream, SockError> {
        let sock = TcpStream::connect_timeout(&addr, self.sock_timeout)
            .map_err(|source| SockError::Unreachable { addr, source })?;
        sock.set_nodelay(true).map_err(SockError::Io)?;

        self.write_raw(&sock, &frame::MAGIC)?;
        self.read_peer_magic(&sock)?;
        Ok(sock)
    }

    /// Responder half of the handshake: read the initiator's header, answer
    /// with ours.
    pub fn accept_handshake(&self, sock: &TcpStream) -> Result<(), SockError> {
        self.read_peer_magic(sock)?;
        self.write_raw(sock, &frame::MAGIC)?;
        Ok(())
    }

    /// Encodes and writes one framed message under a write-timeout guard.
    pub fn write_message(&self, sock: &TcpStream, envelope: &Envelope) -> Result<(), SockError> {
        let body = self.codec.encode(envelope)?;
        let framed = encode_frame(&body, self.max_frame_bytes)?;
        self.write_raw(sock, &framed)?;
        self.stats.on_message_sent();
        Ok(())
    }

    /// Writes one raw receipt byte under a write-timeout guard.
    pub fn write_receipt(&self, sock: &TcpStream, receipt: Receipt) -> Result<(), SockError> {
        self.write_raw(sock, &[receipt.as_byte()])
    }

    /// Reads one receipt byte within `timeout`, saving and restoring the
    /// socket's native read timeout around the operation.
    pub fn read_receipt(&self, sock: &TcpStream, timeout: Duration) -> Result<Receipt, SockError> {
        let restore = sock.read_timeout().map_err(SockError::Io)?;
        sock.set_read_timeout(Some(timeout)).map_err(SockError::Io)?;

        let result = self.read_receipt_inner(sock);

        let _ = sock.set_read_timeout(restore);
        if matches!(result, Err(SockError::Timeout { .. })) {
            self.stats.on_ack_timeout();
        }
        result
    }

    fn read_receipt_inner(&self, mut sock: &TcpStream) -> Result<Receipt, SockError> {
        let mut buf = [0u8; 1];
        match sock.read(&mut buf) {
            Ok(0) => Err(SockError::Closed),
            Ok(_) => Receipt::from_byte(buf[0]).map_err(SockError::Protocol),
            Err(err) => Err(SockError::classify("receipt read", err)),
        }
    }

    /// Reads one framed message within `timeout`; `Ok(None)` on clean EOF.
    pub fn read_message(
        &self,
        sock: &TcpStream,
        timeout: Duration,
    ) -> Result<Option<Envelope>, SockError> {
        let restore = sock.read_timeout().map_err(SockError::Io)?;
        sock.set_read_timeout(Some(timeout)).map_err(SockError::Io)?;

        let result = self.read_message_inner(sock);

        let _ = sock.set_read_timeout(restore);
        result
    }

    fn read_message_inner(&self, sock: &TcpStream) -> Result<Option<Envelope>, SockError> {
        let mut reader = FrameReader::new(sock, self.max_frame_bytes);
        let Some(body) = reader.read_next()? else {
            return Ok(None);
        };
        let envelope = self.codec.decode(&body)?;
        self.stats.on_message_received();
        Ok(Some(envelope))
    }

    fn read_peer_magic(&self, sock: &TcpStream) -> Result<(), SockError> {
        let restore = sock.read_timeout().map_err(SockError::Io)?;
        sock.set_read_timeout(Some(self.sock_timeout))
            .map_err(SockError::Io)?;

        let mut reader = sock;
        let result = frame::read_magic(&mut reader).map_err(SockError::from);

        let _ = sock.set_read_timeout(restore);
        result
    }

    fn write_raw(&self, mut sock: &TcpStream, data: &[u8]) -> Result<(), SockError> {
        let guard = self.wheel.register(sock, self.sock_timeout);

        let outcome = sock
            .write_all(data)
            .and_then(|()| sock.flush())
            .map_err(|err| SockError::classify("write", err));

        let cancelled = guard.cancel();
        outcome?;
        if !cancelled {
            // The wheel fired mid-write and force-closed the socket.
            return Err(SockError::Timeout { op: "write" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeId;
    use crate::wire::{CborCodec, Message, Ping};
    use std::net::TcpListener;
    use std::thread;

    fn gateway(sock_timeout: Duration) -> SockIo {
        let stats = Arc::new(DiscoveryStats::new());
        SockIo::new(
            Arc::new(CborCodec),
            TimeoutWheel::start(Arc::clone(&stats)),
            stats,
            sock_timeout,
            1 << 20,
        )
    }

    fn ping_envelope() -> Envelope {
        Envelope::new(
            NodeId::random(),
            Message::Ping(Ping {
                target: NodeId::random(),
            }),
        )
    }

    #[test]
    fn open_completes_magic_handshake_and_messages_flow() {
        let io = gateway(Duration::from_millis(500));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_io = io.clone();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            server_io.accept_handshake(&sock).unwrap();
            let env = server_io
                .read_message(&sock, Duration::from_millis(500))
                .unwrap()
                .unwrap();
            server_io.write_receipt(&sock, Receipt::Ok).unwrap();
            env
        });

        let sock = io.open(addr).unwrap();
        let sent = ping_envelope();
        io.write_message(&sock, &sent).unwrap();
        let receipt = io.read_receipt(&sock, Duration::from_millis(500)).unwrap();
        assert_eq!(receipt, Receipt::Ok);

        let received = server.join().unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn connect_refused_is_unreachable() {
        let io = gateway(Duration::from_millis(200));
        // Bind then drop to get a port that refuses connections.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let err = io.open(addr).unwrap_err();
        assert!(matches!(err, SockError::Unreachable { .. }));
        assert!(err.transience().is_retryable());
    }

    #[test]
    fn receipt_read_times_out_when_peer_is_silent() {
        let io = gateway(Duration::from_millis(500));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_io = io.clone();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            server_io.accept_handshake(&sock).unwrap();
            thread::sleep(Duration::from_millis(300));
            drop(sock);
        });

        let sock = io.open(addr).unwrap();
        let err = io
            .read_receipt(&sock, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, SockError::Timeout { .. }));
        server.join().unwrap();
    }

    #[test]
    fn peer_eof_reads_as_none() {
        let io = gateway(Duration::from_millis(500));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server_io = io.clone();
        let server = thread::spawn(move || {
            let (sock, _) = listener.accept().unwrap();
            server_io.accept_handshake(&sock).unwrap();
            drop(sock);
        });

        let sock = io.open(addr).unwrap();
        server.join().unwrap();
        let got = io.read_message(&sock, Duration::from_millis(500)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn bad_magic_drops_the_connection() {
        let io = gateway(Duration::from_millis(500));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"BAD!").unwrap();
        });

        let err = io.open(addr).unwrap_err();
        assert!(matches!(err, SockError::Protocol(_)));
        server.join().unwrap();
    }
}
