//! TCP implementation of the [`Transport`] pipe.
//!
//! Frames are a 4-byte little-endian length prefix followed by the
//! bincode-encoded packet. Oversized frames are rejected before
//! allocation so a corrupt peer cannot force a huge buffer.

use super::Transport;
use crate::error::{MqError, MqResult};
use crate::packet::Packet;
use parking_lot::Mutex;
use socket2::SockRef;
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Upper bound on a single framed packet.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// TCP packet pipe.
///
/// Reader and writer halves are guarded independently: the read-channel
/// thread owns the reader lock for the life of a `recv`, while senders
/// contend only for the writer.
pub struct TcpTransport {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<BufWriter<TcpStream>>,
    stream: TcpStream,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Connects to `host:port` and applies low-latency socket options.
    pub fn connect(host: &str, port: u16) -> MqResult<Self> {
        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .map_err(|_| MqError::CouldNotConnectToBroker)?
            .collect();
        let stream = addrs
            .iter()
            .find_map(|addr| TcpStream::connect(addr).ok())
            .ok_or(MqError::SocketConnectFailed)?;
        debug!("connected to broker at {}:{}", host, port);
        Self::from_stream(stream)
    }

    /// Wraps an already-connected stream. Exposed so acceptors (tests,
    /// embedded brokers) can reuse the framing.
    pub fn from_stream(stream: TcpStream) -> MqResult<Self> {
        let sock = SockRef::from(&stream);
        sock.set_nodelay(true).map_err(|_| MqError::SocketError)?;
        sock.set_keepalive(true).map_err(|_| MqError::SocketError)?;

        let read_half = stream.try_clone().map_err(|_| MqError::SocketError)?;
        let write_half = stream.try_clone().map_err(|_| MqError::SocketError)?;
        Ok(Self {
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(BufWriter::new(write_half)),
            stream,
            closed: AtomicBool::new(false),
        })
    }
}

impl Transport for TcpTransport {
    fn send(&self, packet: &Packet) -> MqResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MqError::BrokerConnectionClosed);
        }
        let bytes = packet.to_bytes()?;
        let len = bytes.len() as u32;

        let mut writer = self.writer.lock();
        writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| writer.write_all(&bytes))
            .and_then(|_| writer.flush())
            .map_err(|_| MqError::SocketWriteFailed)
    }

    fn recv(&self) -> MqResult<Packet> {
        let mut reader = self.reader.lock();

        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes).map_err(|e| {
            if self.closed.load(Ordering::Acquire)
                || e.kind() == std::io::ErrorKind::UnexpectedEof
            {
                MqError::TcpConnectionClosed
            } else {
                MqError::SocketReadFailed
            }
        })?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(MqError::InvalidPacket);
        }

        let mut bytes = vec![0u8; len];
        reader
            .read_exact(&mut bytes)
            .map_err(|_| MqError::SocketReadFailed)?;
        Packet::from_bytes(&bytes)
    }

    fn shutdown(&self) -> MqResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // A peer-initiated close beat us to it; nothing left to do.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(_) => Err(MqError::SocketShutdownFailed),
        }
    }
}
