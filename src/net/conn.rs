//! Blocking TCP connection with packet framing.
//!
//! `Connection` is a cheap-to-clone handle (the stream lives behind an `Arc`),
//! so the receive loop and the dispatcher can hold the same socket without
//! lifetime entanglement. The connected flag flips to `false` on the first
//! send or receive failure; callers treat that as end-of-session.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::net::packet::{HEADER_LEN, MAX_PAYLOAD_LEN, Packet, PacketType};

/// Default per-socket timeout, used for connects and the registration
/// handshake. Steady-state receive loops block without a timeout and rely on
/// peer disconnect or socket shutdown.
pub const SOCKET_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone)]
pub struct Connection {
    stream: Arc<TcpStream>,
    connected: Arc<AtomicBool>,
}

impl Connection {
    /// Dial a peer.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, SOCKET_TIMEOUT).map_err(|e| {
            Error::with_message(
                ErrorKind::NetConnectionTimeout,
                format!("Failed to connect to ({addr}): {e}"),
            )
        })?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream: Arc::new(stream),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(|e| Error::with_message(ErrorKind::NetSocketError, e.to_string()))
    }

    /// Shut the socket down in both directions and mark the session over.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.connected.store(false, Ordering::Relaxed);
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Write a packet: header bytes exactly, then the payload exactly.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        let mut stream = &*self.stream;
        let written = stream.write_all(&packet.header_bytes()).and_then(|_| {
            if packet.data_len() > 0 {
                stream.write_all(packet.payload())
            } else {
                Ok(())
            }
        });
        written.map_err(|e| {
            self.mark_disconnected();
            Error::with_message(ErrorKind::NetWriteFailure, e.to_string())
        })
    }

    /// Read one packet: exactly `HEADER_LEN` bytes, then exactly `data_len`
    /// payload bytes. Any short read, I/O error or nonsense header ends the
    /// session with `NetBadPacket`.
    pub fn receive(&self) -> Result<Packet> {
        let mut stream = &*self.stream;

        let mut header = [0u8; HEADER_LEN];
        if let Err(e) = stream.read_exact(&mut header) {
            self.mark_disconnected();
            return Err(Error::with_message(ErrorKind::NetBadPacket, e.to_string()));
        }

        let Some(ty) = PacketType::from_code(header[0]) else {
            self.mark_disconnected();
            return Err(Error::with_message(
                ErrorKind::NetBadPacket,
                format!("unknown packet type {}", header[0]),
            ));
        };

        let data_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if data_len > MAX_PAYLOAD_LEN {
            self.mark_disconnected();
            return Err(Error::with_message(
                ErrorKind::NetBadPacket,
                format!("oversized payload ({data_len} bytes)"),
            ));
        }

        let mut payload = vec![0u8; data_len];
        if data_len > 0
            && let Err(e) = stream.read_exact(&mut payload)
        {
            self.mark_disconnected();
            return Err(Error::with_message(ErrorKind::NetBadPacket, e.to_string()));
        }

        Ok(Packet::with_bytes(ty, payload))
    }
}
