//! An accepted peer: node id plus a cloneable send handle.

use crate::error::Result;
use crate::net::conn::Connection;
use crate::net::packet::Packet;

/// A registered peer of the root complex.
///
/// The id is whatever the peer declared in its `Ready` packet and is the
/// identity used for group membership. Clones share the underlying socket;
/// the socket closes when the last clone drops.
#[derive(Debug, Clone)]
pub struct Endpoint {
    id: u8,
    conn: Connection,
}

impl Endpoint {
    pub fn new(id: u8, conn: Connection) -> Self {
        Self { id, conn }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    pub fn send(&self, packet: Packet) -> Result<()> {
        self.conn.send(&packet)
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Endpoint {}
