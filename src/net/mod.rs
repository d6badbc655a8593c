//! Networking: packet codec, connection facade, endpoints and the server loop.

pub mod conn;
pub mod endpoint;
pub mod handler;
pub mod packet;

pub use conn::Connection;
pub use endpoint::Endpoint;
pub use handler::{NetHandler, StopHandle};
pub use packet::{Packet, PacketType};
