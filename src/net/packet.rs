//! Wire codec: fixed 5-byte header plus a variable payload.
//!
//! Framing: `[type: u8][data_len: u32 LE][payload; data_len bytes]`. The
//! cluster is little-endian end to end, so scalars are packed with
//! `to_le_bytes` and no conversion happens anywhere else.
//!
//! Two access disciplines coexist on the payload and both are part of the
//! wire contract:
//!
//! - scalar pops remove from the **tail** of the payload, so push-then-pop of
//!   the same scalar is the round trip;
//! - blob pops drain every remaining byte, and the error decode reads its
//!   kind byte from the **head**.

use crate::error::{Error, ErrorKind, Result};

/// Bytes in the fixed packet header.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single payload; anything larger is treated as garbage.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Message types with wire-stable ordinals (add-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    NoOp = 0,
    /// First packet of every session; carries the peer's node id.
    Ready,
    /// The previous request succeeded.
    Ok,
    /// Ask the root complex to reboot.
    Reboot,
    /// UTF-8 string payload.
    String,
    /// An [`Error`] payload.
    Err,
    /// Request the crew-station configuration.
    GetCrewConfig,
    /// Request the concentrator configuration.
    GetCtrConfig,
    /// Join a multicast group.
    Join,
    /// Leave a multicast group.
    Leave,
}

impl PacketType {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use PacketType::*;
        Some(match code {
            0 => NoOp,
            1 => Ready,
            2 => Ok,
            3 => Reboot,
            4 => String,
            5 => Err,
            6 => GetCrewConfig,
            7 => GetCtrConfig,
            8 => Join,
            9 => Leave,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        use PacketType::*;
        match self {
            NoOp => "NoOp",
            Ready => "Ready",
            Ok => "Ok",
            Reboot => "Reboot",
            String => "String",
            Err => "Err",
            GetCrewConfig => "GetCrewConfig",
            GetCtrConfig => "GetCtrConfig",
            Join => "Join",
            Leave => "Leave",
        }
    }
}

macro_rules! scalar_ops {
    ($($ty:ty => $push:ident, $pop:ident;)*) => {
        $(
            #[doc = concat!("Append a `", stringify!($ty), "` (little-endian).")]
            pub fn $push(&mut self, value: $ty) -> &mut Self {
                self.payload.extend_from_slice(&value.to_le_bytes());
                self
            }

            #[doc = concat!("Remove a `", stringify!($ty), "` from the payload tail.")]
            pub fn $pop(&mut self) -> Result<$ty> {
                const WIDTH: usize = std::mem::size_of::<$ty>();
                if self.payload.len() < WIDTH {
                    return Err(Error::with_message(
                        ErrorKind::NetBadPacket,
                        concat!("payload too short for ", stringify!($ty)),
                    ));
                }
                let at = self.payload.len() - WIDTH;
                let mut raw = [0u8; WIDTH];
                raw.copy_from_slice(&self.payload[at..]);
                self.payload.truncate(at);
                Ok(<$ty>::from_le_bytes(raw))
            }
        )*
    };
}

/// A framed protocol message.
///
/// The header's length field is not stored: it is always `payload.len()`,
/// materialized by [`Packet::header_bytes`] at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    ty: PacketType,
    payload: Vec<u8>,
}

impl Packet {
    pub fn new(ty: PacketType) -> Self {
        Self {
            ty,
            payload: Vec::new(),
        }
    }

    pub fn with_bytes(ty: PacketType, payload: Vec<u8>) -> Self {
        Self { ty, payload }
    }

    pub fn with_str(ty: PacketType, text: &str) -> Self {
        Self::with_bytes(ty, text.as_bytes().to_vec())
    }

    /// A string message (`PacketType::String`).
    pub fn string(text: &str) -> Self {
        Self::with_str(PacketType::String, text)
    }

    /// The everything-went-well acknowledgement.
    pub fn ok() -> Self {
        Self::new(PacketType::Ok)
    }

    pub fn packet_type(&self) -> PacketType {
        self.ty
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn data_len(&self) -> u32 {
        self.payload.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// The header as it appears on the wire.
    pub fn header_bytes(&self) -> [u8; HEADER_LEN] {
        let len = self.data_len().to_le_bytes();
        [self.ty.code(), len[0], len[1], len[2], len[3]]
    }

    scalar_ops! {
        u8  => push_u8,  pop_u8;
        u16 => push_u16, pop_u16;
        u32 => push_u32, pop_u32;
        u64 => push_u64, pop_u64;
        i8  => push_i8,  pop_i8;
        i16 => push_i16, pop_i16;
        i32 => push_i32, pop_i32;
        i64 => push_i64, pop_i64;
    }

    /// Append raw bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.payload.extend_from_slice(bytes);
        self
    }

    /// Append a string's bytes.
    pub fn push_str(&mut self, text: &str) -> &mut Self {
        self.push_bytes(text.as_bytes())
    }

    /// Drain the whole remaining payload.
    pub fn pop_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }

    /// Drain the whole remaining payload as a string (lossy UTF-8).
    pub fn pop_string(&mut self) -> String {
        String::from_utf8_lossy(&self.pop_bytes()).into_owned()
    }

    /// Decode an error payload: one kind byte at the **head**, everything
    /// after it is the message. Consumes the payload.
    pub fn pop_error(&mut self) -> Error {
        let bytes = self.pop_bytes();
        let Some((&code, rest)) = bytes.split_first() else {
            return Error::with_message(ErrorKind::NetBadPacket, "empty error payload");
        };
        let Some(kind) = ErrorKind::from_code(code) else {
            return Error::with_message(
                ErrorKind::NetBadPacket,
                format!("unknown error code {code}"),
            );
        };
        if rest.is_empty() {
            Error::new(kind)
        } else {
            Error::with_message(kind, String::from_utf8_lossy(rest).into_owned())
        }
    }
}

impl From<&Error> for Packet {
    fn from(err: &Error) -> Self {
        let mut packet = Packet::new(PacketType::Err);
        packet.push_u8(err.code());
        if let Some(msg) = err.message() {
            packet.push_str(msg);
        }
        packet
    }
}
