//! Error model shared by the CLI, the wire protocol and filesystem helpers.
//!
//! `ErrorKind` ordinals and canonical names cross the wire inside `Err`
//! packets, so both are append-only: new kinds go at the end, existing ones
//! never move.

use thiserror::Error;

use crate::net::Packet;

/// Error categories with wire-stable ordinals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    InvalidOperation = 0,
    InvalidState,
    Timeout,
    JsonParseError,
    NotFound,

    // CLI
    UnknownCommand,
    UnknownSubCommand,
    UnknownArgument,

    // Network
    NetSocketError,
    NetConnectionTimeout,
    NetBadPacket,
    NetListenFailure,
    NetWriteFailure,
    NetReadFailure,
    NetReadyFailure,

    // Camera
    InvalidCameraConfiguration,

    // I/O
    IOError,

    // System
    ForkFailed,
}

impl ErrorKind {
    /// Wire ordinal of this kind.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire ordinal.
    pub fn from_code(code: u8) -> Option<Self> {
        use ErrorKind::*;
        Some(match code {
            0 => InvalidOperation,
            1 => InvalidState,
            2 => Timeout,
            3 => JsonParseError,
            4 => NotFound,
            5 => UnknownCommand,
            6 => UnknownSubCommand,
            7 => UnknownArgument,
            8 => NetSocketError,
            9 => NetConnectionTimeout,
            10 => NetBadPacket,
            11 => NetListenFailure,
            12 => NetWriteFailure,
            13 => NetReadFailure,
            14 => NetReadyFailure,
            15 => InvalidCameraConfiguration,
            16 => IOError,
            17 => ForkFailed,
            _ => return None,
        })
    }

    /// Canonical name, as logged and as understood by peers.
    pub fn name(self) -> &'static str {
        use ErrorKind::*;
        match self {
            InvalidOperation => "InvalidOperation",
            InvalidState => "InvalidState",
            Timeout => "Timeout",
            JsonParseError => "JsonParseError",
            NotFound => "NotFound",
            UnknownCommand => "UnknownCommand",
            UnknownSubCommand => "UnknownSubCommand",
            UnknownArgument => "UnknownArgument",
            NetSocketError => "NetSocketError",
            NetConnectionTimeout => "NetConnectionTimeout",
            NetBadPacket => "NetBadPacket",
            NetListenFailure => "NetListenFailure",
            NetWriteFailure => "NetWriteFailure",
            NetReadFailure => "NetReadFailure",
            NetReadyFailure => "NetReadyFailure",
            InvalidCameraConfiguration => "InvalidCameraConfiguration",
            IOError => "IOError",
            ForkFailed => "ForkFailed",
        }
    }
}

fn render(kind: &ErrorKind, message: &Option<String>) -> String {
    match message {
        Some(msg) => format!("Error Type: {}\n\tMessage: {}", kind.name(), msg),
        None => format!("Error Type: {}", kind.name()),
    }
}

/// A tagged error with an optional human-readable message.
///
/// Serializes onto the wire as one kind byte followed by the message bytes;
/// see [`Packet::pop_error`] for the decode side.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render(.kind, .message))]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    /// Message-only constructor for the default kind.
    pub fn invalid_op(message: impl Into<String>) -> Self {
        Self::with_message(ErrorKind::InvalidOperation, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Wire ordinal, also used as the process exit code.
    pub fn code(&self) -> u8 {
        self.kind.code()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn has_message(&self) -> bool {
        self.message.is_some()
    }

    /// Decode an error delivered as an `Err` packet.
    pub fn from_packet(mut packet: Packet) -> Self {
        packet.pop_error()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
