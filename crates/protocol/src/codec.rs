//! Handshake framing and status-byte helpers
//!
//! # Frame format
//!
//! The handshake is a fixed 10-byte sequence followed by the query value:
//!
//! ```text
//! [magic: 0xDD][type tag: 6 bytes, NUL padded][NUL][value length: u16 LE]
//! [value bytes: exactly `value length`, no NUL]
//! ```
//!
//! The value length must be non-zero. After the value the server answers
//! with one status byte for the current state and one more byte per
//! subsequent transition.

use crate::error::{ProtocolError, Result};
use std::io::{ErrorKind, Read, Write};

/// First byte of every handshake.
pub const MAGIC: u8 = 0xDD;

/// Width of the NUL-padded type tag field.
pub const TYPE_TAG_LEN: usize = 6;

/// Handshake header: magic, type tag, NUL terminator.
pub const HEADER_LEN: usize = 1 + TYPE_TAG_LEN + 1;

/// Width of the value-length field.
pub const LENGTH_LEN: usize = 2;

/// Complete handshake: header plus value length.
pub const HANDSHAKE_LEN: usize = HEADER_LEN + LENGTH_LEN;

/// Largest admissible query value.
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;

/// Status byte: the watched device is present.
pub const STATUS_AVAILABLE: u8 = 1;

/// Status byte: the watched device is absent.
pub const STATUS_UNAVAILABLE: u8 = 0;

/// The kind of device a subscription is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// A device node path (`/dev/...`); symlinks are resolved server-side.
    Node,
    /// A kernel syspath, or the `vendor:product` key for USB records.
    Syspath,
    /// A network interface name.
    Ifname,
    /// A MAC address in lowercase colon form.
    Mac,
    /// A USB `vendor:product` identifier in lowercase hex.
    Usb,
}

impl QueryKind {
    /// The on-wire type tag for this kind.
    pub const fn tag(self) -> &'static str {
        match self {
            QueryKind::Node => "dev",
            QueryKind::Syspath => "sys",
            QueryKind::Ifname => "netif",
            QueryKind::Mac => "mac",
            QueryKind::Usb => "usb",
        }
    }

    /// Look up a kind from its wire tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "dev" => Some(QueryKind::Node),
            "sys" => Some(QueryKind::Syspath),
            "netif" => Some(QueryKind::Ifname),
            "mac" => Some(QueryKind::Mac),
            "usb" => Some(QueryKind::Usb),
            _ => None,
        }
    }
}

/// A parsed (or to-be-encoded) handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub kind: QueryKind,
    pub value_len: u16,
}

impl Handshake {
    /// Build a handshake, rejecting empty values.
    pub fn new(kind: QueryKind, value_len: usize) -> Result<Self> {
        if value_len == 0 {
            return Err(ProtocolError::EmptyValue);
        }
        let value_len =
            u16::try_from(value_len).map_err(|_| ProtocolError::ValueTooLong(value_len))?;
        Ok(Self { kind, value_len })
    }

    /// Encode the full 10-byte handshake.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = MAGIC;
        let tag = self.kind.tag().as_bytes();
        buf[1..1 + tag.len()].copy_from_slice(tag);
        // bytes up to and including HEADER_LEN - 1 stay NUL
        buf[HEADER_LEN..].copy_from_slice(&self.value_len.to_le_bytes());
        buf
    }

    /// Parse the 8-byte header, yielding the query kind.
    pub fn parse_header(buf: &[u8; HEADER_LEN]) -> Result<QueryKind> {
        if buf[0] != MAGIC {
            return Err(ProtocolError::BadMagic(buf[0]));
        }
        if buf[HEADER_LEN - 1] != 0 {
            return Err(ProtocolError::MissingTerminator);
        }
        let tag = &buf[1..1 + TYPE_TAG_LEN];
        let end = tag.iter().position(|&b| b == 0).unwrap_or(TYPE_TAG_LEN);
        if tag[end..].iter().any(|&b| b != 0) {
            return Err(ProtocolError::BadTypeTag(lossy_tag(tag)));
        }
        let tag = std::str::from_utf8(&tag[..end])
            .map_err(|_| ProtocolError::BadTypeTag(lossy_tag(tag)))?;
        QueryKind::from_tag(tag).ok_or_else(|| ProtocolError::BadTypeTag(tag.to_string()))
    }

    /// Parse a complete 10-byte handshake. Inverse of [`Handshake::encode`]
    /// on valid input.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        let header: &[u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().expect("fixed split");
        let kind = Self::parse_header(header)?;
        let value_len = u16::from_le_bytes([buf[HEADER_LEN], buf[HEADER_LEN + 1]]);
        if value_len == 0 {
            return Err(ProtocolError::EmptyValue);
        }
        Ok(Self { kind, value_len })
    }
}

fn lossy_tag(tag: &[u8]) -> String {
    String::from_utf8_lossy(tag).trim_end_matches('\0').to_string()
}

/// Write a full query (handshake plus value bytes) to a blocking stream.
pub fn write_query<W: Write>(writer: &mut W, kind: QueryKind, value: &[u8]) -> Result<()> {
    let hs = Handshake::new(kind, value.len())?;
    writer.write_all(&hs.encode())?;
    writer.write_all(value)?;
    Ok(())
}

/// Read one status byte from a blocking stream, retrying on EINTR.
///
/// A clean EOF (the server closed the connection) surfaces as
/// [`ProtocolError::Closed`].
pub fn read_status<R: Read>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(ProtocolError::Closed),
            Ok(_) => return Ok(byte[0]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
}
