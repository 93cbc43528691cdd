//! Protocol library for the device availability broker
//!
//! This crate defines the wire format spoken over the broker's Unix control
//! socket. A client opens a stream connection, sends a fixed-size handshake
//! header naming the kind of device it is interested in, a two-byte value
//! length, and the value bytes themselves. From then on the connection is a
//! one-way stream of single status bytes: one byte per availability
//! transition of the watched device, `1` for available, `0` for not.
//!
//! The server never terminates a healthy connection; only the client (or a
//! server-side error) does.
//!
//! # Example
//!
//! ```
//! use protocol::{Handshake, QueryKind};
//!
//! let hs = Handshake::new(QueryKind::Node, 9).unwrap();
//! let bytes = hs.encode();
//!
//! let decoded = Handshake::parse(&bytes).unwrap();
//! assert_eq!(decoded.kind, QueryKind::Node);
//! assert_eq!(decoded.value_len, 9);
//! ```

pub mod codec;
pub mod error;

pub use codec::{
    read_status, write_query, Handshake, QueryKind, HANDSHAKE_LEN, HEADER_LEN, LENGTH_LEN,
    MAGIC, MAX_VALUE_LEN, STATUS_AVAILABLE, STATUS_UNAVAILABLE, TYPE_TAG_LEN,
};
pub use error::{ProtocolError, Result};
