//! Protocol public API tests
//!
//! Run with: `cargo test -p protocol --test protocol_tests`

use protocol::{
    read_status, write_query, Handshake, ProtocolError, QueryKind, HANDSHAKE_LEN, MAGIC,
    STATUS_AVAILABLE,
};
use std::io::Cursor;

#[test]
fn test_full_query_exchange() {
    // client side: encode a query for a block device node
    let mut wire = Vec::new();
    write_query(&mut wire, QueryKind::Node, b"/dev/sda1").unwrap();

    // server side: parse what arrived
    let header: &[u8; HANDSHAKE_LEN] = wire[..HANDSHAKE_LEN].try_into().unwrap();
    let handshake = Handshake::parse(header).unwrap();
    assert_eq!(handshake.kind, QueryKind::Node);
    assert_eq!(&wire[HANDSHAKE_LEN..], b"/dev/sda1");
    assert_eq!(wire[0], MAGIC);

    // server answers, client reads
    let mut status_stream = Cursor::new(vec![STATUS_AVAILABLE]);
    assert_eq!(read_status(&mut status_stream).unwrap(), STATUS_AVAILABLE);
}

#[test]
fn test_all_kinds_roundtrip_on_the_wire() {
    for (kind, value) in [
        (QueryKind::Node, "/dev/disk/by-label/root".as_bytes()),
        (QueryKind::Syspath, "/sys/block/sda".as_bytes()),
        (QueryKind::Ifname, "eth0".as_bytes()),
        (QueryKind::Mac, "aa:bb:cc:dd:ee:ff".as_bytes()),
        (QueryKind::Usb, "1d6b:0003".as_bytes()),
    ] {
        let mut wire = Vec::new();
        write_query(&mut wire, kind, value).unwrap();
        let header: &[u8; HANDSHAKE_LEN] = wire[..HANDSHAKE_LEN].try_into().unwrap();
        let handshake = Handshake::parse(header).unwrap();
        assert_eq!(handshake.kind, kind);
        assert_eq!(handshake.value_len as usize, value.len());
        // parse then re-encode is the identity on the header bytes
        assert_eq!(&handshake.encode()[..], &wire[..HANDSHAKE_LEN]);
    }
}

#[test]
fn test_empty_query_rejected_client_side() {
    let mut wire = Vec::new();
    let err = write_query(&mut wire, QueryKind::Syspath, b"").unwrap_err();
    assert!(matches!(err, ProtocolError::EmptyValue));
    assert!(wire.is_empty(), "nothing may be written for a bad query");
}
