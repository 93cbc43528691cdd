//! Subscriber registry
//!
//! Tracks accepted control-socket connections through the handshake state
//! machine and delivers status bytes to active subscriptions. Writes are
//! opportunistic: a subscriber whose socket buffer is full, or whose write
//! fails for any other reason, is evicted rather than waited on. The
//! broker never blocks on a slow subscriber.
//!
//! Protocol violations (short fixed-size reads, zero-length values, bytes
//! after a completed query) terminate the connection; nothing else does.

use crate::table::{node_matches, DeviceTable};
use protocol::{Handshake, QueryKind, HEADER_LEN, LENGTH_LEN};
use std::io::ErrorKind;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

enum ConnState {
    /// Header not yet received; it must arrive in one piece.
    HandshakePending,
    /// Waiting for the two length bytes.
    LengthPending { kind: QueryKind },
    /// Accumulating value bytes.
    DataPending {
        kind: QueryKind,
        want: usize,
        value: Vec<u8>,
    },
    /// Query complete; status transitions flow until either side closes.
    Active { kind: QueryKind, value: Vec<u8> },
}

struct Connection {
    id: u64,
    stream: UnixStream,
    state: ConnState,
    dead: bool,
}

#[derive(Default)]
pub struct SubscriberRegistry {
    conns: Vec<Connection>,
    next_id: u64,
}

impl SubscriberRegistry {
    /// Adopt an accepted connection.
    pub fn insert(&mut self, stream: UnixStream) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        debug!("accepted connection {}", id);
        self.conns.push(Connection {
            id,
            stream,
            state: ConnState::HandshakePending,
            dead: false,
        });
        id
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Resolve once any connection becomes readable (or hangs up), yielding
    /// its id. Pends forever while no connections exist.
    pub async fn wait_readable(&self) -> u64 {
        if self.conns.is_empty() {
            return std::future::pending().await;
        }
        let watchers = self
            .conns
            .iter()
            .map(|conn| {
                Box::pin(async move {
                    // errors surface on the following read attempt
                    let _ = conn.stream.readable().await;
                    conn.id
                })
            })
            .collect::<Vec<_>>();
        let (id, _, _) = futures::future::select_all(watchers).await;
        id
    }

    /// Advance one connection's state machine as far as the socket allows.
    pub fn drive(&mut self, id: u64, table: &DeviceTable) {
        let Some(conn) = self.conns.iter_mut().find(|c| c.id == id) else {
            return;
        };
        if conn.dead {
            return;
        }
        loop {
            match &mut conn.state {
                ConnState::HandshakePending => {
                    let mut buf = [0u8; HEADER_LEN];
                    match conn.stream.try_read(&mut buf) {
                        Ok(0) => {
                            debug!("term {}", conn.id);
                            conn.dead = true;
                            return;
                        }
                        Ok(n) if n < HEADER_LEN => {
                            warn!("incomplete handshake for {}", conn.id);
                            conn.dead = true;
                            return;
                        }
                        Ok(_) => match Handshake::parse_header(&buf) {
                            Ok(kind) => conn.state = ConnState::LengthPending { kind },
                            Err(e) => {
                                warn!("invalid handshake for {}: {}", conn.id, e);
                                conn.dead = true;
                                return;
                            }
                        },
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                        Err(e) => {
                            warn!("read failed for {}: {}", conn.id, e);
                            conn.dead = true;
                            return;
                        }
                    }
                }
                ConnState::LengthPending { kind } => {
                    let kind = *kind;
                    let mut buf = [0u8; LENGTH_LEN];
                    match conn.stream.try_read(&mut buf) {
                        Ok(n) if n < LENGTH_LEN => {
                            warn!("could not receive value length for {}", conn.id);
                            conn.dead = true;
                            return;
                        }
                        Ok(_) => {
                            let want = u16::from_le_bytes(buf) as usize;
                            if want == 0 {
                                warn!("zero-length value for {}", conn.id);
                                conn.dead = true;
                                return;
                            }
                            conn.state = ConnState::DataPending {
                                kind,
                                want,
                                value: Vec::with_capacity(want),
                            };
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                        Err(e) => {
                            warn!("read failed for {}: {}", conn.id, e);
                            conn.dead = true;
                            return;
                        }
                    }
                }
                ConnState::DataPending { kind, want, value } => {
                    let mut buf = vec![0u8; *want - value.len()];
                    match conn.stream.try_read(&mut buf) {
                        Ok(0) => {
                            debug!("term {}", conn.id);
                            conn.dead = true;
                            return;
                        }
                        Ok(n) => {
                            value.extend_from_slice(&buf[..n]);
                            if value.len() == *want {
                                let kind = *kind;
                                let value = std::mem::take(value);
                                let status = table.resolve(kind, &value);
                                info!(
                                    "send status {} for '{}' for {}",
                                    status,
                                    String::from_utf8_lossy(&value),
                                    conn.id
                                );
                                if !write_status(conn, status) {
                                    warn!("write failed for {}", conn.id);
                                    conn.dead = true;
                                    return;
                                }
                                conn.state = ConnState::Active { kind, value };
                            }
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                        Err(e) => {
                            warn!("read failed for {}: {}", conn.id, e);
                            conn.dead = true;
                            return;
                        }
                    }
                }
                ConnState::Active { .. } => {
                    // nothing further is expected from the client
                    let mut buf = [0u8; 32];
                    match conn.stream.try_read(&mut buf) {
                        Ok(0) => {
                            debug!("term {}", conn.id);
                            conn.dead = true;
                            return;
                        }
                        Ok(_) => {
                            warn!("received junk for {}", conn.id);
                            conn.dead = true;
                            return;
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                        Err(e) => {
                            warn!("read failed for {}: {}", conn.id, e);
                            conn.dead = true;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Write `status` to every active subscription of (`kind`, `value`).
    pub fn notify_value(&mut self, kind: QueryKind, value: &str, status: u8) {
        for conn in &mut self.conns {
            if conn.dead {
                continue;
            }
            let ConnState::Active {
                kind: sub_kind,
                value: sub_value,
            } = &conn.state
            else {
                continue;
            };
            if *sub_kind != kind || sub_value != value.as_bytes() {
                continue;
            }
            if !write_status(conn, status) {
                warn!("write failed for {}", conn.id);
                conn.dead = true;
            }
        }
    }

    /// Write `status` to every `dev` subscription designating `node`,
    /// resolving symlinked query values.
    pub fn notify_node(&mut self, node: &str, status: u8) {
        for conn in &mut self.conns {
            if conn.dead {
                continue;
            }
            let ConnState::Active {
                kind: QueryKind::Node,
                value: sub_value,
            } = &conn.state
            else {
                continue;
            };
            if !node_matches(sub_value, node) {
                continue;
            }
            if !write_status(conn, status) {
                warn!("write failed for {}", conn.id);
                conn.dead = true;
            }
        }
    }

    /// Drop connections marked dead, closing their sockets.
    pub fn compact(&mut self) {
        self.conns.retain(|conn| !conn.dead);
    }

    /// Drop every connection (shutdown path).
    pub fn close_all(&mut self) {
        self.conns.clear();
    }
}

fn write_status(conn: &mut Connection, status: u8) -> bool {
    // one byte either goes out whole or the subscriber is evicted; a full
    // socket buffer counts as eviction, subscribers must read promptly
    matches!(conn.stream.try_write(&[status]), Ok(1))
}
