//! Shared helpers for broker integration tests: a scripted supervisor
//! peer, a raw protocol client, and a fully-assembled test broker.

// each test binary uses a different subset of these helpers
#![allow(dead_code)]

use protocol::{Handshake, QueryKind};
use server::broker::{bind_listener, Broker};
use server::devsrc::{DeviceDesc, DeviceEvent, DeviceSource};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use supctl::wire::{self, Envelope, Packet, Reply, Request};
use supctl::{ServiceEvent, ServiceHandle, ServiceState, Session};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Notify};

pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Pause answering the `LoadService` for this name until notified; lets a
/// test hold a device operation open at a known point.
pub type LoadGate = (String, Arc<Notify>);

/// Spawn a supervisor peer that answers every request and records a
/// transcript. Services listed in `missing` do not exist; woken services
/// emit a started event right after the wake acknowledgement.
pub fn spawn_supervisor(
    stream: UnixStream,
    missing: Vec<String>,
    gate: Option<LoadGate>,
) -> CallLog {
    let calls: CallLog = Arc::default();
    let log = calls.clone();
    tokio::spawn(async move {
        let (mut rd, mut wr) = stream.into_split();
        let mut handles: HashMap<u32, String> = HashMap::new();
        let mut next_handle = 1u32;
        loop {
            let envelope: Envelope = match wire::read_frame(&mut rd).await {
                Ok(e) => e,
                Err(_) => break,
            };
            let reply = match envelope.request {
                Request::LoadService { name, allow_missing } => {
                    if let Some((gated, notify)) = &gate {
                        if *gated == name {
                            notify.notified().await;
                        }
                    }
                    log.lock()
                        .unwrap()
                        .push(format!("load {} missing_ok={}", name, allow_missing));
                    if missing.contains(&name) {
                        Reply::NoService
                    } else {
                        let handle = next_handle;
                        next_handle += 1;
                        handles.insert(handle, name);
                        Reply::Loaded {
                            handle: ServiceHandle(handle),
                            state: ServiceState::Stopped,
                        }
                    }
                }
                Request::CloseHandle { handle } => {
                    let name = handles.remove(&handle.0).unwrap_or_default();
                    log.lock().unwrap().push(format!("close {}", name));
                    Reply::Done
                }
                Request::SetWaitsFor {
                    from, to, remove, ..
                } => {
                    let from = handles.get(&from.0).cloned().unwrap_or_default();
                    let to = handles.get(&to.0).cloned().unwrap_or_default();
                    log.lock()
                        .unwrap()
                        .push(format!("dep {} -> {} remove={}", from, to, remove));
                    Reply::Done
                }
                Request::WakeService { handle } => {
                    let name = handles.get(&handle.0).cloned().unwrap_or_default();
                    log.lock().unwrap().push(format!("wake {}", name));
                    let ok = wire::write_frame(
                        &mut wr,
                        &Packet::Reply {
                            seq: envelope.seq,
                            reply: Reply::Done,
                        },
                    )
                    .await
                    .is_ok();
                    if !ok {
                        break;
                    }
                    // the woken service settles immediately
                    if wire::write_frame(
                        &mut wr,
                        &Packet::Event {
                            handle,
                            event: ServiceEvent::Started,
                        },
                    )
                    .await
                    .is_err()
                    {
                        break;
                    }
                    continue;
                }
            };
            if wire::write_frame(
                &mut wr,
                &Packet::Reply {
                    seq: envelope.seq,
                    reply,
                },
            )
            .await
            .is_err()
            {
                break;
            }
        }
    });
    calls
}

/// A broker assembled from test parts, plus the handles to drive it.
pub struct TestBroker {
    pub broker: Broker,
    pub events: mpsc::UnboundedSender<Vec<DeviceEvent>>,
    pub socket_path: PathBuf,
    pub calls: CallLog,
    pub _dir: TempDir,
}

pub async fn setup(initial: Vec<DeviceDesc>, missing: &[&str], gate: Option<LoadGate>) -> TestBroker {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("devmon.sock");
    let listener = bind_listener(&socket_path).expect("bind");

    let (client_stream, supervisor_stream) = UnixStream::pair().expect("socketpair");
    let calls = spawn_supervisor(
        supervisor_stream,
        missing.iter().map(|s| s.to_string()).collect(),
        gate,
    );
    let session = Session::from_stream(client_stream);
    let root = session
        .load_service("system", true)
        .await
        .expect("load root")
        .expect("root exists")
        .handle;

    let (events, events_rx) = mpsc::unbounded_channel();
    let source = DeviceSource::scripted(initial, events_rx);
    let mut broker = Broker::new(listener, source, session, root);
    broker.seed().expect("seed");

    TestBroker {
        broker,
        events,
        socket_path,
        calls,
        _dir: dir,
    }
}

/// A raw protocol client.
pub struct TestClient {
    stream: UnixStream,
}

impl TestClient {
    pub async fn subscribe(path: &Path, kind: QueryKind, value: &[u8]) -> Self {
        let mut stream = UnixStream::connect(path).await.expect("connect");
        let mut bytes = Handshake::new(kind, value.len()).unwrap().encode().to_vec();
        bytes.extend_from_slice(value);
        stream.write_all(&bytes).await.expect("handshake write");
        Self { stream }
    }

    /// Open a connection and send arbitrary bytes instead of a valid
    /// handshake.
    pub async fn send_raw(path: &Path, bytes: &[u8]) -> Self {
        let mut stream = UnixStream::connect(path).await.expect("connect");
        stream.write_all(bytes).await.expect("raw write");
        Self { stream }
    }

    pub async fn send_more(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write");
    }

    pub async fn expect_status(&mut self, want: u8) {
        let mut byte = [0u8; 1];
        common::test_utils::with_timeout("status byte", self.stream.read_exact(&mut byte))
            .await
            .expect("status read");
        assert_eq!(byte[0], want, "unexpected status byte");
    }

    /// Nothing may arrive for a little while.
    pub async fn expect_silence(&mut self) {
        let mut byte = [0u8; 1];
        match tokio::time::timeout(Duration::from_millis(200), self.stream.read_exact(&mut byte))
            .await
        {
            Err(_) => {}
            Ok(Ok(_)) => panic!("unexpected status byte {}", byte[0]),
            Ok(Err(e)) => panic!("unexpected connection error: {}", e),
        }
    }

    /// The server must close the connection without sending anything more.
    pub async fn expect_closed(&mut self) {
        let mut byte = [0u8; 1];
        let n = common::test_utils::with_timeout("close", self.stream.read(&mut byte))
            .await
            .expect("close read");
        assert_eq!(n, 0, "expected EOF, got byte {}", byte[0]);
    }
}

/// Wait until the supervisor transcript contains `needle`.
pub async fn wait_for_call(calls: &CallLog, needle: &str) {
    common::test_utils::with_timeout(needle, async {
        loop {
            if calls.lock().unwrap().iter().any(|c| c.contains(needle)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

/// Wait until the transcript contains `needle` at or past index `mark`.
pub async fn wait_for_call_after(calls: &CallLog, mark: usize, needle: &str) {
    common::test_utils::with_timeout(needle, async {
        loop {
            if calls
                .lock()
                .unwrap()
                .iter()
                .skip(mark)
                .any(|c| c.contains(needle))
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
}

/// Index of the first transcript entry containing `needle`.
pub fn call_index(calls: &CallLog, needle: &str) -> usize {
    calls
        .lock()
        .unwrap()
        .iter()
        .position(|c| c.contains(needle))
        .unwrap_or_else(|| panic!("transcript is missing '{}'", needle))
}

pub fn block_desc(syspath: &str, node: &str) -> DeviceDesc {
    DeviceDesc {
        syspath: syspath.to_string(),
        subsystem: "block".to_string(),
        devnode: Some(node.to_string()),
        sysname: syspath.rsplit('/').next().unwrap_or_default().to_string(),
        ..Default::default()
    }
}

pub fn net_desc(syspath: &str, ifname: &str, mac: &str) -> DeviceDesc {
    DeviceDesc {
        syspath: syspath.to_string(),
        subsystem: "net".to_string(),
        sysname: ifname.to_string(),
        mac: Some(mac.to_string()),
        ..Default::default()
    }
}

pub fn usb_desc(syspath: &str, vendor: &str, product: &str, devnum: u64) -> DeviceDesc {
    DeviceDesc {
        syspath: syspath.to_string(),
        subsystem: "usb".to_string(),
        sysname: syspath.rsplit('/').next().unwrap_or_default().to_string(),
        devnum: Some(devnum),
        vendor_id: Some(vendor.to_string()),
        product_id: Some(product.to_string()),
        ..Default::default()
    }
}
