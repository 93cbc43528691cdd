//! Supervisor session management
//!
//! A [`Session`] is a cheap cloneable handle onto one control connection.
//! The connection itself is owned by an I/O task spawned on the current
//! runtime; commands are queued to it and processed strictly in order,
//! which is what lets a caller register an event waiter for a handle and
//! only then issue the wake that will produce the event, without racing.

use crate::error::{Result, SupCtlError};
use crate::wire::{self, Envelope, Packet, Reply, Request, ServiceEvent, ServiceHandle, ServiceState};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Result of a successful service load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedService {
    pub handle: ServiceHandle,
    pub state: ServiceState,
}

enum Cmd {
    Call {
        request: Request,
        reply_tx: oneshot::Sender<Result<Reply>>,
    },
    WaitEvent {
        handle: ServiceHandle,
        event_tx: oneshot::Sender<ServiceEvent>,
    },
}

/// Handle onto a supervisor control session.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::UnboundedSender<Cmd>,
}

impl Session {
    /// Connect to the supervisor control socket at `path`.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_io(stream, cmd_rx));
        Self { cmd_tx }
    }

    /// Adopt an inherited session descriptor (e.g. `DINIT_CS_FD`).
    ///
    /// # Safety
    ///
    /// `fd` must be a valid, open Unix stream socket descriptor that is not
    /// owned elsewhere; the session takes ownership and will close it.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Result<Self> {
        let std_stream = std::os::unix::net::UnixStream::from_raw_fd(fd);
        std_stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(std_stream)?;
        Ok(Self::from_stream(stream))
    }

    /// Load (or find) a service by name.
    ///
    /// Returns `None` when the service does not exist; whether that is
    /// acceptable is the caller's decision, `allow_missing` is forwarded so
    /// the supervisor can skip preparing the service for a start.
    pub async fn load_service(
        &self,
        name: &str,
        allow_missing: bool,
    ) -> Result<Option<LoadedService>> {
        let reply = self
            .call(Request::LoadService {
                name: name.to_string(),
                allow_missing,
            })
            .await?;
        match reply {
            Reply::Loaded { handle, state } => Ok(Some(LoadedService { handle, state })),
            Reply::NoService => Ok(None),
            Reply::Failed { message } => Err(SupCtlError::Request(message)),
            Reply::Done => Err(SupCtlError::UnexpectedReply {
                request: "load_service",
            }),
        }
    }

    /// Release a handle obtained from [`Session::load_service`].
    pub async fn close_handle(&self, handle: ServiceHandle) -> Result<()> {
        self.ack(Request::CloseHandle { handle }, "close_handle").await
    }

    /// Add or remove a waits-for dependency from `from` onto `to`.
    pub async fn set_waits_for(
        &self,
        from: ServiceHandle,
        to: ServiceHandle,
        remove: bool,
        ignore_missing: bool,
    ) -> Result<()> {
        self.ack(
            Request::SetWaitsFor {
                from,
                to,
                remove,
                ignore_missing,
            },
            "set_waits_for",
        )
        .await
    }

    /// Wake a service so anything waiting on it is re-evaluated.
    pub async fn wake_service(&self, handle: ServiceHandle) -> Result<()> {
        self.ack(Request::WakeService { handle }, "wake_service").await
    }

    /// Await the next service event for `handle`.
    ///
    /// The waiter is registered at call time, not at first poll: calling
    /// this before issuing the wake guarantees the event is not missed.
    pub fn service_event(
        &self,
        handle: ServiceHandle,
    ) -> impl Future<Output = Result<ServiceEvent>> + Send + 'static {
        let (event_tx, event_rx) = oneshot::channel();
        let registered = self
            .cmd_tx
            .send(Cmd::WaitEvent { handle, event_tx })
            .is_ok();
        async move {
            if !registered {
                return Err(SupCtlError::SessionClosed);
            }
            event_rx.await.map_err(|_| SupCtlError::SessionClosed)
        }
    }

    async fn call(&self, request: Request) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Cmd::Call { request, reply_tx })
            .map_err(|_| SupCtlError::SessionClosed)?;
        reply_rx.await.map_err(|_| SupCtlError::SessionClosed)?
    }

    async fn ack(&self, request: Request, name: &'static str) -> Result<()> {
        match self.call(request).await? {
            Reply::Done => Ok(()),
            Reply::Failed { message } => Err(SupCtlError::Request(message)),
            _ => Err(SupCtlError::UnexpectedReply { request: name }),
        }
    }
}

async fn run_io(stream: UnixStream, mut cmd_rx: mpsc::UnboundedReceiver<Cmd>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut pending: HashMap<u32, oneshot::Sender<Result<Reply>>> = HashMap::new();
    let mut waiters: HashMap<ServiceHandle, VecDeque<oneshot::Sender<ServiceEvent>>> =
        HashMap::new();
    let mut next_seq: u32 = 0;

    // frames are read in their own task; a frame read must never be torn
    // by a command racing it in the select below
    let (packet_tx, mut packet_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            match wire::read_frame::<_, Packet>(&mut read_half).await {
                Ok(packet) => {
                    if packet_tx.send(Ok(packet)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = packet_tx.send(Err(e));
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                // every Session handle is gone
                None => break,
                Some(Cmd::Call { request, reply_tx }) => {
                    let seq = next_seq;
                    next_seq = next_seq.wrapping_add(1);
                    let envelope = Envelope { seq, request };
                    if let Err(e) = wire::write_frame(&mut write_half, &envelope).await {
                        warn!("supervisor session write failed: {}", e);
                        let _ = reply_tx.send(Err(e));
                        break;
                    }
                    pending.insert(seq, reply_tx);
                }
                Some(Cmd::WaitEvent { handle, event_tx }) => {
                    waiters.entry(handle).or_default().push_back(event_tx);
                }
            },
            packet = packet_rx.recv() => match packet {
                Some(Ok(Packet::Reply { seq, reply })) => match pending.remove(&seq) {
                    Some(tx) => {
                        let _ = tx.send(Ok(reply));
                    }
                    None => debug!(seq, "reply with no matching request"),
                },
                Some(Ok(Packet::Event { handle, event })) => {
                    match waiters.get_mut(&handle).and_then(|q| q.pop_front()) {
                        Some(tx) => {
                            let _ = tx.send(event);
                        }
                        None => debug!(handle = handle.0, ?event, "event with no waiter"),
                    }
                }
                Some(Err(e)) => {
                    warn!("supervisor session read failed: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    // dropping `pending` and `waiters` resolves every outstanding call
    // with SessionClosed
}
