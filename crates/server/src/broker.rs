//! Broker bring-up and event loop
//!
//! A single task owns all broker state and multiplexes, in priority
//! order: termination signals, incoming connections, device source
//! events, settling supervisor operations, and readable subscriber
//! connections. There are no timeouts anywhere; subscribers that stall
//! are evicted at write time rather than waited on.
//!
//! Supervisor I/O is not a branch here: the session crate drains its
//! read/write queues in its own task on the same single-threaded runtime,
//! so dispatch happens whenever this loop yields.

use crate::bridge::{self, OpOutcome};
use crate::devsrc::{DeviceAction, DeviceDesc, DeviceEvent, DeviceSource};
use crate::registry::SubscriberRegistry;
use crate::table::{Changes, DeviceTable};
use anyhow::{bail, Context, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use protocol::{QueryKind, STATUS_AVAILABLE, STATUS_UNAVAILABLE};
use std::collections::BTreeSet;
use std::fs::{File, Permissions};
use std::future::Future;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;
use std::pin::Pin;
use supctl::{ServiceHandle, Session};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// Kernel socket buffers are clamped small; every frame on this socket
/// fits in a fraction of this.
const SOCKET_BUF_SIZE: usize = 2048;

type DeviceOp = Pin<Box<dyn Future<Output = OpOutcome>>>;

pub struct Broker {
    listener: UnixListener,
    source: DeviceSource,
    session: Session,
    root: ServiceHandle,
    table: DeviceTable,
    registry: SubscriberRegistry,
    ops: FuturesUnordered<DeviceOp>,
}

impl Broker {
    pub fn new(
        listener: UnixListener,
        source: DeviceSource,
        session: Session,
        root: ServiceHandle,
    ) -> Self {
        Self {
            listener,
            source,
            session,
            root,
            table: DeviceTable::default(),
            registry: SubscriberRegistry::default(),
            ops: FuturesUnordered::new(),
        }
    }

    /// Seed the table from the initial enumeration. No subscribers exist
    /// yet, so nothing is notified; supervisor wiring still happens.
    pub fn seed(&mut self) -> Result<()> {
        let descs = self
            .source
            .enumerate()
            .context("device enumeration failed")?;
        info!("enumerated {} devices", descs.len());
        for desc in descs {
            self.apply(
                DeviceEvent {
                    action: DeviceAction::Add,
                    desc,
                },
                false,
            )?;
        }
        Ok(())
    }

    /// Run until a termination signal arrives or a fatal error occurs.
    pub async fn run(&mut self) -> Result<()> {
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigint =
            signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

        info!("main loop");
        loop {
            tokio::select! {
                biased;

                _ = sigterm.recv() => {
                    info!("SIGTERM, shutting down");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT, shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        self.registry.insert(stream);
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                events = self.source.next_events() => {
                    for event in events.context("device source failed")? {
                        self.apply(event, true)?;
                    }
                }
                Some(outcome) = self.ops.next(), if !self.ops.is_empty() => {
                    self.finish_operation(outcome)?;
                }
                id = self.registry.wait_readable(), if !self.registry.is_empty() => {
                    self.registry.drive(id, &self.table);
                }
            }
            self.registry.compact();
        }

        // the socket file itself stays behind; the next start clears it
        self.registry.close_all();
        Ok(())
    }

    /// Commit one device event: mutate the table, then route the device
    /// through the supervisor bridge or announce it directly.
    fn apply(&mut self, event: DeviceEvent, notify: bool) -> Result<()> {
        match event.action {
            DeviceAction::Add | DeviceAction::Change => {
                debug!("add device '{}'", event.desc.syspath);
                let Some((key, changes)) =
                    self.table.upsert(&event.desc, &mut self.registry, notify)
                else {
                    return Ok(());
                };
                self.intake(&key, &event.desc, false, changes, notify);
            }
            DeviceAction::Remove => {
                debug!("drop device '{}'", event.desc.syspath);
                let Some(key) = self.table.begin_remove(&event.desc) else {
                    return Ok(());
                };
                let deferred = self.intake(&key, &event.desc, true, Changes::default(), notify);
                self.table.drop_index_entries(&key);
                if !deferred {
                    // teardown already announced; a bridge operation would
                    // otherwise do this once it settles
                    self.table.clear_names(&key);
                }
            }
        }
        Ok(())
    }

    /// Route a committed event. Untagged devices are announced
    /// immediately; tagged ones (stickily: ever-tagged ones) coalesce into
    /// the per-device operation queue. Returns whether announcement was
    /// deferred to an operation.
    fn intake(
        &mut self,
        key: &str,
        desc: &DeviceDesc,
        removal: bool,
        changes: Changes,
        notify: bool,
    ) -> bool {
        let (has_tag, removed) = {
            let dev = self.table.get_mut(key).expect("record exists");
            if !dev.has_tag && desc.tagged {
                dev.has_tag = true;
            }
            (dev.has_tag, dev.removed)
        };

        if !has_tag {
            if notify && (removal || changes.notable()) {
                let status = if removed {
                    STATUS_UNAVAILABLE
                } else {
                    STATUS_AVAILABLE
                };
                self.announce(key, status);
            }
            return false;
        }

        let next_deps = if removal {
            BTreeSet::new()
        } else {
            bridge::parse_waits_for(desc.waits_for.as_deref())
        };
        let idle = {
            let dev = self.table.get_mut(key).expect("record exists");
            dev.next_deps = next_deps;
            dev.pending = true;
            !dev.processing
        };
        // a running operation re-dispatches when it settles
        if idle {
            self.dispatch(key);
        }
        true
    }

    /// Shuffle the dependency sets and start the next operation if one is
    /// pending; otherwise the device goes idle.
    fn dispatch(&mut self, key: &str) {
        let session = self.session.clone();
        let root = self.root;
        let Some(dev) = self.table.get_mut(key) else {
            return;
        };
        dev.current_deps = std::mem::take(&mut dev.pending_deps);
        dev.pending_deps = std::mem::take(&mut dev.next_deps);
        if !dev.pending {
            dev.processing = false;
            return;
        }
        dev.pending = false;
        dev.removal = dev.removed;
        dev.processing = true;
        debug!(
            "processing '{}' (removal: {}, deps: {:?})",
            key, dev.removal, dev.pending_deps
        );
        self.ops.push(Box::pin(bridge::run_operation(
            session,
            root,
            key.to_string(),
            dev.removal,
            dev.current_deps.clone(),
            dev.pending_deps.clone(),
        )));
    }

    /// An operation settled: announce its terminal state, then dispatch
    /// any event that queued up behind it.
    fn finish_operation(&mut self, outcome: OpOutcome) -> Result<()> {
        if let Err(e) = outcome.result {
            bail!("supervisor operation for '{}' failed: {}", outcome.key, e);
        }
        let status = if outcome.removal {
            STATUS_UNAVAILABLE
        } else {
            STATUS_AVAILABLE
        };
        self.announce(&outcome.key, status);
        if outcome.removal && self.table.get(&outcome.key).is_some_and(|d| d.removed) {
            self.table.clear_names(&outcome.key);
        }
        self.dispatch(&outcome.key);
        Ok(())
    }

    /// Tell every concerned subscriber about an availability flip.
    fn announce(&mut self, key: &str, status: u8) {
        let Some(dev) = self.table.get(key) else {
            return;
        };
        info!("ready {} for '{}'", status, key);
        if dev.subsystem == "usb" {
            self.registry.notify_value(QueryKind::Usb, key, status);
            self.registry.notify_value(QueryKind::Syspath, key, status);
            return;
        }
        self.registry.notify_value(QueryKind::Syspath, key, status);
        if dev.subsystem == "net" {
            if !dev.name.is_empty() {
                self.registry
                    .notify_value(QueryKind::Ifname, &dev.name, status);
            }
            if !dev.mac.is_empty() {
                self.registry.notify_value(QueryKind::Mac, &dev.mac, status);
            }
        } else if !dev.name.is_empty() {
            self.registry.notify_node(&dev.name, status);
        }
    }
}

/// Create the control socket: unlink whatever is there, bind, restrict to
/// the owner, clamp the kernel buffers.
pub fn bind_listener(path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);
    let listener = std::os::unix::net::UnixListener::bind(path)
        .with_context(|| format!("failed to bind '{}'", path.display()))?;
    std::fs::set_permissions(path, Permissions::from_mode(0o700))
        .with_context(|| format!("failed to chmod '{}'", path.display()))?;

    use nix::sys::socket::{setsockopt, sockopt};
    if let Err(e) = setsockopt(&listener, sockopt::RcvBuf, &SOCKET_BUF_SIZE) {
        warn!("setsockopt failed: {}", e);
    }
    if let Err(e) = setsockopt(&listener, sockopt::SndBuf, &SOCKET_BUF_SIZE) {
        warn!("setsockopt failed: {}", e);
    }

    listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(listener)?;
    info!("socket: listening on '{}'", path.display());
    Ok(listener)
}

/// Report readiness on an inherited descriptor, then close it.
pub fn signal_readiness(fd: RawFd) -> Result<()> {
    let mut pipe = unsafe { File::from_raw_fd(fd) };
    pipe.metadata()
        .with_context(|| format!("readiness descriptor {} is not usable", fd))?;
    pipe.write_all(b"READY=1\n")
        .context("failed to signal readiness")?;
    Ok(())
}
