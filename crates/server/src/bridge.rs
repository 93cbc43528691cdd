//! Supervisor bridge operations
//!
//! Every tagged device is mirrored into the init supervisor as a synthetic
//! `device@<syspath>` service, wired as a waits-for dependency of the root
//! service, and the services named by the device's waits-for property are
//! wired as waits-for dependencies of the device service.
//!
//! The per-device serialization lives on the [`Device`](crate::table::Device)
//! record (`processing`/`pending`/`removal` plus the three dependency
//! sets); this module provides the single in-flight operation the broker
//! dispatches from that state. The operation is an owned future, so a
//! burst of events can never interleave partial dependency edits: later
//! events coalesce on the record until the running operation completes.

use std::collections::BTreeSet;
use supctl::{ServiceHandle, ServiceState, Session, SupCtlError};
use tracing::debug;

/// Result of one settled device operation, fed back into the event loop.
pub struct OpOutcome {
    pub key: String,
    pub removal: bool,
    pub result: Result<(), SupCtlError>,
}

/// Name of the synthetic service representing a device.
pub fn device_service_name(key: &str) -> String {
    format!("device@{}", key)
}

/// Parse a waits-for property value: whitespace-separated service names,
/// no escaping, no ordering.
pub fn parse_waits_for(value: Option<&str>) -> BTreeSet<String> {
    value
        .unwrap_or("")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Run one device operation to completion.
///
/// `to_remove` holds the dependencies wired by the previous operation,
/// `to_add` the target set of this one; the supervisor ends up with
/// exactly `to_add` wired under the device service.
pub async fn run_operation(
    session: Session,
    root: ServiceHandle,
    key: String,
    removal: bool,
    to_remove: BTreeSet<String>,
    to_add: BTreeSet<String>,
) -> OpOutcome {
    let result = wire_device(&session, root, &key, removal, &to_remove, &to_add).await;
    OpOutcome {
        key,
        removal,
        result,
    }
}

async fn wire_device(
    session: &Session,
    root: ServiceHandle,
    key: &str,
    removal: bool,
    to_remove: &BTreeSet<String>,
    to_add: &BTreeSet<String>,
) -> Result<(), SupCtlError> {
    let name = device_service_name(key);
    let Some(device_svc) = session.load_service(&name, removal).await? else {
        // the service definition is gone (or was never there); nothing to
        // wire or unwire
        debug!("no service '{}', skipping", name);
        return Ok(());
    };

    // wire (or unwire) the root service's dependency on the device service
    session
        .set_waits_for(root, device_svc.handle, removal, !removal)
        .await?;
    if !removal && device_svc.state != ServiceState::Started {
        // re-evaluate waiters in case the dependency already existed
        session.wake_service(device_svc.handle).await?;
    }

    // resynchronize the device service's own dependencies concurrently
    let sub_ops = to_remove
        .iter()
        .map(|svc| sub_operation(session, device_svc.handle, svc, true))
        .chain(
            to_add
                .iter()
                .map(|svc| sub_operation(session, device_svc.handle, svc, false)),
        );
    let results = futures::future::join_all(sub_ops).await;

    session.close_handle(device_svc.handle).await?;
    results.into_iter().collect()
}

/// Add or remove one waits-for dependency from the device service onto a
/// named service. A service that cannot be loaded is a no-op.
async fn sub_operation(
    session: &Session,
    device_svc: ServiceHandle,
    name: &str,
    remove: bool,
) -> Result<(), SupCtlError> {
    let Some(svc) = session.load_service(name, remove).await? else {
        debug!("no service '{}', skipping", name);
        return Ok(());
    };

    if !remove && svc.state != ServiceState::Started {
        // register for the event before waking so it cannot be missed
        let event = session.service_event(svc.handle);
        session
            .set_waits_for(device_svc, svc.handle, remove, !remove)
            .await?;
        session.wake_service(svc.handle).await?;
        // wait for the service to settle; the resulting state itself does
        // not matter here
        let _ = event.await?;
    } else {
        session
            .set_waits_for(device_svc, svc.handle, remove, !remove)
            .await?;
    }

    session.close_handle(svc.handle).await?;
    Ok(())
}
