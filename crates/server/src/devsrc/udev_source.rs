//! udev-backed device source
//!
//! Two parallel filters run at all times: one matching the closed set of
//! always-tracked subsystems, one matching the opt-in service tags. A
//! tagged device that belongs to a tracked subsystem is reported by both;
//! the tag-side intake discards it so each device is handled exactly once.

use super::{
    DeviceAction, DeviceDesc, DeviceEvent, SERVICE_TAGS, TRACKED_SUBSYSTEMS, WAITS_FOR_PROPERTY,
};
use common::{Error, Result};
use std::ffi::OsStr;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tracing::debug;
use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

pub struct UdevSource {
    subsystem_monitor: AsyncFd<MonitorSocket>,
    tagged_monitor: AsyncFd<MonitorSocket>,
}

impl UdevSource {
    pub fn new() -> Result<Self> {
        let mut builder = MonitorBuilder::new().map_err(source_err)?;
        for subsystem in TRACKED_SUBSYSTEMS {
            builder = builder.match_subsystem(subsystem).map_err(source_err)?;
        }
        let subsystem_monitor = builder.listen().map_err(source_err)?;

        let mut builder = MonitorBuilder::new().map_err(source_err)?;
        for tag in SERVICE_TAGS {
            builder = builder.match_tag(tag).map_err(source_err)?;
        }
        let tagged_monitor = builder.listen().map_err(source_err)?;

        Ok(Self {
            subsystem_monitor: AsyncFd::with_interest(subsystem_monitor, Interest::READABLE)
                .map_err(source_err)?,
            tagged_monitor: AsyncFd::with_interest(tagged_monitor, Interest::READABLE)
                .map_err(source_err)?,
        })
    }

    /// Enumerate tracked subsystems, then tagged devices outside them.
    pub fn enumerate(&mut self) -> Result<Vec<DeviceDesc>> {
        let mut descs = Vec::new();

        let mut enumerator = Enumerator::new().map_err(source_err)?;
        for subsystem in TRACKED_SUBSYSTEMS {
            enumerator.match_subsystem(subsystem).map_err(source_err)?;
        }
        for device in enumerator.scan_devices().map_err(source_err)? {
            descs.push(describe(&device));
        }

        let mut enumerator = Enumerator::new().map_err(source_err)?;
        for tag in SERVICE_TAGS {
            enumerator.match_tag(tag).map_err(source_err)?;
        }
        for subsystem in TRACKED_SUBSYSTEMS {
            enumerator.nomatch_subsystem(subsystem).map_err(source_err)?;
        }
        for device in enumerator.scan_devices().map_err(source_err)? {
            descs.push(describe(&device));
        }

        Ok(descs)
    }

    /// Wait for the next non-empty batch from either monitor.
    pub async fn next_events(&mut self) -> Result<Vec<DeviceEvent>> {
        loop {
            let batch = tokio::select! {
                batch = drain(&self.subsystem_monitor, false) => batch?,
                batch = drain(&self.tagged_monitor, true) => batch?,
            };
            if !batch.is_empty() {
                return Ok(batch);
            }
        }
    }
}

/// Drain one monitor after readiness. Returns the (possibly fully
/// filtered, hence empty) batch; readiness is only cleared once a drain
/// attempt produces nothing at all.
async fn drain(monitor: &AsyncFd<MonitorSocket>, tagged: bool) -> Result<Vec<DeviceEvent>> {
    loop {
        let mut guard = monitor
            .readable()
            .await
            .map_err(|e| Error::DeviceSource(format!("monitor failed: {}", e)))?;
        let mut saw_any = false;
        let mut batch = Vec::new();
        for event in monitor.get_ref().iter() {
            saw_any = true;
            if let Some(converted) = convert(&event, tagged) {
                batch.push(converted);
            }
        }
        if !saw_any {
            guard.clear_ready();
            continue;
        }
        return Ok(batch);
    }
}

fn convert(event: &udev::Event, tagged: bool) -> Option<DeviceEvent> {
    let device = event.device();
    let subsystem = lossy(device.subsystem());
    // tracked subsystems are handled by the other monitor
    if tagged && TRACKED_SUBSYSTEMS.contains(&subsystem.as_str()) {
        return None;
    }
    let action = match event.event_type() {
        EventType::Add => DeviceAction::Add,
        EventType::Change => DeviceAction::Change,
        EventType::Remove => DeviceAction::Remove,
        other => {
            debug!("ignoring '{:?}' for '{}'", other, device.syspath().display());
            return None;
        }
    };
    Some(DeviceEvent {
        action,
        desc: describe(&device),
    })
}

fn describe(device: &udev::Device) -> DeviceDesc {
    DeviceDesc {
        syspath: device.syspath().to_string_lossy().into_owned(),
        subsystem: lossy(device.subsystem()),
        devnode: device.devnode().map(|p| p.to_string_lossy().into_owned()),
        sysname: device.sysname().to_string_lossy().into_owned(),
        devnum: device.devnum(),
        mac: opt_lossy(device.attribute_value("address")),
        vendor_id: opt_lossy(device.attribute_value("idVendor")),
        product_id: opt_lossy(device.attribute_value("idProduct")),
        tagged: has_service_tag(device),
        waits_for: opt_lossy(device.property_value(WAITS_FOR_PROPERTY)),
    }
}

/// Tags are stored as `:`-separated lists in the `TAGS` and `CURRENT_TAGS`
/// properties.
fn has_service_tag(device: &udev::Device) -> bool {
    for property in ["TAGS", "CURRENT_TAGS"] {
        if let Some(value) = device.property_value(property) {
            let value = value.to_string_lossy();
            if value
                .split(':')
                .any(|tag| SERVICE_TAGS.contains(&tag))
            {
                return true;
            }
        }
    }
    false
}

fn lossy(value: Option<&OsStr>) -> String {
    value.map(|v| v.to_string_lossy().into_owned()).unwrap_or_default()
}

fn opt_lossy(value: Option<&OsStr>) -> Option<String> {
    value.map(|v| v.to_string_lossy().into_owned())
}

fn source_err(e: std::io::Error) -> Error {
    Error::DeviceSource(e.to_string())
}
