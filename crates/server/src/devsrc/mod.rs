//! Device source adapters
//!
//! The broker consumes the kernel device model through a small adapter
//! layer: an initial enumeration pass plus a stream of add/change/remove
//! events. Descriptors are converted eagerly into plain [`DeviceDesc`]
//! records so the rest of the broker never touches the underlying library.
//!
//! Three adapters exist: the real udev-backed one, a dummy that produces
//! nothing (containers, hosts without udev), and a scripted one driven by
//! tests.

mod udev_source;

pub use udev_source::UdevSource;

use common::Result;
use tokio::sync::mpsc;

/// Subsystems that are always tracked, tag or no tag.
pub const TRACKED_SUBSYSTEMS: [&str; 4] = ["block", "net", "tty", "usb"];

/// Tags that opt a device into supervisor integration.
pub const SERVICE_TAGS: [&str; 2] = ["dinit", "systemd"];

/// Device property naming the services that wait on the device.
pub const WAITS_FOR_PROPERTY: &str = "DINIT_WAITS_FOR";

/// What happened to a device. `bind`/`unbind` never reach the broker; the
/// adapters drop them at intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Add,
    Change,
    Remove,
}

/// A plain-data snapshot of one kernel device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDesc {
    /// Absolute kernel syspath.
    pub syspath: String,
    /// Subsystem name (`block`, `net`, `tty`, `usb`, ...).
    pub subsystem: String,
    /// Device node path, if the device has one.
    pub devnode: Option<String>,
    /// Kernel device name (interface name for `net`).
    pub sysname: String,
    /// Kernel device number, if any.
    pub devnum: Option<u64>,
    /// MAC address (`address` sysattr), for `net` devices.
    pub mac: Option<String>,
    /// USB vendor id sysattr (`idVendor`), lowercase hex.
    pub vendor_id: Option<String>,
    /// USB product id sysattr (`idProduct`), lowercase hex.
    pub product_id: Option<String>,
    /// Device carries one of the opt-in service tags.
    pub tagged: bool,
    /// Raw `DINIT_WAITS_FOR` property value.
    pub waits_for: Option<String>,
}

/// One event drawn from a monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    pub desc: DeviceDesc,
}

/// Event source feeding the broker.
pub enum DeviceSource {
    Udev(UdevSource),
    /// No devices, ever: queries resolve to "not available" but the
    /// control surface stays functional.
    Dummy,
    /// Test-driven source.
    Scripted(ScriptedSource),
}

impl DeviceSource {
    /// Build the production source: real unless dummy mode is forced.
    pub fn new(dummy_mode: bool) -> Result<Self> {
        if dummy_mode {
            Ok(DeviceSource::Dummy)
        } else {
            Ok(DeviceSource::Udev(UdevSource::new()?))
        }
    }

    /// Build a scripted source from a fixed enumeration and an event feed.
    pub fn scripted(
        initial: Vec<DeviceDesc>,
        events: mpsc::UnboundedReceiver<Vec<DeviceEvent>>,
    ) -> Self {
        DeviceSource::Scripted(ScriptedSource {
            initial: Some(initial),
            events,
        })
    }

    /// One finite enumeration pass over currently-present devices.
    pub fn enumerate(&mut self) -> Result<Vec<DeviceDesc>> {
        match self {
            DeviceSource::Udev(src) => src.enumerate(),
            DeviceSource::Dummy => Ok(Vec::new()),
            DeviceSource::Scripted(src) => Ok(src.initial.take().unwrap_or_default()),
        }
    }

    /// Wait for the next non-empty batch of monitor events.
    pub async fn next_events(&mut self) -> Result<Vec<DeviceEvent>> {
        match self {
            DeviceSource::Udev(src) => src.next_events().await,
            DeviceSource::Dummy => std::future::pending().await,
            DeviceSource::Scripted(src) => match src.events.recv().await {
                Some(batch) => Ok(batch),
                // script finished; behave like the dummy from here on
                None => std::future::pending().await,
            },
        }
    }
}

/// Source driven by a test script.
pub struct ScriptedSource {
    initial: Option<Vec<DeviceDesc>>,
    events: mpsc::UnboundedReceiver<Vec<DeviceEvent>>,
}
