//! Canonical device table
//!
//! One [`Device`] record per canonical key: the kernel syspath for regular
//! devices, the synthetic `vendor:product` identifier for USB devices.
//! Secondary indexes map device nodes, interface names, MAC addresses and
//! USB device numbers back to the canonical key.
//!
//! The table drives subscriber notifications for name transitions itself;
//! availability notifications are emitted by the broker once the device's
//! event (and any supervisor wiring) has settled.

use crate::devsrc::DeviceDesc;
use crate::registry::SubscriberRegistry;
use protocol::{QueryKind, STATUS_AVAILABLE, STATUS_UNAVAILABLE};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One tracked device.
#[derive(Debug, Default)]
pub struct Device {
    /// Canonical key: syspath, or `vendor:product` for USB.
    pub syspath: String,
    pub subsystem: String,
    /// Device node path, or interface name for `net`; empty when absent.
    pub name: String,
    /// MAC address for `net`; empty when absent.
    pub mac: String,
    /// Device numbers backing a USB record.
    pub devset: HashSet<u64>,
    /// Device is gone; the record lingers until (and after) teardown.
    pub removed: bool,
    /// Device carries or ever carried a service tag. Sticky, so removals
    /// of formerly-tagged devices still flow through the bridge.
    pub has_tag: bool,

    // supervisor bridge state; one operation in flight per device
    pub processing: bool,
    pub pending: bool,
    pub removal: bool,
    /// Dependencies wired by the previous operation (to be dropped).
    pub current_deps: BTreeSet<String>,
    /// Dependencies targeted by the operation in flight.
    pub pending_deps: BTreeSet<String>,
    /// Dependencies parsed from the most recent event.
    pub next_deps: BTreeSet<String>,
}

impl Device {
    fn new(syspath: String, subsystem: String) -> Self {
        Self {
            syspath,
            subsystem,
            ..Default::default()
        }
    }
}

/// What an upsert did to the record.
#[derive(Debug, Clone, Copy, Default)]
pub struct Changes {
    /// Record created, or resurrected from a removed state.
    pub fresh: bool,
    /// Name or MAC transitioned (old-value subscribers were told `0`).
    pub renamed: bool,
}

impl Changes {
    /// Whether the availability of the device is worth (re)announcing.
    pub fn notable(&self) -> bool {
        self.fresh || self.renamed
    }
}

#[derive(Default)]
pub struct DeviceTable {
    devices: HashMap<String, Device>,
    node_index: HashMap<String, String>,
    ifname_index: HashMap<String, String>,
    mac_index: HashMap<String, String>,
    usb_index: HashMap<u64, String>,
}

impl DeviceTable {
    pub fn get(&self, key: &str) -> Option<&Device> {
        self.devices.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Device> {
        self.devices.get_mut(key)
    }

    /// Apply an add or change descriptor. Returns the canonical key and
    /// what changed, or `None` for devices the table does not track (USB
    /// devices without a usable id).
    pub fn upsert(
        &mut self,
        desc: &DeviceDesc,
        registry: &mut SubscriberRegistry,
        notify: bool,
    ) -> Option<(String, Changes)> {
        let (key, devnum) = if desc.subsystem == "usb" {
            // no clear vendor:product identity, don't track it at all
            let (Some(vendor), Some(product), Some(devnum)) =
                (&desc.vendor_id, &desc.product_id, desc.devnum)
            else {
                return None;
            };
            (format!("{}:{}", vendor, product), Some(devnum))
        } else {
            (desc.syspath.clone(), None)
        };

        let live = self.devices.get(&key).map(|d| !d.removed).unwrap_or(false);
        let mut changes = Changes::default();
        if live {
            changes.renamed = self.apply_changes(&key, desc, devnum, registry, notify);
        } else {
            changes.fresh = true;
            self.init_record(&key, desc, devnum);
        }
        Some((key, changes))
    }

    /// First-time (or post-removal) setup of a record.
    fn init_record(&mut self, key: &str, desc: &DeviceDesc, devnum: Option<u64>) {
        let dev = self
            .devices
            .entry(key.to_string())
            .or_insert_with(|| Device::new(key.to_string(), desc.subsystem.clone()));
        dev.subsystem = desc.subsystem.clone();
        dev.removed = false;

        if let Some(devnum) = devnum {
            dev.devset.insert(devnum);
            self.usb_index.insert(devnum, key.to_string());
            info!("add usb '{}'", key);
        } else if desc.subsystem == "net" {
            dev.name = desc.sysname.clone();
            dev.mac = desc.mac.clone().unwrap_or_default();
            info!("add netif '{}' ('{}')", dev.name, dev.mac);
            if !dev.name.is_empty() {
                self.ifname_index.insert(dev.name.clone(), key.to_string());
            }
            if !dev.mac.is_empty() {
                self.mac_index.insert(dev.mac.clone(), key.to_string());
            }
        } else {
            dev.name = desc.devnode.clone().unwrap_or_default();
            info!("add {} '{}'", dev.subsystem, dev.name);
            if !dev.name.is_empty() {
                self.node_index.insert(dev.name.clone(), key.to_string());
            }
        }
    }

    /// Apply changes to a live record. Returns whether a name transition
    /// happened.
    fn apply_changes(
        &mut self,
        key: &str,
        desc: &DeviceDesc,
        devnum: Option<u64>,
        registry: &mut SubscriberRegistry,
        notify: bool,
    ) -> bool {
        if let Some(devnum) = devnum {
            let dev = self.devices.get_mut(key).expect("live record");
            if dev.devset.insert(devnum) {
                self.usb_index.insert(devnum, key.to_string());
            }
            false
        } else if desc.subsystem == "net" {
            let ifname = self.set_ifname(key, &desc.sysname, registry, notify);
            let mac = self.set_mac(key, desc.mac.as_deref().unwrap_or(""), registry, notify);
            ifname || mac
        } else {
            self.set_node(key, desc.devnode.as_deref().unwrap_or(""), registry, notify)
        }
    }

    fn set_node(
        &mut self,
        key: &str,
        node: &str,
        registry: &mut SubscriberRegistry,
        notify: bool,
    ) -> bool {
        let dev = self.devices.get_mut(key).expect("live record");
        if dev.name == node {
            return false;
        }
        info!("device change '{}' -> '{}'", dev.name, node);
        let old = std::mem::replace(&mut dev.name, node.to_string());
        if !old.is_empty() {
            if notify {
                registry.notify_node(&old, STATUS_UNAVAILABLE);
            }
            remove_index_entry(&mut self.node_index, &old, key);
        }
        if !node.is_empty() {
            self.node_index.insert(node.to_string(), key.to_string());
        }
        true
    }

    fn set_ifname(
        &mut self,
        key: &str,
        ifname: &str,
        registry: &mut SubscriberRegistry,
        notify: bool,
    ) -> bool {
        let dev = self.devices.get_mut(key).expect("live record");
        if dev.name == ifname {
            return false;
        }
        info!("ifname change '{}' -> '{}'", dev.name, ifname);
        let old = std::mem::replace(&mut dev.name, ifname.to_string());
        if !old.is_empty() {
            if notify {
                registry.notify_value(QueryKind::Ifname, &old, STATUS_UNAVAILABLE);
            }
            remove_index_entry(&mut self.ifname_index, &old, key);
        }
        if !ifname.is_empty() {
            self.ifname_index.insert(ifname.to_string(), key.to_string());
        }
        true
    }

    fn set_mac(
        &mut self,
        key: &str,
        mac: &str,
        registry: &mut SubscriberRegistry,
        notify: bool,
    ) -> bool {
        let dev = self.devices.get_mut(key).expect("live record");
        if dev.mac == mac {
            return false;
        }
        info!("mac change '{}' -> '{}'", dev.mac, mac);
        let old = std::mem::replace(&mut dev.mac, mac.to_string());
        if !old.is_empty() {
            if notify {
                registry.notify_value(QueryKind::Mac, &old, STATUS_UNAVAILABLE);
            }
            remove_index_entry(&mut self.mac_index, &old, key);
        }
        if !mac.is_empty() {
            self.mac_index.insert(mac.to_string(), key.to_string());
        }
        true
    }

    /// Commit a remove event. For USB this drops one device number; only
    /// the last one tears the record down. Returns the canonical key when
    /// teardown should proceed.
    pub fn begin_remove(&mut self, desc: &DeviceDesc) -> Option<String> {
        let mut key = desc.syspath.clone();
        if let Some(devnum) = desc.devnum {
            if let Some(usb_key) = self.usb_index.remove(&devnum) {
                if let Some(dev) = self.devices.get_mut(&usb_key) {
                    dev.devset.remove(&devnum);
                    if !dev.devset.is_empty() {
                        debug!("usb '{}' still backed by {} devices", usb_key, dev.devset.len());
                        return None;
                    }
                }
                key = usb_key;
            }
        }
        let dev = self.devices.get_mut(&key)?;
        if dev.removed {
            return None;
        }
        dev.removed = true;
        Some(key)
    }

    /// Drop the removed device's secondary-index entries. The `name`/`mac`
    /// fields stay behind so the teardown notification can still reach
    /// node/ifname/mac subscribers; [`DeviceTable::clear_names`] wipes them
    /// afterwards.
    pub fn drop_index_entries(&mut self, key: &str) {
        let Some(dev) = self.devices.get(key) else {
            return;
        };
        if dev.subsystem == "net" {
            info!("drop netif '{}' (mac: '{}')", dev.name, dev.mac);
            if !dev.name.is_empty() {
                remove_index_entry(&mut self.ifname_index, &dev.name, key);
            }
            if !dev.mac.is_empty() {
                remove_index_entry(&mut self.mac_index, &dev.mac, key);
            }
        } else {
            info!("drop {} '{}'", dev.subsystem, dev.name);
            if !dev.name.is_empty() {
                remove_index_entry(&mut self.node_index, &dev.name, key);
            }
        }
    }

    /// Forget the last known name/MAC once the teardown notification has
    /// been delivered.
    pub fn clear_names(&mut self, key: &str) {
        if let Some(dev) = self.devices.get_mut(key) {
            dev.name.clear();
            dev.mac.clear();
        }
    }

    /// Resolve a query to the current status byte. A device that is being
    /// processed by the supervisor bridge reports "not yet available";
    /// its `1` follows once the wiring has completed.
    pub fn resolve(&self, kind: QueryKind, value: &[u8]) -> u8 {
        match self.lookup_key(kind, value) {
            Some(key) => {
                let dev = &self.devices[key];
                if dev.removed || dev.processing {
                    STATUS_UNAVAILABLE
                } else {
                    STATUS_AVAILABLE
                }
            }
            None => STATUS_UNAVAILABLE,
        }
    }

    fn lookup_key(&self, kind: QueryKind, value: &[u8]) -> Option<&String> {
        let value = std::str::from_utf8(value).ok()?;
        match kind {
            QueryKind::Syspath | QueryKind::Usb => {
                self.devices.get_key_value(value).map(|(k, _)| k)
            }
            QueryKind::Ifname => self.ifname_index.get(value),
            QueryKind::Mac => self.mac_index.get(value),
            QueryKind::Node => match self.node_index.get(value) {
                Some(key) => Some(key),
                None => {
                    let resolved = resolve_symlink(Path::new(value))?;
                    self.node_index.get(resolved.to_str()?)
                }
            },
        }
    }
}

fn remove_index_entry(index: &mut HashMap<String, String>, name: &str, key: &str) {
    if index.get(name).map(String::as_str) == Some(key) {
        index.remove(name);
    }
}

/// If `path` is a symbolic link, resolve it fully.
fn resolve_symlink(path: &Path) -> Option<PathBuf> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    std::fs::canonicalize(path).ok()
}

/// Does a `dev` query value designate `node`, either literally or through
/// a symbolic link? Used when matching notifications to subscriptions.
pub fn node_matches(query: &[u8], node: &str) -> bool {
    if query == node.as_bytes() {
        return true;
    }
    let Ok(query) = std::str::from_utf8(query) else {
        return false;
    };
    match resolve_symlink(Path::new(query)) {
        Some(resolved) => resolved == Path::new(node),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devsrc::DeviceDesc;

    fn block_desc(syspath: &str, node: &str) -> DeviceDesc {
        DeviceDesc {
            syspath: syspath.to_string(),
            subsystem: "block".to_string(),
            devnode: Some(node.to_string()),
            sysname: syspath.rsplit('/').next().unwrap_or_default().to_string(),
            ..Default::default()
        }
    }

    fn net_desc(syspath: &str, ifname: &str, mac: &str) -> DeviceDesc {
        DeviceDesc {
            syspath: syspath.to_string(),
            subsystem: "net".to_string(),
            sysname: ifname.to_string(),
            mac: Some(mac.to_string()),
            ..Default::default()
        }
    }

    fn usb_desc(syspath: &str, vendor: &str, product: &str, devnum: u64) -> DeviceDesc {
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

    #[test]
    fn test_block_device_lifecycle() {
        let mut table = DeviceTable::default();
        let mut registry = SubscriberRegistry::default();
        let desc = block_desc("/sys/block/sda/sda1", "/dev/sda1");

        let (key, changes) = table.upsert(&desc, &mut registry, false).unwrap();
        assert_eq!(key, "/sys/block/sda/sda1");
        assert!(changes.fresh);
        assert_eq!(
            table.resolve(QueryKind::Node, b"/dev/sda1"),
            STATUS_AVAILABLE
        );
        assert_eq!(table.resolve(QueryKind::Syspath, key.as_bytes()), STATUS_AVAILABLE);

        // duplicate add changes nothing
        let (_, changes) = table.upsert(&desc, &mut registry, true).unwrap();
        assert!(!changes.fresh);
        assert!(!changes.renamed);

        let removed = table.begin_remove(&desc).unwrap();
        assert_eq!(removed, key);
        table.drop_index_entries(&removed);
        assert_eq!(
            table.resolve(QueryKind::Node, b"/dev/sda1"),
            STATUS_UNAVAILABLE
        );
        // a second remove for the same device is ignored
        assert!(table.begin_remove(&desc).is_none());

        // the last known name survives until the teardown notification
        assert_eq!(table.get(&removed).unwrap().name, "/dev/sda1");
        table.clear_names(&removed);
        assert!(table.get(&removed).unwrap().name.is_empty());
    }

    #[test]
    fn test_node_rename_reindexes() {
        let mut table = DeviceTable::default();
        let mut registry = SubscriberRegistry::default();
        let desc = block_desc("/sys/block/sdb", "/dev/sdb");
        let (key, _) = table.upsert(&desc, &mut registry, false).unwrap();

        let renamed = block_desc("/sys/block/sdb", "/dev/sdb1");
        let (_, changes) = table.upsert(&renamed, &mut registry, true).unwrap();
        assert!(changes.renamed);
        assert_eq!(table.resolve(QueryKind::Node, b"/dev/sdb"), STATUS_UNAVAILABLE);
        assert_eq!(table.resolve(QueryKind::Node, b"/dev/sdb1"), STATUS_AVAILABLE);
        assert_eq!(table.get(&key).unwrap().name, "/dev/sdb1");
    }

    #[test]
    fn test_net_indexes() {
        let mut table = DeviceTable::default();
        let mut registry = SubscriberRegistry::default();
        let desc = net_desc("/sys/class/net/eth0", "eth0", "aa:bb:cc:dd:ee:ff");
        let (key, _) = table.upsert(&desc, &mut registry, false).unwrap();

        assert_eq!(table.resolve(QueryKind::Ifname, b"eth0"), STATUS_AVAILABLE);
        assert_eq!(
            table.resolve(QueryKind::Mac, b"aa:bb:cc:dd:ee:ff"),
            STATUS_AVAILABLE
        );

        // rename moves both indexes
        let renamed = net_desc("/sys/class/net/eth0", "lan0", "aa:bb:cc:dd:ee:ff");
        let (_, changes) = table.upsert(&renamed, &mut registry, true).unwrap();
        assert!(changes.renamed);
        assert_eq!(table.resolve(QueryKind::Ifname, b"eth0"), STATUS_UNAVAILABLE);
        assert_eq!(table.resolve(QueryKind::Ifname, b"lan0"), STATUS_AVAILABLE);

        table.begin_remove(&renamed).unwrap();
        table.drop_index_entries(&key);
        assert_eq!(table.resolve(QueryKind::Ifname, b"lan0"), STATUS_UNAVAILABLE);
        assert_eq!(
            table.resolve(QueryKind::Mac, b"aa:bb:cc:dd:ee:ff"),
            STATUS_UNAVAILABLE
        );
    }

    #[test]
    fn test_usb_reference_counting() {
        let mut table = DeviceTable::default();
        let mut registry = SubscriberRegistry::default();
        let first = usb_desc("/sys/bus/usb/1-1", "1d6b", "0003", 0xc001);
        let second = usb_desc("/sys/bus/usb/2-1", "1d6b", "0003", 0xc002);

        let (key, changes) = table.upsert(&first, &mut registry, false).unwrap();
        assert_eq!(key, "1d6b:0003");
        assert!(changes.fresh);
        let (key2, changes) = table.upsert(&second, &mut registry, false).unwrap();
        assert_eq!(key2, key);
        assert!(!changes.fresh);
        assert_eq!(table.get(&key).unwrap().devset.len(), 2);
        assert_eq!(table.resolve(QueryKind::Usb, b"1d6b:0003"), STATUS_AVAILABLE);
        // the synthetic key answers syspath queries too
        assert_eq!(table.resolve(QueryKind::Syspath, b"1d6b:0003"), STATUS_AVAILABLE);

        // removing one backing device does not tear the record down
        assert!(table.begin_remove(&first).is_none());
        assert_eq!(table.resolve(QueryKind::Usb, b"1d6b:0003"), STATUS_AVAILABLE);

        // removing the last one does
        let removed = table.begin_remove(&second).unwrap();
        assert_eq!(removed, key);
        assert_eq!(table.resolve(QueryKind::Usb, b"1d6b:0003"), STATUS_UNAVAILABLE);
    }

    #[test]
    fn test_usb_without_identity_ignored() {
        let mut table = DeviceTable::default();
        let mut registry = SubscriberRegistry::default();
        let mut desc = usb_desc("/sys/bus/usb/1-1", "1d6b", "0003", 7);
        desc.product_id = None;
        assert!(table.upsert(&desc, &mut registry, false).is_none());
    }

    #[test]
    fn test_processing_gates_resolution() {
        let mut table = DeviceTable::default();
        let mut registry = SubscriberRegistry::default();
        let desc = block_desc("/sys/x", "/dev/x");
        let (key, _) = table.upsert(&desc, &mut registry, false).unwrap();

        table.get_mut(&key).unwrap().processing = true;
        assert_eq!(table.resolve(QueryKind::Syspath, b"/sys/x"), STATUS_UNAVAILABLE);
        assert_eq!(table.resolve(QueryKind::Node, b"/dev/x"), STATUS_UNAVAILABLE);

        table.get_mut(&key).unwrap().processing = false;
        assert_eq!(table.resolve(QueryKind::Syspath, b"/sys/x"), STATUS_AVAILABLE);
    }

    #[test]
    fn test_symlink_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sda1");
        std::fs::write(&target, b"").unwrap();
        let link = dir.path().join("by-label-root");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let mut table = DeviceTable::default();
        let mut registry = SubscriberRegistry::default();
        let desc = block_desc("/sys/block/sda/sda1", target.to_str().unwrap());
        table.upsert(&desc, &mut registry, false).unwrap();

        let link_bytes = link.as_os_str().as_encoded_bytes();
        assert_eq!(table.resolve(QueryKind::Node, link_bytes), STATUS_AVAILABLE);
        assert!(node_matches(link_bytes, target.to_str().unwrap()));
        assert!(!node_matches(b"/dev/other", target.to_str().unwrap()));

        // a dangling value that is not a link does not match
        assert_eq!(
            table.resolve(QueryKind::Node, b"/dev/nonexistent"),
            STATUS_UNAVAILABLE
        );
    }
}
