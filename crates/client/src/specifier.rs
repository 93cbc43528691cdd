//! Dependency specifier grammar
//!
//! A specifier names the device a service depends on:
//!
//! - `LABEL=x`, `UUID=x`, `PARTLABEL=x`, `PARTUUID=x`, `ID=x` -- a disk
//!   alias, turned into the corresponding `/dev/disk/by-*/x` node query
//! - `/dev/...` -- a device node query
//! - `/sys/...` -- a syspath query
//! - `netif:<name>` -- a network interface query
//! - `mac:<addr>` -- a MAC address query (lowercase colon form)
//! - `usb:<vendor>:<product>` -- a USB identity query (lowercase hex)

use anyhow::{bail, Result};
use protocol::QueryKind;

const DISK_ALIASES: [(&str, &str); 5] = [
    ("LABEL=", "by-label"),
    ("UUID=", "by-uuid"),
    ("PARTLABEL=", "by-partlabel"),
    ("PARTUUID=", "by-partuuid"),
    ("ID=", "by-id"),
];

/// Parse a specifier into the query to send to the broker.
pub fn parse(input: &str) -> Result<(QueryKind, String)> {
    for (prefix, dir) in DISK_ALIASES {
        if let Some(value) = input.strip_prefix(prefix) {
            if value.is_empty() {
                bail!("empty value in specifier '{}'", input);
            }
            return Ok((QueryKind::Node, format!("/dev/disk/{}/{}", dir, value)));
        }
    }
    if input.starts_with("/dev/") {
        return Ok((QueryKind::Node, input.to_string()));
    }
    if input.starts_with("/sys/") {
        return Ok((QueryKind::Syspath, input.to_string()));
    }
    for (prefix, kind) in [
        ("netif:", QueryKind::Ifname),
        ("mac:", QueryKind::Mac),
        ("usb:", QueryKind::Usb),
    ] {
        if let Some(value) = input.strip_prefix(prefix) {
            if value.is_empty() {
                bail!("empty value in specifier '{}'", input);
            }
            return Ok((kind, value.to_string()));
        }
    }
    bail!("invalid device specifier '{}'", input);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_aliases() {
        let (kind, value) = parse("LABEL=root").unwrap();
        assert_eq!(kind, QueryKind::Node);
        assert_eq!(value, "/dev/disk/by-label/root");

        let (kind, value) = parse("UUID=0eae7f67-34e1-4f32-a6b7-9b203a21bb32").unwrap();
        assert_eq!(kind, QueryKind::Node);
        assert_eq!(value, "/dev/disk/by-uuid/0eae7f67-34e1-4f32-a6b7-9b203a21bb32");

        assert_eq!(parse("PARTLABEL=esp").unwrap().1, "/dev/disk/by-partlabel/esp");
        assert_eq!(parse("PARTUUID=00ff").unwrap().1, "/dev/disk/by-partuuid/00ff");
        assert_eq!(parse("ID=ata-Disk_A1").unwrap().1, "/dev/disk/by-id/ata-Disk_A1");
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            parse("/dev/sda1").unwrap(),
            (QueryKind::Node, "/dev/sda1".to_string())
        );
        assert_eq!(
            parse("/sys/block/sda").unwrap(),
            (QueryKind::Syspath, "/sys/block/sda".to_string())
        );
    }

    #[test]
    fn test_prefixed_kinds() {
        assert_eq!(
            parse("netif:eth0").unwrap(),
            (QueryKind::Ifname, "eth0".to_string())
        );
        assert_eq!(
            parse("mac:aa:bb:cc:dd:ee:ff").unwrap(),
            (QueryKind::Mac, "aa:bb:cc:dd:ee:ff".to_string())
        );
        // the vendor:product pair stays intact
        assert_eq!(
            parse("usb:1d6b:0003").unwrap(),
            (QueryKind::Usb, "1d6b:0003".to_string())
        );
    }

    #[test]
    fn test_rejects() {
        assert!(parse("").is_err());
        assert!(parse("sda1").is_err());
        assert!(parse("dev/sda1").is_err());
        assert!(parse("LABEL=").is_err());
        assert!(parse("netif:").is_err());
        assert!(parse("label=root").is_err());
    }
}
