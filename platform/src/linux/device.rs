use crate::unix::used_bytes;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use subdevil_core::{DeviceError, RawDeviceInfo, ScanSink};

const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,TYPE,RM,HOTPLUG,TRAN,SERIAL,LABEL,MOUNTPOINT,VENDOR,MODEL";

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    blockdevices: Vec<LsblkNode>,
}

/// One row of `lsblk --json`. Older util-linux releases print flags and
/// sizes as strings, newer ones as JSON booleans and numbers.
#[derive(Debug, Default, Deserialize)]
struct LsblkNode {
    name: String,
    path: Option<String>,
    size: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<String>,
    rm: Option<Value>,
    hotplug: Option<Value>,
    tran: Option<String>,
    serial: Option<String>,
    label: Option<String>,
    mountpoint: Option<String>,
    vendor: Option<String>,
    model: Option<String>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

impl LsblkNode {
    fn node_path(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }

    /// The first mounted node in this subtree, the disk itself included.
    fn mounted(&self) -> Option<(&LsblkNode, PathBuf)> {
        if let Some(mount) = self.mountpoint.as_deref().filter(|m| !m.is_empty()) {
            if !mount.starts_with('[') {
                return Some((self, PathBuf::from(mount)));
            }
        }
        self.children.iter().find_map(LsblkNode::mounted)
    }
}

fn flag(value: &Option<Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim() == "1",
        Some(Value::Number(n)) => n.as_u64() == Some(1),
        _ => false,
    }
}

fn bytes(value: &Option<Value>) -> Option<u64> {
    match value {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn is_virtual(name: &str) -> bool {
    name.starts_with("loop") || name.starts_with("ram") || name.starts_with("zram")
}

/// Where a block device sits on the bus, plus the USB descriptors of
/// the nearest ancestor carrying `idVendor`. The bus path stays at the
/// SCSI/LUN node so every slot of a multi-LUN reader keeps its own.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct UsbIdentity {
    pub bus_path: Option<String>,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}

pub(crate) fn usb_identity(sys_block: &Path, name: &str) -> UsbIdentity {
    let Ok(device) = fs::canonicalize(sys_block.join(name).join("device")) else {
        return UsbIdentity::default();
    };
    let bus_path = Some(device.to_string_lossy().into_owned());

    let read = |dir: &Path, file: &str| {
        fs::read_to_string(dir.join(file))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    for dir in device.ancestors() {
        if let Some(vendor) = read(dir, "idVendor") {
            return UsbIdentity {
                bus_path,
                vendor_id: u16::from_str_radix(&vendor, 16).ok(),
                product_id: read(dir, "idProduct").and_then(|p| u16::from_str_radix(&p, 16).ok()),
                manufacturer: read(dir, "manufacturer"),
                product: read(dir, "product"),
                serial: read(dir, "serial"),
            };
        }
        if dir == Path::new("/sys/devices") {
            break;
        }
    }

    UsbIdentity {
        bus_path,
        ..Default::default()
    }
}

pub(crate) fn parse_lsblk(json: &str) -> Result<Vec<(RawDeviceInfo, String)>, DeviceError> {
    let output: LsblkOutput = serde_json::from_str(json)?;
    let mut devices = Vec::new();

    for disk in output.blockdevices {
        if disk.kind.as_deref() != Some("disk") || is_virtual(&disk.name) {
            continue;
        }

        let tran = disk
            .tran
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| disk.name.starts_with("mmcblk").then(|| "mmc".to_string()));
        let removable = flag(&disk.rm)
            || flag(&disk.hotplug)
            || matches!(tran.as_deref(), Some("usb") | Some("mmc"));
        if !removable {
            continue;
        }

        let device_path = disk.node_path();
        let (volume_path, label, mount_point) = match disk.mounted() {
            Some((node, mount)) => (Some(node.node_path()), node.label.clone(), Some(mount)),
            None => (
                disk.children.first().map(LsblkNode::node_path),
                disk.label
                    .clone()
                    .or_else(|| disk.children.iter().find_map(|c| c.label.clone())),
                None,
            ),
        };

        let info = RawDeviceInfo {
            bus_path: device_path.clone(),
            device_path,
            serial_number: disk.serial.clone(),
            volume_path,
            label,
            mount_point,
            capacity_bytes: bytes(&disk.size),
            used_bytes: None,
            bus_type: tran,
            removable,
            vendor_id: None,
            product_id: None,
            product: disk.model.clone(),
            manufacturer: disk.vendor.clone(),
        };
        devices.push((info, disk.name));
    }

    Ok(devices)
}

/// Undo the octal escapes `/proc/mounts` uses for whitespace.
fn unescape_mount(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(code as char);
                    for _ in 0..3 {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(ch);
    }
    out
}

/// `(source, mount point)` pairs from a mounts table.
pub(crate) fn parse_mounts(table: &str) -> Vec<(String, PathBuf)> {
    table
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let source = parts.next()?;
            let target = parts.next()?;
            Some((unescape_mount(source), PathBuf::from(unescape_mount(target))))
        })
        .collect()
}

pub(crate) fn read_mounts() -> Vec<(String, PathBuf)> {
    fs::read_to_string("/proc/self/mounts")
        .map(|table| parse_mounts(&table))
        .unwrap_or_default()
}

pub(crate) struct LinuxScanner {
    pub sys_block: PathBuf,
}

impl Default for LinuxScanner {
    fn default() -> Self {
        Self {
            sys_block: PathBuf::from("/sys/block"),
        }
    }
}

impl LinuxScanner {
    pub fn scan(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        match self.scan_lsblk(sink) {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(error = %err, "lsblk unavailable, falling back to /sys/block");
                self.scan_sysfs(sink)
            }
        }
    }

    fn scan_lsblk(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        let output = Command::new("lsblk")
            .args(["--json", "--bytes", "--output", LSBLK_COLUMNS])
            .output()
            .map_err(|e| DeviceError::Probe(format!("Failed to run lsblk: {}", e)))?;

        if !output.status.success() {
            return Err(DeviceError::Probe(format!(
                "lsblk failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let json = String::from_utf8_lossy(&output.stdout);
        for (mut info, name) in parse_lsblk(&json)? {
            if sink.is_cancelled() {
                break;
            }
            self.enrich(&mut info, &name);
            tracing::debug!(device = %info.device_path, bus = ?info.bus_type, mount = ?info.mount_point, "found removable disk");
            sink.push(info);
        }
        Ok(())
    }

    fn scan_sysfs(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        let entries = fs::read_dir(&self.sys_block)
            .map_err(|e| DeviceError::Probe(format!("Failed to read {}: {}", self.sys_block.display(), e)))?;
        let mounts = read_mounts();

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !is_virtual(name))
            .collect();
        names.sort();

        for name in names {
            if sink.is_cancelled() {
                break;
            }
            let dir = self.sys_block.join(&name);
            let read = |file: &str| {
                fs::read_to_string(dir.join(file))
                    .ok()
                    .map(|s| s.trim().to_string())
            };

            let removable = read("removable").as_deref() == Some("1");
            let is_mmc = name.starts_with("mmcblk");
            if !removable && !is_mmc {
                continue;
            }

            let device_path = format!("/dev/{}", name);
            let mounted = mounts
                .iter()
                .find(|(source, _)| source.starts_with(&device_path));

            let mut info = RawDeviceInfo {
                bus_path: device_path.clone(),
                device_path: device_path.clone(),
                volume_path: mounted.map(|(source, _)| source.clone()),
                mount_point: mounted.map(|(_, target)| target.clone()),
                capacity_bytes: read("size")
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|sectors| sectors * 512),
                bus_type: if is_mmc { Some("mmc".to_string()) } else { None },
                removable: true,
                product: read("device/model").filter(|m| !m.is_empty()),
                manufacturer: read("device/vendor").filter(|v| !v.is_empty()),
                ..Default::default()
            };
            self.enrich(&mut info, &name);
            if info.bus_type.is_none() && info.vendor_id.is_some() {
                info.bus_type = Some("usb".to_string());
            }
            sink.push(info);
        }
        Ok(())
    }

    /// Fill in what lsblk does not report: USB ids, the stable bus path
    /// and filesystem usage.
    fn enrich(&self, info: &mut RawDeviceInfo, name: &str) {
        let usb = usb_identity(&self.sys_block, name);
        if let Some(bus_path) = usb.bus_path {
            info.bus_path = bus_path;
        }
        info.vendor_id = info.vendor_id.or(usb.vendor_id);
        info.product_id = info.product_id.or(usb.product_id);
        if usb.manufacturer.is_some() {
            info.manufacturer = usb.manufacturer;
        }
        if usb.product.is_some() {
            info.product = usb.product;
        }
        if info.serial_number.as_deref().map_or(true, str::is_empty) {
            info.serial_number = usb.serial;
        }
        info.used_bytes = info.mount_point.as_deref().and_then(used_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use subdevil_core::normalize::device_id;
    use subdevil_core::BusType;

    const LSBLK_NEW: &str = r#"{
       "blockdevices": [
          {"name":"sda", "path":"/dev/sda", "size":512110190592, "type":"disk", "rm":false, "hotplug":false, "tran":"nvme", "serial":"S4EWNX0N", "label":null, "mountpoint":null, "vendor":null, "model":"Samsung SSD 970",
             "children": [
                {"name":"sda1", "path":"/dev/sda1", "size":536870912, "type":"part", "rm":false, "hotplug":false, "tran":null, "serial":null, "label":null, "mountpoint":"/boot/efi", "vendor":null, "model":null}
             ]
          },
          {"name":"sdb", "path":"/dev/sdb", "size":16008609792, "type":"disk", "rm":true, "hotplug":true, "tran":"usb", "serial":"4C530001", "label":null, "mountpoint":null, "vendor":"SanDisk ", "model":"Ultra",
             "children": [
                {"name":"sdb1", "path":"/dev/sdb1", "size":16007561216, "type":"part", "rm":true, "hotplug":true, "tran":null, "serial":null, "label":"STICK", "mountpoint":"/media/user/STICK", "vendor":null, "model":null}
             ]
          },
          {"name":"loop0", "path":"/dev/loop0", "size":4096, "type":"loop", "rm":false, "hotplug":false, "tran":null, "serial":null, "label":null, "mountpoint":"/snap/core", "vendor":null, "model":null}
       ]
    }"#;

    const LSBLK_OLD: &str = r#"{
       "blockdevices": [
          {"name":"mmcblk0", "size":"31914983424", "type":"disk", "rm":"0", "hotplug":"0", "tran":null, "serial":null, "label":null, "mountpoint":null, "vendor":null, "model":null,
             "children": [
                {"name":"mmcblk0p1", "size":"31910789120", "type":"part", "rm":"0", "hotplug":"0", "tran":null, "serial":null, "label":"CAMERA", "mountpoint":null, "vendor":null, "model":null}
             ]
          }
       ]
    }"#;

    #[test]
    fn test_lsblk_keeps_only_removable_disks() {
        let devices = parse_lsblk(LSBLK_NEW).unwrap();
        assert_eq!(devices.len(), 1);

        let (info, name) = &devices[0];
        assert_eq!(name, "sdb");
        assert_eq!(info.device_path, "/dev/sdb");
        assert_eq!(info.volume_path.as_deref(), Some("/dev/sdb1"));
        assert_eq!(info.mount_point, Some(PathBuf::from("/media/user/STICK")));
        assert_eq!(info.label.as_deref(), Some("STICK"));
        assert_eq!(info.capacity_bytes, Some(16_008_609_792));
        assert_eq!(info.bus_type.as_deref(), Some("usb"));
        assert_eq!(info.serial_number.as_deref(), Some("4C530001"));
        assert!(info.removable);
    }

    #[test]
    fn test_lsblk_old_format_and_sd_cards() {
        let devices = parse_lsblk(LSBLK_OLD).unwrap();
        assert_eq!(devices.len(), 1);

        let (info, _) = &devices[0];
        assert_eq!(info.device_path, "/dev/mmcblk0");
        assert_eq!(info.bus_type.as_deref(), Some("mmc"));
        assert_eq!(info.capacity_bytes, Some(31_914_983_424));
        assert_eq!(info.mount_point, None);
        assert_eq!(info.volume_path.as_deref(), Some("/dev/mmcblk0p1"));
        assert_eq!(info.label.as_deref(), Some("CAMERA"));
    }

    #[test]
    fn test_swap_is_not_a_mount_point() {
        let json = r#"{"blockdevices":[{"name":"sdc","size":8000000000,"type":"disk","rm":true,"mountpoint":null,
            "children":[{"name":"sdc1","size":8000000000,"type":"part","rm":true,"mountpoint":"[SWAP]"}]}]}"#;
        let devices = parse_lsblk(json).unwrap();
        assert_eq!(devices[0].0.mount_point, None);
    }

    #[test]
    fn test_mounts_table_unescapes_spaces() {
        let table = "/dev/sdb1 /media/user/MY\\040STICK vfat rw,nosuid 0 0\nproc /proc proc rw 0 0\n";
        let mounts = parse_mounts(table);
        assert_eq!(
            mounts[0],
            ("/dev/sdb1".to_string(), PathBuf::from("/media/user/MY STICK"))
        );
        assert_eq!(mounts.len(), 2);
    }

    /// `root/devices/usb2/2-1` with one SCSI host and a block device per LUN.
    fn fake_card_reader(root: &Path, luns: &[(&str, &str)]) {
        let usb = root.join("devices/usb2/2-1");
        let host = usb.join("2-1:1.0/host3/target3:0:0");
        fs::create_dir_all(&host).unwrap();
        fs::write(usb.join("idVendor"), "0781\n").unwrap();
        fs::write(usb.join("idProduct"), "5581\n").unwrap();
        fs::write(usb.join("manufacturer"), "SanDisk\n").unwrap();
        fs::write(usb.join("serial"), "4C530001\n").unwrap();

        for (block, lun) in luns {
            let scsi = host.join(lun);
            let dir = root.join("block").join(block);
            fs::create_dir_all(&scsi).unwrap();
            fs::create_dir_all(&dir).unwrap();
            std::os::unix::fs::symlink(&scsi, dir.join("device")).unwrap();
        }
    }

    #[test]
    fn test_usb_identity_reads_the_usb_ancestor() {
        let root = tempfile::tempdir().unwrap();
        fake_card_reader(root.path(), &[("sdb", "3:0:0:0")]);

        let identity = usb_identity(&root.path().join("block"), "sdb");
        assert_eq!(identity.vendor_id, Some(0x0781));
        assert_eq!(identity.product_id, Some(0x5581));
        assert_eq!(identity.manufacturer.as_deref(), Some("SanDisk"));
        assert_eq!(identity.serial.as_deref(), Some("4C530001"));
        assert!(identity.bus_path.unwrap().ends_with("target3:0:0/3:0:0:0"));
    }

    #[test]
    fn test_card_reader_slots_keep_distinct_bus_paths() {
        let root = tempfile::tempdir().unwrap();
        fake_card_reader(root.path(), &[("sdb", "3:0:0:0"), ("sdc", "3:0:0:1")]);
        let sys_block = root.path().join("block");

        let sdb = usb_identity(&sys_block, "sdb");
        let sdc = usb_identity(&sys_block, "sdc");
        assert_eq!(sdb.serial, sdc.serial);
        assert_ne!(sdb.bus_path, sdc.bus_path);

        let scanner = LinuxScanner { sys_block };
        let mut slots = Vec::new();
        for name in ["sdb", "sdc"] {
            let mut info = RawDeviceInfo {
                bus_path: format!("/dev/{}", name),
                device_path: format!("/dev/{}", name),
                bus_type: Some("usb".to_string()),
                removable: true,
                ..Default::default()
            };
            scanner.enrich(&mut info, name);
            slots.push(info);
        }
        assert_eq!(slots[0].serial_number, slots[1].serial_number);
        assert_ne!(slots[0].bus_path, slots[1].bus_path);

        let ids: HashSet<_> = slots
            .iter()
            .map(|slot| device_id(BusType::Usb, &slot.bus_path, slot.serial_number.as_deref()))
            .collect();
        assert_eq!(ids.len(), 2);
    }
}
