use crate::unix::used_bytes;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Command;
use subdevil_core::{DeviceError, RawDeviceInfo, ScanSink};

/// `diskutil list -plist`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DiskList {
    #[serde(default)]
    pub all_disks_and_partitions: Vec<DiskEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DiskEntry {
    pub device_identifier: String,
    pub mount_point: Option<String>,
    pub volume_name: Option<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionEntry>,
    #[serde(rename = "APFSVolumes", default)]
    pub apfs_volumes: Vec<PartitionEntry>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct PartitionEntry {
    pub device_identifier: String,
    pub mount_point: Option<String>,
    pub volume_name: Option<String>,
}

/// `diskutil info -plist <disk>`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct DiskInfo {
    pub device_node: Option<String>,
    pub bus_protocol: Option<String>,
    pub media_name: Option<String>,
    pub device_tree_path: Option<String>,
    pub total_size: Option<u64>,
    pub size: Option<u64>,
    pub internal: Option<bool>,
    pub removable: Option<bool>,
    pub removable_media: Option<bool>,
    pub ejectable: Option<bool>,
    #[serde(rename = "IORegistryEntryName")]
    pub io_registry_entry_name: Option<String>,
}

impl DiskInfo {
    pub fn is_removable(&self) -> bool {
        self.internal == Some(false)
            || self.removable.unwrap_or(false)
            || self.removable_media.unwrap_or(false)
            || self.ejectable.unwrap_or(false)
    }
}

fn diskutil_plist<T: for<'de> Deserialize<'de>>(args: &[&str]) -> Result<T, DeviceError> {
    let output = Command::new("diskutil")
        .args(args)
        .output()
        .map_err(|e| DeviceError::Probe(format!("Failed to run diskutil: {}", e)))?;

    if !output.status.success() {
        return Err(DeviceError::Probe(format!(
            "diskutil {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    plist::from_bytes(&output.stdout)
        .map_err(|e| DeviceError::Probe(format!("Unreadable diskutil output: {}", e)))
}

/// Combine the list entry for one whole disk with its `diskutil info`.
pub(crate) fn to_raw(entry: &DiskEntry, info: &DiskInfo) -> RawDeviceInfo {
    let device_path = info
        .device_node
        .clone()
        .unwrap_or_else(|| format!("/dev/{}", entry.device_identifier));

    let volumes = entry.partitions.iter().chain(entry.apfs_volumes.iter());
    let mounted = volumes
        .clone()
        .find(|p| p.mount_point.as_deref().map_or(false, |m| !m.is_empty()));

    let (volume_path, label, mount_point) = match (entry.mount_point.as_deref(), mounted) {
        (Some(mount), _) if !mount.is_empty() => (
            Some(device_path.clone()),
            entry.volume_name.clone(),
            Some(PathBuf::from(mount)),
        ),
        (_, Some(part)) => (
            Some(format!("/dev/{}", part.device_identifier)),
            part.volume_name.clone(),
            part.mount_point.as_ref().map(PathBuf::from),
        ),
        _ => {
            let first = entry.partitions.first();
            (
                first.map(|p| format!("/dev/{}", p.device_identifier)),
                volumes.filter_map(|p| p.volume_name.clone()).next(),
                None,
            )
        }
    };

    RawDeviceInfo {
        bus_path: info
            .device_tree_path
            .clone()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| device_path.clone()),
        device_path,
        serial_number: None,
        volume_path,
        label,
        mount_point,
        capacity_bytes: info.total_size.or(info.size),
        used_bytes: None,
        bus_type: info.bus_protocol.clone(),
        removable: info.is_removable(),
        vendor_id: None,
        product_id: None,
        product: info
            .media_name
            .clone()
            .or_else(|| info.io_registry_entry_name.clone()),
        manufacturer: None,
    }
}

#[derive(Default)]
pub(crate) struct MacScanner;

impl MacScanner {
    pub fn scan(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        let list: DiskList = diskutil_plist(&["list", "-plist", "external", "physical"])?;

        for entry in &list.all_disks_and_partitions {
            if sink.is_cancelled() {
                break;
            }

            let info: DiskInfo = match diskutil_plist(&["info", "-plist", &entry.device_identifier]) {
                Ok(info) => info,
                Err(err) => {
                    tracing::warn!(disk = %entry.device_identifier, error = %err, "skipping disk");
                    continue;
                }
            };
            if !info.is_removable() {
                continue;
            }

            let mut raw = to_raw(entry, &info);
            raw.used_bytes = raw.mount_point.as_deref().and_then(used_bytes);
            tracing::debug!(device = %raw.device_path, bus = ?raw.bus_type, mount = ?raw.mount_point, "found removable disk");
            sink.push(raw);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>AllDisksAndPartitions</key>
    <array>
        <dict>
            <key>Content</key><string>FDisk_partition_scheme</string>
            <key>DeviceIdentifier</key><string>disk4</string>
            <key>Partitions</key>
            <array>
                <dict>
                    <key>DeviceIdentifier</key><string>disk4s1</string>
                    <key>MountPoint</key><string>/Volumes/STICK</string>
                    <key>VolumeName</key><string>STICK</string>
                </dict>
            </array>
            <key>Size</key><integer>16008609792</integer>
        </dict>
    </array>
    <key>WholeDisks</key>
    <array><string>disk4</string></array>
</dict>
</plist>"#;

    const INFO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<dict>
    <key>BusProtocol</key><string>USB</string>
    <key>DeviceNode</key><string>/dev/disk4</string>
    <key>DeviceTreePath</key><string>IODeviceTree:/arm-io@10F00000/usb-drd1@2280000</string>
    <key>Ejectable</key><true/>
    <key>Internal</key><false/>
    <key>MediaName</key><string>SanDisk Ultra</string>
    <key>RemovableMedia</key><true/>
    <key>TotalSize</key><integer>16008609792</integer>
</dict>
</plist>"#;

    #[test]
    fn test_diskutil_plists_become_raw_info() {
        let list: DiskList = plist::from_bytes(LIST.as_bytes()).unwrap();
        let info: DiskInfo = plist::from_bytes(INFO.as_bytes()).unwrap();
        assert!(info.is_removable());

        let raw = to_raw(&list.all_disks_and_partitions[0], &info);
        assert_eq!(raw.device_path, "/dev/disk4");
        assert_eq!(raw.volume_path.as_deref(), Some("/dev/disk4s1"));
        assert_eq!(raw.mount_point, Some(PathBuf::from("/Volumes/STICK")));
        assert_eq!(raw.label.as_deref(), Some("STICK"));
        assert_eq!(raw.capacity_bytes, Some(16_008_609_792));
        assert_eq!(raw.bus_type.as_deref(), Some("USB"));
        assert_eq!(raw.product.as_deref(), Some("SanDisk Ultra"));
        assert!(raw.bus_path.starts_with("IODeviceTree:"));
    }

    #[test]
    fn test_unmounted_disk_keeps_first_partition() {
        let entry = DiskEntry {
            device_identifier: "disk5".to_string(),
            partitions: vec![PartitionEntry {
                device_identifier: "disk5s1".to_string(),
                mount_point: None,
                volume_name: Some("CARD".to_string()),
            }],
            ..Default::default()
        };
        let raw = to_raw(&entry, &DiskInfo::default());
        assert_eq!(raw.device_path, "/dev/disk5");
        assert_eq!(raw.bus_path, "/dev/disk5");
        assert_eq!(raw.mount_point, None);
        assert_eq!(raw.volume_path.as_deref(), Some("/dev/disk5s1"));
        assert_eq!(raw.label.as_deref(), Some("CARD"));
    }
}
