use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;
use subdevil_core::{DeviceError, RawDeviceInfo, ScanSink};

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

#[derive(Debug, Deserialize)]
struct WindowsDisk {
    #[serde(rename = "Number")]
    number: u32,
    #[serde(rename = "FriendlyName")]
    friendly_name: Option<String>,
    #[serde(rename = "Manufacturer")]
    manufacturer: Option<String>,
    #[serde(rename = "SerialNumber")]
    serial_number: Option<String>,
    #[serde(rename = "Size")]
    size: Option<u64>,
    #[serde(rename = "BusType")]
    bus_type: Option<Value>,
    #[serde(rename = "Path")]
    path: Option<String>,
    #[serde(rename = "IsSystem", default)]
    is_system: bool,
    #[serde(rename = "IsBoot", default)]
    is_boot: bool,
}

#[derive(Debug, Deserialize)]
struct WindowsPartition {
    #[serde(rename = "DiskNumber")]
    disk_number: u32,
    #[serde(rename = "PartitionNumber")]
    partition_number: u32,
    #[serde(rename = "DriveLetter")]
    drive_letter: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WindowsVolume {
    #[serde(rename = "DriveLetter")]
    drive_letter: Option<Value>,
    #[serde(rename = "FileSystemLabel")]
    file_system_label: Option<String>,
    #[serde(rename = "Size")]
    size: Option<u64>,
    #[serde(rename = "SizeRemaining")]
    size_remaining: Option<u64>,
}

/// `BusType` arrives as its enum name from PowerShell 7 and as the raw
/// STORAGE_BUS_TYPE code from Windows PowerShell.
fn bus_name(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(name)) => Some(name.clone()),
        Some(Value::Number(code)) => Some(
            match code.as_u64()? {
                7 => "USB",
                12 => "SD",
                13 => "MMC",
                17 => "NVMe",
                11 => "SATA",
                _ => "Other",
            }
            .to_string(),
        ),
        _ => None,
    }
}

/// Drive letters serialize as a string or as a UTF-16 code unit.
fn drive_letter(value: &Option<Value>) -> Option<char> {
    let letter = match value {
        Some(Value::String(s)) => s.chars().next()?,
        Some(Value::Number(n)) => char::from_u32(n.as_u64()? as u32)?,
        _ => return None,
    };
    letter.is_ascii_alphabetic().then(|| letter.to_ascii_uppercase())
}

/// ConvertTo-Json emits a bare object when there is exactly one result.
fn parse_list<T: DeserializeOwned>(json: &str) -> Result<Vec<T>, DeviceError> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    if json.starts_with('[') {
        Ok(serde_json::from_str(json)?)
    } else {
        Ok(vec![serde_json::from_str(json)?])
    }
}

fn powershell(script: &str) -> Result<String, DeviceError> {
    let mut cmd = Command::new("powershell.exe");

    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let output = cmd
        .args(["-NoProfile", "-NonInteractive", "-Command", script])
        .output()
        .map_err(|e| DeviceError::Probe(format!("Failed to run PowerShell: {}", e)))?;

    if !output.status.success() {
        return Err(DeviceError::Probe(format!(
            "PowerShell command failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn is_removable_bus(bus: Option<&str>) -> bool {
    matches!(
        bus.map(str::to_uppercase).as_deref(),
        Some("USB") | Some("SD") | Some("MMC")
    )
}

pub(crate) fn assemble(
    disks_json: &str,
    partitions_json: &str,
    volumes_json: &str,
) -> Result<Vec<RawDeviceInfo>, DeviceError> {
    let disks: Vec<WindowsDisk> = parse_list(disks_json)?;
    let partitions: Vec<WindowsPartition> = parse_list(partitions_json)?;
    let volumes: HashMap<char, WindowsVolume> = parse_list::<WindowsVolume>(volumes_json)?
        .into_iter()
        .filter_map(|v| Some((drive_letter(&v.drive_letter)?, v)))
        .collect();

    let mut devices = Vec::new();
    for disk in disks {
        let bus = bus_name(&disk.bus_type);
        if disk.is_system || disk.is_boot || !is_removable_bus(bus.as_deref()) {
            continue;
        }

        let mut lettered: Vec<(u32, char)> = partitions
            .iter()
            .filter(|p| p.disk_number == disk.number)
            .filter_map(|p| Some((p.partition_number, drive_letter(&p.drive_letter)?)))
            .collect();
        lettered.sort();
        let letter = lettered.first().map(|(_, letter)| *letter);
        let volume = letter.and_then(|l| volumes.get(&l));

        let device_path = format!("\\\\.\\PhysicalDrive{}", disk.number);
        devices.push(RawDeviceInfo {
            bus_path: disk
                .path
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| device_path.clone()),
            device_path,
            serial_number: disk
                .serial_number
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            volume_path: letter.map(|l| format!("\\\\.\\{}:", l)),
            label: volume.and_then(|v| v.file_system_label.clone()),
            mount_point: letter.map(|l| PathBuf::from(format!("{}:\\", l))),
            capacity_bytes: disk.size.or_else(|| volume.and_then(|v| v.size)),
            used_bytes: volume.and_then(|v| Some(v.size?.saturating_sub(v.size_remaining?))),
            bus_type: bus,
            removable: true,
            vendor_id: None,
            product_id: None,
            product: disk.friendly_name.clone(),
            manufacturer: disk
                .manufacturer
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        });
    }
    Ok(devices)
}

#[derive(Default)]
pub(crate) struct WindowsScanner;

impl WindowsScanner {
    pub fn scan(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        let disks = powershell(
            "Get-Disk | Select-Object Number, FriendlyName, Manufacturer, SerialNumber, Size, BusType, Path, IsSystem, IsBoot | ConvertTo-Json",
        )?;
        if sink.is_cancelled() {
            return Ok(());
        }
        let partitions = powershell(
            "Get-Partition | Where-Object DriveLetter | Select-Object DiskNumber, PartitionNumber, DriveLetter | ConvertTo-Json",
        )?;
        if sink.is_cancelled() {
            return Ok(());
        }
        let volumes = powershell(
            "Get-Volume | Where-Object DriveLetter | Select-Object DriveLetter, FileSystemLabel, Size, SizeRemaining | ConvertTo-Json",
        )?;

        for info in assemble(&disks, &partitions, &volumes)? {
            tracing::debug!(device = %info.device_path, bus = ?info.bus_type, mount = ?info.mount_point, "found removable disk");
            sink.push(info);
        }
        Ok(())
    }
}
