use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A removable storage device as tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub label: String,
    /// `None` when the device is not mounted.
    pub mount_point: Option<PathBuf>,
    pub capacity_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub bus_type: BusType,
    pub state: DeviceState,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
    pub serial_number: Option<String>,
    pub device_path: String,
    pub volume_path: Option<String>,
    #[serde(skip)]
    pub(crate) bus_path: String,
}

impl DeviceRecord {
    pub fn is_mounted(&self) -> bool {
        self.state == DeviceState::Mounted
    }

    pub(crate) fn identity(&self) -> (&str, Option<&str>) {
        (&self.bus_path, self.serial_number.as_deref())
    }

    /// Enter a new state, refusing edges the lifecycle does not allow.
    pub(crate) fn transition(&mut self, to: DeviceState) -> Result<DeviceState, DeviceState> {
        if !self.state.can_transition_to(to) {
            return Err(self.state);
        }
        let from = self.state;
        self.state = to;
        Ok(from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusType {
    Usb,
    Sd,
    Thunderbolt,
    Other,
    Unknown,
}

impl BusType {
    /// Map a platform transport string ("usb", "mmc", "Secure Digital",
    /// "Thunderbolt", "SATA", ...) onto the bus enumeration.
    pub fn from_platform(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return BusType::Unknown;
        };

        match raw.to_ascii_lowercase().as_str() {
            "usb" | "usb3" | "usb 3.0" | "usb 2.0" => BusType::Usb,
            "sd" | "mmc" | "sdio" | "sdcard" | "secure digital" => BusType::Sd,
            "thunderbolt" | "thunderbolt 3" | "usb4" => BusType::Thunderbolt,
            "sata" | "ata" | "scsi" | "sas" | "nvme" | "pci-express" | "pci" | "firewire"
            | "ieee1394" | "fibre channel" | "spi" | "virtual" | "file backed virtual" => {
                BusType::Other
            }
            _ => BusType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BusType::Usb => "usb",
            BusType::Sd => "sd",
            BusType::Thunderbolt => "thunderbolt",
            BusType::Other => "other",
            BusType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Attached,
    Mounted,
    Unmounting,
    Unmounted,
    Removed,
}

impl DeviceState {
    /// Lifecycle edges:
    /// ATTACHED -> MOUNTED -> UNMOUNTING -> {UNMOUNTED, MOUNTED}, any -> REMOVED.
    pub fn can_transition_to(self, to: DeviceState) -> bool {
        use DeviceState::*;

        matches!(
            (self, to),
            (Attached, Mounted)
                | (Mounted, Unmounting)
                | (Unmounting, Unmounted)
                | (Unmounting, Mounted)
                | (_, Removed)
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Attached => "ATTACHED",
            DeviceState::Mounted => "MOUNTED",
            DeviceState::Unmounting => "UNMOUNTING",
            DeviceState::Unmounted => "UNMOUNTED",
            DeviceState::Removed => "REMOVED",
        };
        f.write_str(s)
    }
}

/// Whatever one platform scan could learn about one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDeviceInfo {
    /// Platform-stable location of the device (sysfs path, IOKit path, PnP id).
    pub bus_path: String,
    pub device_path: String,
    pub serial_number: Option<String>,
    pub volume_path: Option<String>,
    pub label: Option<String>,
    pub mount_point: Option<PathBuf>,
    pub capacity_bytes: Option<u64>,
    pub used_bytes: Option<u64>,
    pub bus_type: Option<String>,
    pub removable: bool,
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
}

/// What the ejector needs to detach one device, copied out of the
/// registry so no record outlives the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnmountTarget {
    pub id: String,
    pub mount_point: PathBuf,
    pub device_path: String,
    pub volume_path: Option<String>,
}
