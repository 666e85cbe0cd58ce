use crate::{BusType, DeviceRecord, DeviceState, RawDeviceInfo};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Turn one raw platform entry into a record, reusing the id of a
/// previously known record with the same bus path and serial.
pub fn normalize(raw: RawDeviceInfo, previous: &BTreeMap<String, DeviceRecord>) -> DeviceRecord {
    let bus_type = BusType::from_platform(raw.bus_type.as_deref());
    let serial = non_empty(raw.serial_number);

    let id = previous
        .values()
        .find(|record| record.identity() == (raw.bus_path.as_str(), serial.as_deref()))
        .map(|record| record.id.clone())
        .unwrap_or_else(|| device_id(bus_type, &raw.bus_path, serial.as_deref()));

    let used_bytes = match (raw.capacity_bytes, raw.used_bytes) {
        (Some(capacity), Some(used)) if used > capacity => {
            tracing::warn!(
                device_id = %id,
                capacity,
                used,
                "platform reported more used bytes than capacity, treating usage as unknown"
            );
            None
        }
        (_, used) => used,
    };

    let mount_point = raw
        .mount_point
        .filter(|path| !path.as_os_str().is_empty());
    let state = if mount_point.is_some() {
        DeviceState::Mounted
    } else {
        DeviceState::Attached
    };

    let product = non_empty(raw.product);
    let label = non_empty(raw.label)
        .or_else(|| product.clone())
        .unwrap_or_default();

    DeviceRecord {
        id,
        label,
        mount_point,
        capacity_bytes: raw.capacity_bytes,
        used_bytes,
        bus_type,
        state,
        vendor_id: raw.vendor_id,
        product_id: raw.product_id,
        product,
        manufacturer: non_empty(raw.manufacturer),
        serial_number: serial,
        device_path: raw.device_path,
        volume_path: non_empty(raw.volume_path),
        bus_path: raw.bus_path,
    }
}

/// Deterministic id for a physical device: same inputs, same id, in this
/// process and any other.
pub fn device_id(bus_type: BusType, bus_path: &str, serial: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bus_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(serial.unwrap_or_default().as_bytes());
    let digest = hex::encode(hasher.finalize());

    format!("{}-{}", bus_type.as_str(), &digest[..16])
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
