/// Test utilities and a scripted platform for safe testing
use crate::probe::{DeviceProbe, ScanSink, VolumeEjector};
use crate::{DeviceError, RawDeviceInfo, UnmountError, UnmountTarget};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A raw USB stick as a Linux probe would report it. Never touches real hardware.
pub fn raw_device(name: &str, mount_point: Option<&str>) -> RawDeviceInfo {
    let node = name.to_lowercase();
    RawDeviceInfo {
        bus_path: format!("mock://usb/{}", node),
        device_path: format!("/dev/{}", node),
        serial_number: Some(format!("SERIAL-{}", name)),
        volume_path: Some(format!("/dev/{}1", node)),
        label: Some(name.to_string()),
        mount_point: mount_point.map(PathBuf::from),
        capacity_bytes: Some(16_000_000_000),
        used_bytes: Some(4_000_000_000),
        bus_type: Some("usb".to_string()),
        removable: true,
        vendor_id: Some(0x0781),
        product_id: Some(0x5581),
        product: Some("Mock Stick".to_string()),
        manufacturer: Some("Mock".to_string()),
    }
}

#[derive(Default)]
struct Script {
    devices: Vec<RawDeviceInfo>,
    scan_failure: Option<String>,
    per_device_delay: Duration,
    scan_count: usize,
    unmount_result: Option<UnmountError>,
    unmount_delay: Duration,
    flush_failure: Option<String>,
    release_failure: Option<UnmountError>,
    calls: Vec<String>,
}

/// Scripted probe and ejector. Clones share one script so a test can
/// keep a handle after giving the platform to the manager.
#[derive(Clone, Default)]
pub struct MockPlatform {
    script: Arc<Mutex<Script>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<RawDeviceInfo>) -> Self {
        let platform = Self::new();
        platform.set_devices(devices);
        platform
    }

    pub fn set_devices(&self, devices: Vec<RawDeviceInfo>) {
        self.script().devices = devices;
    }

    pub fn fail_next_scan(&self, message: &str) {
        self.script().scan_failure = Some(message.to_string());
    }

    /// Sleep before reporting each device, to exercise timeouts and
    /// coalesced polls.
    pub fn set_scan_delay(&self, per_device: Duration) {
        self.script().per_device_delay = per_device;
    }

    pub fn scan_count(&self) -> usize {
        self.script().scan_count
    }

    pub fn fail_unmount(&self, error: UnmountError) {
        self.script().unmount_result = Some(error);
    }

    pub fn set_unmount_delay(&self, delay: Duration) {
        self.script().unmount_delay = delay;
    }

    pub fn fail_flush(&self, message: &str) {
        self.script().flush_failure = Some(message.to_string());
    }

    pub fn fail_release(&self, error: UnmountError) {
        self.script().release_failure = Some(error);
    }

    /// Ejector calls in order, e.g. `flush:/media/d1`, `unmount:/dev/d11`.
    pub fn calls(&self) -> Vec<String> {
        self.script().calls.clone()
    }

    pub fn unmount_calls(&self) -> usize {
        self.script()
            .calls
            .iter()
            .filter(|call| call.starts_with("unmount:"))
            .count()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl DeviceProbe for MockPlatform {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn scan(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        let (devices, delay) = {
            let mut script = self.script();
            script.scan_count += 1;
            if let Some(message) = script.scan_failure.take() {
                return Err(DeviceError::Probe(message));
            }
            (script.devices.clone(), script.per_device_delay)
        };

        for device in devices {
            if sink.is_cancelled() {
                break;
            }
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            sink.push(device);
        }
        Ok(())
    }
}

impl VolumeEjector for MockPlatform {
    fn flush(&self, mount_point: &Path) -> std::io::Result<()> {
        let mut script = self.script();
        script.calls.push(format!("flush:{}", mount_point.display()));
        match &script.flush_failure {
            Some(message) => Err(std::io::Error::new(std::io::ErrorKind::Other, message.clone())),
            None => Ok(()),
        }
    }

    fn unmount(&self, target: &UnmountTarget) -> Result<(), UnmountError> {
        let delay = {
            let mut script = self.script();
            let node = target.volume_path.as_deref().unwrap_or(&target.device_path);
            script.calls.push(format!("unmount:{}", node));
            script.unmount_delay
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let mut script = self.script();
        match script.unmount_result.clone() {
            Some(error) => Err(error),
            None => {
                if let Some(device) = script
                    .devices
                    .iter_mut()
                    .find(|d| d.mount_point.as_deref() == Some(target.mount_point.as_path()))
                {
                    device.mount_point = None;
                }
                Ok(())
            }
        }
    }

    fn release(&self, target: &UnmountTarget) -> Result<(), UnmountError> {
        let mut script = self.script();
        script.calls.push(format!("release:{}", target.device_path));
        match script.release_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
