pub mod device;
mod eject;

use crate::unix::flush_mount;
use device::LinuxScanner;
use std::path::Path;
use subdevil_core::{DeviceError, DeviceProbe, ScanSink, UnmountError, UnmountTarget, VolumeEjector};

/// Removable storage on Linux: lsblk and sysfs for discovery, umount2
/// with a udisks fallback for detaching.
#[derive(Default)]
pub struct LinuxProbe {
    scanner: LinuxScanner,
}

impl DeviceProbe for LinuxProbe {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn scan(&self, sink: &ScanSink) -> Result<(), DeviceError> {
        self.scanner.scan(sink)
    }
}

impl VolumeEjector for LinuxProbe {
    fn flush(&self, mount_point: &Path) -> std::io::Result<()> {
        flush_mount(mount_point)
    }

    fn unmount(&self, target: &UnmountTarget) -> Result<(), UnmountError> {
        eject::unmount(target)
    }

    fn release(&self, target: &UnmountTarget) -> Result<(), UnmountError> {
        eject::release(target)
    }
}
